/* Copyright (c) 2019 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! Agent bootstrap: parses configuration, builds the shared control
//! block, spawns one worker thread per configured thread count (pinned to
//! a CPU core each, mirroring the original's `pthread_setaffinity_np`
//! placement), and runs the coordinator-facing acceptor on the calling
//! thread.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use log::{error, info};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::app_proto::Protocol;
use crate::config::AgentConfig;
use crate::control::{AgentRole, ControlBlock};
use crate::coordinator::{self, ReportBody};
use crate::error::{LancetError, Result};
use crate::misc::unix_time_secs;
use crate::rand_gen::{DistKind, Distribution};
use crate::stats::{PerThreadStats, SharedCounters, SharedCountersSnapshot};
use crate::transport::{self, Transport, WorkerContext};
use std::sync::Mutex;

const COORDINATOR_PORT: u16 = 5100;

pub fn run(config: AgentConfig) -> Result<()> {
    let role = AgentRole::from_code(config.role)?;
    let transport = Transport::parse(&config.transport)?;
    let idist = DistKind::parse(&config.idist)?;

    let control = Arc::new(ControlBlock::new(config.threads, role, idist, config.sampling));
    let start_barrier = Arc::new(Barrier::new(config.threads as usize));
    let sample_totals = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(config.threads as usize);
    let mut shared_counters = Vec::with_capacity(config.threads as usize);
    for thread_idx in 0..config.threads {
        let control = Arc::clone(&control);
        let barrier = Arc::clone(&start_barrier);
        let sample_totals = Arc::clone(&sample_totals);
        let targets = config.targets.clone();
        let connections = config.connections;
        let app_proto_spec = config.app_proto.clone();
        let if_name = config.if_name.clone();
        let pending = config.pending;
        let shared = SharedCounters::new();
        shared_counters.push(Arc::clone(&shared));

        let handle = thread::Builder::new()
            .name(format!("lancet-worker-{}", thread_idx))
            .spawn(move || {
                pin_to_cpu(thread_idx);
                barrier.wait();
                if let Err(e) = worker_main(
                    thread_idx,
                    control,
                    transport,
                    targets,
                    connections,
                    role,
                    &app_proto_spec,
                    if_name,
                    pending,
                    &sample_totals,
                    shared,
                ) {
                    error!("worker {} exited: {}", thread_idx, e);
                }
            })
            .map_err(LancetError::Io)?;
        handles.push(handle);
    }

    info!("agent started with {} worker thread(s), role {:?}", config.threads, role);
    run_coordinator_acceptor(Arc::clone(&control), shared_counters)?;

    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

/// Thread 0 runs on the spawning thread's own affinity in the source; here
/// every worker (including the conceptual "thread 0") is a spawned thread
/// so the coordinator acceptor can own the main thread instead.
fn pin_to_cpu(thread_idx: u32) {
    let mut set = CpuSet::new();
    if set.set(thread_idx as usize).is_ok() {
        let _ = sched_setaffinity(Pid::from_raw(0), &set);
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_main(
    thread_idx: u32,
    control: Arc<ControlBlock>,
    transport_kind: Transport,
    targets: Vec<SocketAddr>,
    connections_per_target: usize,
    role: AgentRole,
    app_proto_spec: &str,
    if_name: Option<String>,
    pending_cap: usize,
    sample_totals: &Arc<AtomicU64>,
    shared: Arc<SharedCounters>,
) -> Result<()> {
    let seed = unix_time_secs() ^ (thread_idx as u64).wrapping_mul(0x9E3779B97F4A7C15);
    let mut proto = Protocol::parse(app_proto_spec, seed)?;
    let mut idist = Distribution::new(control.idist(), seed);
    let mut stats = PerThreadStats::with_shared(
        role == AgentRole::Latency || role == AgentRole::Symmetric,
        control.sampling(),
        shared,
    );

    let ctx = WorkerContext {
        targets,
        connections_per_target,
        role,
        control: Arc::clone(&control),
        idist_seed: seed,
        if_name,
        pending_cap,
    };

    while !control.should_load() {
        thread::sleep(std::time::Duration::from_millis(5));
    }
    idist.refresh(control.idist());

    transport::run(transport_kind, &ctx, &mut idist, &mut proto, &mut stats)?;
    sample_totals.fetch_add(control.record_sample(), Ordering::Relaxed);
    Ok(())
}

/// Sums the live `SharedCounters` of every worker thread into one
/// `ReportBody`; held behind a `Mutex` only because `TcpListener::incoming`
/// hands the acceptor loop one connection at a time on the same thread; the
/// mutex is never contended.
fn run_coordinator_acceptor(control: Arc<ControlBlock>, shared_counters: Vec<Arc<SharedCounters>>) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], COORDINATOR_PORT)))?;
    info!("coordinator acceptor listening on :{}", COORDINATOR_PORT);
    let shared_counters = Arc::new(Mutex::new(shared_counters));
    for incoming in listener.incoming() {
        let mut stream = incoming?;
        let control = Arc::clone(&control);
        let shared_counters = Arc::clone(&shared_counters);
        let report = move || {
            let counters = shared_counters.lock().expect("shared counters mutex poisoned");
            let mut total = SharedCountersSnapshot::default();
            for c in counters.iter() {
                total.merge(&c.snapshot());
            }
            ReportBody {
                tx_bytes: total.tx_bytes,
                tx_reqs: total.tx_reqs,
                rx_bytes: total.rx_bytes,
                rx_reqs: total.rx_reqs,
                latency_samples: total.latency_samples,
                dropped_timestamp_mismatches: total.dropped_timestamp_mismatches,
            }
        };
        if let Err(e) = coordinator::serve(&mut stream, &control, &report) {
            error!("coordinator session ended: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_to_cpu_does_not_panic_on_an_out_of_range_index() {
        pin_to_cpu(10_000);
    }
}
