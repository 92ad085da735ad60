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

//! The shared control block. In the original tool this lives in a
//! `/lancetcontrol` POSIX shared-memory segment so the coordinator process
//! can flip load/measure flags and push a new inter-arrival distribution
//! without restarting the agent; worker threads poll it read-only. Here it
//! is an in-process `Arc`-shared structure instead (see DESIGN.md's
//! single-process shared-memory resolution) built the same way: one writer
//! (the coordinator-facing thread),
//! many readers (the worker threads), plain atomics for the scalar flags
//! and a `spin::RwLock` around the embedded distribution kind.
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::RwLock;

use crate::error::{LancetError, Result};
use crate::rand_gen::DistKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentRole {
    Throughput,
    Latency,
    Symmetric,
    SymmetricNic,
}

impl AgentRole {
    pub fn from_code(code: u32) -> Result<AgentRole> {
        match code {
            0 => Ok(AgentRole::Throughput),
            1 => Ok(AgentRole::Latency),
            2 => Ok(AgentRole::Symmetric),
            3 => Ok(AgentRole::SymmetricNic),
            other => Err(LancetError::Config(format!("unknown agent role code {}", other))),
        }
    }
}

/// Shared between the coordinator-facing thread (writer) and every worker
/// thread (readers). Workers never hold a reference to this across a
/// blocking syscall; they snapshot the fields they need once per
/// scheduling iteration.
pub struct ControlBlock {
    should_load: AtomicBool,
    should_measure: AtomicBool,
    thread_count: AtomicU32,
    agent_role: AtomicU32,
    per_thread_samples: AtomicU64,
    sampling: RwLock<f64>,
    idist: RwLock<DistKind>,
}

impl ControlBlock {
    pub fn new(thread_count: u32, agent_role: AgentRole, idist: DistKind, sampling: f64) -> ControlBlock {
        ControlBlock {
            should_load: AtomicBool::new(false),
            should_measure: AtomicBool::new(false),
            thread_count: AtomicU32::new(thread_count),
            agent_role: AtomicU32::new(agent_role as u32),
            per_thread_samples: AtomicU64::new(0),
            sampling: RwLock::new(sampling),
            idist: RwLock::new(idist),
        }
    }

    pub fn should_load(&self) -> bool {
        self.should_load.load(Ordering::Acquire)
    }

    pub fn should_measure(&self) -> bool {
        self.should_measure.load(Ordering::Acquire)
    }

    pub fn start_load(&self) {
        self.should_load.store(true, Ordering::Release);
    }

    pub fn stop_load(&self) {
        self.should_load.store(false, Ordering::Release);
        self.should_measure.store(false, Ordering::Release);
    }

    pub fn start_measure(&self) {
        self.should_measure.store(true, Ordering::Release);
    }

    pub fn stop_measure(&self) {
        self.should_measure.store(false, Ordering::Release);
    }

    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Relaxed)
    }

    pub fn agent_role(&self) -> AgentRole {
        AgentRole::from_code(self.agent_role.load(Ordering::Relaxed)).expect("stored role is always valid")
    }

    pub fn sampling(&self) -> f64 {
        *self.sampling.read()
    }

    pub fn idist(&self) -> DistKind {
        *self.idist.read()
    }

    pub fn record_sample(&self) -> u64 {
        self.per_thread_samples.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn sample_count(&self) -> u64 {
        self.per_thread_samples.load(Ordering::Relaxed)
    }

    /// Pushes a new open-loop arrival rate by converting requests/sec into
    /// the mean of the underlying inter-arrival distribution; only
    /// `Fixed`/`Exponential` kinds accept an average (see `DistKind::set_avg`).
    pub fn set_load(&self, rps: f64) -> Result<()> {
        if rps <= 0.0 {
            return Err(LancetError::Config(format!("load rate must be positive, got {}", rps)));
        }
        let mean_us = 1_000_000.0 / rps;
        let mut guard = self.idist.write();
        guard.set_avg(mean_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_measure_flags_are_independent_until_stop_load_clears_both() {
        let cb = ControlBlock::new(4, AgentRole::Throughput, DistKind::Fixed(100.0), 1.0);
        assert!(!cb.should_load());
        cb.start_load();
        cb.start_measure();
        assert!(cb.should_load());
        assert!(cb.should_measure());
        cb.stop_load();
        assert!(!cb.should_load());
        assert!(!cb.should_measure());
    }

    #[test]
    fn set_load_converts_rps_to_distribution_mean() {
        let cb = ControlBlock::new(1, AgentRole::Latency, DistKind::Exponential { lambda: 1.0 }, 1.0);
        cb.set_load(1000.0).unwrap();
        match cb.idist() {
            DistKind::Exponential { lambda } => assert!((lambda - 1000.0 / 1_000_000.0).abs() < 1e-9),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn set_load_rejects_fixed_distribution_mismatch_is_not_possible_here() {
        let cb = ControlBlock::new(1, AgentRole::Throughput, DistKind::RoundRobin { max: 4 }, 1.0);
        assert!(cb.set_load(500.0).is_err());
    }

    #[test]
    fn role_round_trips_through_code() {
        assert_eq!(AgentRole::from_code(2).unwrap(), AgentRole::Symmetric);
        assert!(AgentRole::from_code(9).is_err());
    }
}
