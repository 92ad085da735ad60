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

//! Per-thread statistics buffers. In the original tool these are mapped
//! into a `/lancet-stats<tid>` shared-memory segment so the coordinator
//! process can read them directly; here the agent is single-process and
//! multi-threaded instead, so the same cross-thread visibility is had
//! more plainly with `Arc<SharedCounters>` (see the single-process
//! simplification recorded in DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MAX_PER_THREAD_SAMPLES: usize = 131_072;
pub const MAX_PER_THREAD_TX_SAMPLES: usize = 4096;

/// The subset of a thread's statistics the coordinator-facing acceptor
/// needs to answer `REPORT_REQ` without touching the worker thread's own
/// mutable ring buffers. Updated alongside `PerThreadStats` on every
/// sample; read (summed across threads) by `agent::run`'s report closure.
#[derive(Default)]
pub struct SharedCounters {
    tx_bytes: AtomicU64,
    tx_reqs: AtomicU64,
    rx_bytes: AtomicU64,
    rx_reqs: AtomicU64,
    latency_samples: AtomicU64,
    dropped_timestamp_mismatches: AtomicU64,
}

impl SharedCounters {
    pub fn new() -> Arc<SharedCounters> {
        Arc::new(SharedCounters::default())
    }

    fn reset(&self) {
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_reqs.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.rx_reqs.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
        self.dropped_timestamp_mismatches.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SharedCountersSnapshot {
        SharedCountersSnapshot {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_reqs: self.tx_reqs.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_reqs: self.rx_reqs.load(Ordering::Relaxed),
            latency_samples: self.latency_samples.load(Ordering::Relaxed),
            dropped_timestamp_mismatches: self.dropped_timestamp_mismatches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SharedCountersSnapshot {
    pub tx_bytes: u64,
    pub tx_reqs: u64,
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub latency_samples: u64,
    pub dropped_timestamp_mismatches: u64,
}

impl SharedCountersSnapshot {
    pub fn merge(&mut self, other: &SharedCountersSnapshot) {
        self.tx_bytes += other.tx_bytes;
        self.tx_reqs += other.tx_reqs;
        self.rx_bytes += other.rx_bytes;
        self.rx_reqs += other.rx_reqs;
        self.latency_samples += other.latency_samples;
        self.dropped_timestamp_mismatches += other.dropped_timestamp_mismatches;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ByteReqCounters {
    pub bytes: u64,
    pub reqs: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThroughputStats {
    pub rx: ByteReqCounters,
    pub tx: ByteReqCounters,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LatSample {
    pub nsec: u64,
    pub tx: libc::timespec,
}

/// Ring of tx-to-tx gaps, subsampled at a fixed 1% rate. The source
/// increments its ring index unconditionally before checking whether the
/// gap computation succeeded, which thins the ring with stale zero
/// entries whenever the previous timestamp hadn't been set yet. Here the
/// index only advances on a successful diff.
pub struct TxSamples {
    pub ring: Vec<i64>,
    write_idx: usize,
    count: usize,
    prev_tx: Option<libc::timespec>,
    selector: u64,
}

impl TxSamples {
    pub fn new() -> TxSamples {
        TxSamples {
            ring: vec![0; MAX_PER_THREAD_TX_SAMPLES],
            write_idx: 0,
            count: 0,
            prev_tx: None,
            selector: 0,
        }
    }

    /// Called on every tx completion; subsamples at ~1% internally.
    pub fn add(&mut self, ts: libc::timespec) {
        self.selector += 1;
        if self.selector % 100 != 0 {
            self.prev_tx = Some(ts);
            return;
        }
        if let Some(prev) = self.prev_tx {
            if let Some(diff) = crate::misc::timespec_diff_ns(&ts, &prev) {
                self.ring[self.write_idx % MAX_PER_THREAD_TX_SAMPLES] = diff;
                self.write_idx += 1;
                self.count += 1;
            }
        }
        self.prev_tx = Some(ts);
    }

    pub fn len(&self) -> usize {
        self.count.min(MAX_PER_THREAD_TX_SAMPLES)
    }
}

pub struct LatencyStats {
    pub throughput: ThroughputStats,
    pub samples: Vec<LatSample>,
    pub inc_idx: u64,
    sampling_rate: f64,
    draw_counter: u64,
}

impl LatencyStats {
    pub fn new(sampling_rate: f64) -> LatencyStats {
        LatencyStats {
            throughput: ThroughputStats::default(),
            samples: vec![LatSample::default(); MAX_PER_THREAD_SAMPLES],
            inc_idx: 0,
            sampling_rate: sampling_rate.max(f64::MIN_POSITIVE),
            draw_counter: 0,
        }
    }

    /// Subsamples at `1/sampling_rate` and writes into the overwrite-oldest
    /// ring, incrementing the monotonic `inc_idx` only when a sample is
    /// actually recorded. Returns whether this call recorded a sample, so
    /// callers can keep an external counter in sync without duplicating the
    /// subsampling decision.
    pub fn add_latency_sample(&mut self, nsec: u64, tx: Option<libc::timespec>) -> bool {
        let every = (1.0 / self.sampling_rate).round().max(1.0) as u64;
        self.draw_counter += 1;
        if self.draw_counter % every != 0 {
            return false;
        }
        let idx = (self.inc_idx as usize) % MAX_PER_THREAD_SAMPLES;
        self.samples[idx] = LatSample { nsec, tx: tx.unwrap_or(libc::timespec { tv_sec: 0, tv_nsec: 0 }) };
        self.inc_idx += 1;
        true
    }

    pub fn recorded_count(&self) -> usize {
        (self.inc_idx as usize).min(MAX_PER_THREAD_SAMPLES)
    }
}

pub struct PerThreadStats {
    pub throughput: ThroughputStats,
    pub latency: Option<LatencyStats>,
    pub tx_samples: TxSamples,
    dropped_timestamp_mismatches: u64,
    shared: Arc<SharedCounters>,
}

impl PerThreadStats {
    pub fn new(is_latency_role: bool, sampling_rate: f64) -> PerThreadStats {
        PerThreadStats {
            throughput: ThroughputStats::default(),
            latency: if is_latency_role { Some(LatencyStats::new(sampling_rate)) } else { None },
            tx_samples: TxSamples::new(),
            dropped_timestamp_mismatches: 0,
            shared: SharedCounters::new(),
        }
    }

    /// Like `new`, but updates `shared` instead of a freshly-allocated
    /// counters block. `agent::run` keeps the other end of `shared` to sum
    /// across worker threads when answering `REPORT_REQ`.
    pub fn with_shared(is_latency_role: bool, sampling_rate: f64, shared: Arc<SharedCounters>) -> PerThreadStats {
        let mut stats = PerThreadStats::new(is_latency_role, sampling_rate);
        stats.shared = shared;
        stats
    }

    /// A clone of the `Arc` a worker thread updates on every sample; the
    /// coordinator-facing acceptor thread holds one of these per worker and
    /// sums their snapshots to answer `REPORT_REQ`.
    pub fn shared_handle(&self) -> Arc<SharedCounters> {
        Arc::clone(&self.shared)
    }

    pub fn add_throughput_tx_sample(&mut self, bytes: u64, reqs: u64) {
        self.throughput.tx.bytes += bytes;
        self.throughput.tx.reqs += reqs;
        self.shared.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.shared.tx_reqs.fetch_add(reqs, Ordering::Relaxed);
    }

    pub fn add_throughput_rx_sample(&mut self, bytes: u64, reqs: u64) {
        self.throughput.rx.bytes += bytes;
        self.throughput.rx.reqs += reqs;
        self.shared.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.shared.rx_reqs.fetch_add(reqs, Ordering::Relaxed);
    }

    pub fn add_latency_sample(&mut self, nsec: u64, tx: Option<libc::timespec>) {
        if let Some(lat) = self.latency.as_mut() {
            if lat.add_latency_sample(nsec, tx) {
                self.shared.latency_samples.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn add_tx_timestamp(&mut self, ts: libc::timespec) {
        self.tx_samples.add(ts);
    }

    pub fn drop_timestamp_mismatch(&mut self) {
        self.dropped_timestamp_mismatches += 1;
        self.shared.dropped_timestamp_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_timestamp_mismatches(&self) -> u64 {
        self.dropped_timestamp_mismatches
    }

    pub fn reset(&mut self) {
        self.throughput = ThroughputStats::default();
        if let Some(lat) = self.latency.as_mut() {
            *lat = LatencyStats::new(lat.sampling_rate);
        }
        self.tx_samples = TxSamples::new();
        self.dropped_timestamp_mismatches = 0;
        self.shared.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_counters_accumulate() {
        let mut s = PerThreadStats::new(false, 1.0);
        s.add_throughput_tx_sample(64, 1);
        s.add_throughput_tx_sample(64, 1);
        assert_eq!(s.throughput.tx.bytes, 128);
        assert_eq!(s.throughput.tx.reqs, 2);
    }

    #[test]
    fn latency_ring_caps_at_capacity_and_inc_idx_is_monotonic() {
        let mut lat = LatencyStats::new(1.0);
        for i in 0..(MAX_PER_THREAD_SAMPLES + 10) {
            lat.add_latency_sample(i as u64, None);
        }
        assert_eq!(lat.recorded_count(), MAX_PER_THREAD_SAMPLES);
        assert_eq!(lat.inc_idx as usize, MAX_PER_THREAD_SAMPLES + 10);
    }

    #[test]
    fn tx_sample_ring_only_advances_on_successful_diff() {
        let mut tx = TxSamples::new();
        // 100 calls at 1% subsampling rate yields exactly one sampled tick;
        // since there is no prior timestamp on the very first sampled tick,
        // no ring slot should be written yet.
        for i in 0..100 {
            tx.add(libc::timespec { tv_sec: i, tv_nsec: 0 });
        }
        assert_eq!(tx.len(), 0);
        for i in 100..300 {
            tx.add(libc::timespec { tv_sec: i, tv_nsec: 0 });
        }
        assert!(tx.len() >= 1);
    }
}
