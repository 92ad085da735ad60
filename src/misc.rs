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

//! Small time helpers shared by the scheduler, transports and timestamping
//! code. Mirrors the original tool's `time_ns`/`time_ns_to_ts` pair so the
//! rest of the crate can talk in plain nanoseconds while still being able to
//! hand the kernel a `timespec` when a syscall needs one.

use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-ish wall clock reading in nanoseconds. Real deployments read
/// `CLOCK_MONOTONIC` via `clock_gettime`; we go through `nix` at the call
/// sites that need raw `timespec`s and keep this helper for the scheduler's
/// plain `i64` arithmetic.
pub fn time_ns() -> i64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec() * 1_000_000_000 + ts.tv_nsec()
}

pub fn time_ns_to_timespec() -> libc::timespec {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC) failed");
    libc::timespec {
        tv_sec: ts.tv_sec(),
        tv_nsec: ts.tv_nsec(),
    }
}

/// Wall-clock seconds since epoch, used only to seed per-thread RNGs the way
/// the original agent seeds `srand(time(NULL) + thread_idx * 12345)`.
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

pub fn timespec_diff_ns(a: &libc::timespec, b: &libc::timespec) -> Option<i64> {
    if a.tv_sec == 0 && a.tv_nsec == 0 {
        return None;
    }
    if b.tv_sec == 0 && b.tv_nsec == 0 {
        return None;
    }
    let mut sec = a.tv_sec - b.tv_sec;
    let mut nsec = a.tv_nsec - b.tv_nsec;
    if nsec < 0 {
        nsec += 1_000_000_000;
        sec -= 1;
    }
    Some(sec * 1_000_000_000 + nsec)
}
