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

//! Kernel-assisted timestamping: NIC hardware timestamping setup and the
//! `MSG_ERRQUEUE`/`SO_TIMESTAMPING` tx-timestamp recovery path, plus the
//! per-connection pending-timestamp ring that matches tx completions
//! (identified by OPT_ID, the cumulative tx byte count) to the replies
//! that later arrive for them.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use log::{info, warn};

use crate::error::{LancetError, Result};

/// `ioctl(SIOCSHWTSTAMP)` request layout (`linux/sockios.h`'s `ifreq` with
/// the union's `ifr_data` pointing at `linux/net_tstamp.h`'s
/// `hwtstamp_config`). Not exposed by `libc` on every target, so mirrored
/// here field-for-field.
#[repr(C)]
struct HwtstampConfig {
    flags: libc::c_int,
    tx_type: libc::c_int,
    rx_filter: libc::c_int,
}

#[repr(C)]
struct IfreqHwtstamp {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;
const HWTSTAMP_TX_ON: libc::c_int = 1;
const HWTSTAMP_FILTER_ALL: libc::c_int = 1;

#[derive(Clone, Copy, Debug)]
pub struct TimestampInfo {
    pub time: libc::timespec,
    pub optid: u32,
}

/// Per-connection ring of pending tx timestamps. `head` counts enqueued
/// sends awaiting a timestamp, `tail` counts sends whose timestamp has
/// arrived from the error queue, `consumed` counts sends matched against
/// a reply. Invariant: `consumed <= tail <= head` and `head - consumed <=
/// capacity`.
pub struct PendingTxTimestamps {
    tx_byte_counter: u64,
    slots: VecDeque<TimestampInfo>,
    head: u64,
    tail: u64,
    consumed: u64,
    capacity: usize,
}

impl PendingTxTimestamps {
    pub fn new(capacity: usize) -> PendingTxTimestamps {
        PendingTxTimestamps {
            tx_byte_counter: 0,
            slots: VecDeque::with_capacity(capacity),
            head: 0,
            tail: 0,
            consumed: 0,
            capacity,
        }
    }

    pub fn head(&self) -> u64 {
        self.head
    }
    pub fn tail(&self) -> u64 {
        self.tail
    }
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Call on every send completion with the number of bytes written;
    /// advances `tx_byte_counter` and enqueues a slot keyed by the new
    /// cumulative count (the OPT_ID the kernel will echo back).
    pub fn add_pending(&mut self, bytes: u64) {
        self.tx_byte_counter += bytes;
        self.slots.push_back(TimestampInfo {
            time: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            optid: self.tx_byte_counter as u32,
        });
        self.head += 1;
    }

    /// Applies one `(optid, ts)` pair drained from the error queue to
    /// every still-untimestamped slot whose optid is `<= optid + 1`; a
    /// later timestamp may legitimately cover several earlier unmatched
    /// slots at once (kernel coalesces completions), so this is a
    /// worst-case upper bound on delay by design, not a bug.
    pub fn apply_timestamp(&mut self, optid: u32, ts: libc::timespec) {
        let tail_idx = (self.tail - (self.head - self.slots.len() as u64)) as usize;
        let mut idx = tail_idx;
        while idx < self.slots.len() {
            if self.slots[idx].optid <= optid.saturating_add(1) {
                self.slots[idx].time = ts;
                self.tail += 1;
                idx += 1;
            } else {
                break;
            }
        }
    }

    /// Pops one matched (timestamped) slot if available.
    pub fn pop(&mut self) -> Option<TimestampInfo> {
        if self.consumed >= self.tail {
            return None;
        }
        let front = self.slots.pop_front()?;
        self.consumed += 1;
        Some(front)
    }

    pub fn invariants_hold(&self) -> bool {
        self.consumed <= self.tail
            && self.tail <= self.head
            && (self.head - self.consumed) as usize <= self.capacity
    }
}

/// Datagram mode skips OPT_ID matching entirely: each socket carries at
/// most one outstanding timestamp.
pub fn push_complete_tx_timestamp(slot: &mut Option<libc::timespec>, ts: libc::timespec) {
    *slot = Some(ts);
}

/// Issues `ioctl(SIOCSHWTSTAMP, HWTSTAMP_TX_ON | HWTSTAMP_FILTER_ALL)`
/// against `if_name`. The call needs `CAP_NET_ADMIN` and driver support;
/// when either is missing the kernel returns `EPERM`/`EOPNOTSUPP`, which is
/// logged and treated as "continue on software timestamps" rather than a
/// fatal error, since a symmetric-nic agent can still make progress with
/// degraded (software) timestamps.
pub fn enable_nic_timestamping(if_name: &str) -> Result<()> {
    if if_name.is_empty() {
        return Err(LancetError::Config(
            "NIC timestamping requires an interface name (-n)".into(),
        ));
    }
    if if_name.len() >= libc::IFNAMSIZ {
        return Err(LancetError::Config(format!(
            "interface name '{}' is too long for ifreq",
            if_name
        )));
    }

    let mut cfg = HwtstampConfig {
        flags: 0,
        tx_type: HWTSTAMP_TX_ON,
        rx_filter: HWTSTAMP_FILTER_ALL,
    };
    let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, src) in ifr_name.iter_mut().zip(if_name.bytes()) {
        *dst = src as libc::c_char;
    }
    let mut ifr = IfreqHwtstamp {
        ifr_name,
        ifr_data: &mut cfg as *mut HwtstampConfig as *mut libc::c_void,
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(LancetError::Io(std::io::Error::last_os_error()));
    }
    let ret = unsafe { libc::ioctl(fd, SIOCSHWTSTAMP as _, &mut ifr as *mut IfreqHwtstamp) };
    let ioctl_err = if ret != 0 { Some(std::io::Error::last_os_error()) } else { None };
    unsafe {
        libc::close(fd);
    }

    match ioctl_err {
        Some(e) => {
            warn!(
                "SIOCSHWTSTAMP on {} failed ({}); continuing with software timestamps",
                if_name, e
            );
        }
        None => info!("NIC hardware timestamping enabled on {}", if_name),
    }
    Ok(())
}

pub fn sock_enable_timestamping(fd: RawFd) -> Result<()> {
    let flags: libc::c_int = libc::SOF_TIMESTAMPING_RX_HARDWARE
        | libc::SOF_TIMESTAMPING_RAW_HARDWARE
        | libc::SOF_TIMESTAMPING_TX_HARDWARE
        | libc::SOF_TIMESTAMPING_OPT_TSONLY
        | libc::SOF_TIMESTAMPING_OPT_ID;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(LancetError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Drains one tx completion timestamp from `fd`'s socket error queue
/// (`recvmsg(..., MSG_ERRQUEUE)`), the kernel delivery path `SO_TIMESTAMPING`
/// enables. Returns `Ok(None)` when the queue is empty (`EAGAIN` on a
/// nonblocking socket); the caller loops this to drain everything pending
/// on a given poll tick. The OPT_ID the kernel echoes back rides in the
/// `IP_RECVERR`/`IPV6_RECVERR` extended-error cmsg's `ee_data`; the actual
/// timestamp rides in a separate `SCM_TIMESTAMPING` cmsg as three
/// `timespec`s (software, deprecated, hardware raw) — index 2 is the one
/// hardware timestamping fills in.
pub fn recv_tx_timestamp(fd: RawFd) -> Result<Option<TimestampInfo>> {
    let mut discard = [0u8; 256];
    let mut cmsg_buf = [0u8; 512];
    let mut iov = libc::iovec {
        iov_base: discard.as_mut_ptr() as *mut libc::c_void,
        iov_len: discard.len(),
    };
    let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    msghdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msghdr.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(fd, &mut msghdr, libc::MSG_ERRQUEUE) };
    if n < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(LancetError::Io(err));
    }

    let mut time = None;
    let mut optid = 0u32;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msghdr);
        while !cmsg.is_null() {
            let hdr = &*cmsg;
            if hdr.cmsg_level == libc::SOL_SOCKET && hdr.cmsg_type == libc::SCM_TIMESTAMPING {
                let stamps = libc::CMSG_DATA(cmsg) as *const libc::timespec;
                time = Some(*stamps.add(2));
            } else if hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR {
                let ee = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
                optid = (*ee).ee_data;
            }
            cmsg = libc::CMSG_NXTHDR(&msghdr, cmsg);
        }
    }

    Ok(time.map(|time| TimestampInfo { time, optid }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_invariants_hold_through_send_match_pop_cycle() {
        let mut ring = PendingTxTimestamps::new(8);
        ring.add_pending(100);
        ring.add_pending(200);
        ring.add_pending(300);
        assert!(ring.invariants_hold());
        assert_eq!(ring.head(), 3);

        ring.apply_timestamp(600, libc::timespec { tv_sec: 1, tv_nsec: 0 });
        assert_eq!(ring.tail(), 3);
        assert!(ring.invariants_hold());

        for _ in 0..3 {
            let popped = ring.pop().expect("slot should be matched");
            assert_eq!(popped.time.tv_sec, 1);
        }
        assert!(ring.pop().is_none());
        assert!(ring.invariants_hold());
    }

    #[test]
    fn later_timestamp_covers_multiple_earlier_unmatched_slots() {
        // Scenario 6: sizes 100, 200, 300 -> optids 100, 300, 600. A single
        // error-queue delivery for optid=600 fills all three.
        let mut ring = PendingTxTimestamps::new(8);
        ring.add_pending(100);
        ring.add_pending(200);
        ring.add_pending(300);
        ring.apply_timestamp(600, libc::timespec { tv_sec: 42, tv_nsec: 0 });
        assert_eq!(ring.tail() - 0, 3);
    }
}
