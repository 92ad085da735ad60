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

//! TLS transport engine: same per-role scheduling shape as the plain TCP
//! engine, layered over an `openssl::ssl::SslStream`. `SslStream` doesn't
//! implement `mio::Evented`, so every role here drives its connection set
//! with a nonblocking poll-and-sleep loop instead of `tcp.rs`'s
//! readiness-set `mio::Poll`; the scheduling (deadlines, idist refresh,
//! per-connection fault isolation) matches it exactly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::warn;
use openssl::ssl::{SslConnector, SslMethod, SslStream};

use crate::app_proto::Protocol;
use crate::control::AgentRole;
use crate::error::{LancetError, Result};
use crate::misc::time_ns;
use crate::rand_gen::Distribution;
use crate::stats::PerThreadStats;
use crate::timestamping::PendingTxTimestamps;

use super::{WorkerContext, MAX_OUTSTANDING_PER_CONN, READ_TIMEOUT};

/// Matches `original_source/inc/lancet/tp_proto.h`'s `MAX_PAYLOAD`.
const MAX_PAYLOAD: usize = 16_384;

/// See `tcp.rs`'s identical constant; same rationale.
const IDIST_REFRESH_EVERY: u32 = 64;

struct Conn {
    stream: SslStream<TcpStream>,
    recv_buf: Vec<u8>,
    recv_len: usize,
    outstanding: usize,
    tx_ring: PendingTxTimestamps,
    closed: bool,
}

impl Conn {
    fn new(stream: SslStream<TcpStream>, pending_cap: usize) -> Conn {
        Conn {
            stream,
            recv_buf: vec![0u8; MAX_PAYLOAD],
            recv_len: 0,
            outstanding: 0,
            tx_ring: PendingTxTimestamps::new(pending_cap),
            closed: false,
        }
    }

    /// Same partial-response handling as `tcp.rs::Conn::drain`: read
    /// whatever is ready, hand the accumulated buffer to the reducer, and
    /// slide any unconsumed tail back to the front.
    fn drain(&mut self, proto: &mut Protocol, stats: &mut PerThreadStats) -> Result<usize> {
        let n = match self.stream.read(&mut self.recv_buf[self.recv_len..]) {
            Ok(0) => {
                return Err(LancetError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "tls peer closed",
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(LancetError::Io(e)),
        };
        self.recv_len += n;
        if self.recv_len > MAX_PAYLOAD {
            return Err(LancetError::Proto("response buffer exceeded max payload".into()));
        }

        let result = proto.consume_response(&self.recv_buf[..self.recv_len])?;
        if result.reqs > 0 {
            stats.add_throughput_rx_sample(result.bytes as u64, result.reqs as u64);
            self.outstanding = self.outstanding.saturating_sub(result.reqs);
            let leftover = self.recv_len - result.bytes;
            self.recv_buf.copy_within(result.bytes..self.recv_len, 0);
            self.recv_len = leftover;
        }
        Ok(n)
    }

    fn send(&mut self, proto: &mut Protocol, stats: &mut PerThreadStats) -> Result<()> {
        let req = proto.create_request();
        for segment in &req.segments {
            self.stream.write_all(segment)?;
        }
        self.outstanding += 1;
        stats.add_throughput_tx_sample(req.total_len() as u64, 1);
        Ok(())
    }
}

fn drain_isolating_faults(conns: &mut [Conn], idx: usize, proto: &mut Protocol, stats: &mut PerThreadStats) {
    if let Err(e) = conns[idx].drain(proto, stats) {
        warn!("tls connection {} closed: {}", idx, e);
        conns[idx].closed = true;
    }
}

fn send_isolating_faults(conns: &mut [Conn], idx: usize, proto: &mut Protocol, stats: &mut PerThreadStats) {
    if let Err(e) = conns[idx].send(proto, stats) {
        warn!("tls connection {} send failed: {}", idx, e);
        conns[idx].closed = true;
    }
}

fn open_connections(ctx: &WorkerContext, nonblocking: bool) -> Result<Vec<Conn>> {
    let connector = SslConnector::builder(SslMethod::tls())
        .map_err(|e| LancetError::Config(format!("tls connector setup failed: {}", e)))?
        .build();

    let mut conns = Vec::with_capacity(ctx.targets.len() * ctx.connections_per_target);
    for target in &ctx.targets {
        for _ in 0..ctx.connections_per_target {
            let tcp = TcpStream::connect(target)?;
            tcp.set_nodelay(true)?;
            if !nonblocking {
                tcp.set_read_timeout(Some(READ_TIMEOUT))?;
            }
            let domain = target.ip().to_string();
            let stream = connector
                .connect(&domain, tcp)
                .map_err(|e| LancetError::Config(format!("tls handshake failed: {}", e)))?;
            if nonblocking {
                stream.get_ref().set_nonblocking(true)?;
            }
            conns.push(Conn::new(stream, ctx.pending_cap));
        }
    }
    if conns.is_empty() {
        return Err(LancetError::Config("no targets configured for tls transport".into()));
    }
    Ok(conns)
}

pub fn run(
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
) -> Result<()> {
    match ctx.role {
        AgentRole::Latency => run_latency(ctx, idist, proto, stats),
        AgentRole::Throughput => run_throughput(ctx, idist, proto, stats),
        AgentRole::Symmetric => run_symmetric(ctx, idist, proto, stats, false),
        AgentRole::SymmetricNic => run_symmetric(ctx, idist, proto, stats, true),
    }
}

fn run_latency(
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
) -> Result<()> {
    let mut conns = open_connections(ctx, false)?;
    let mut cursor = 0usize;
    let mut since_refresh = 0u32;

    while ctx.control.should_load() {
        if since_refresh >= IDIST_REFRESH_EVERY {
            idist.refresh(ctx.control.idist());
            since_refresh = 0;
        }
        since_refresh += 1;

        let gap_us = idist.generate();
        std::thread::sleep(Duration::from_micros(gap_us.max(0.0) as u64));

        let idx = match super::pick_conn(&mut cursor, conns.len(), |i| {
            !conns[i].closed && conns[i].outstanding == 0
        }) {
            Some(idx) => idx,
            None => continue,
        };
        let conn = &mut conns[idx];

        let tx_time = time_ns();
        if let Err(e) = conn.send(proto, stats) {
            warn!("tls connection {} send failed: {}", idx, e);
            conn.closed = true;
            continue;
        }
        let n = match conn.drain(proto, stats) {
            Ok(n) => n,
            Err(e) => {
                warn!("tls connection {} closed: {}", idx, e);
                conn.closed = true;
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        let rx_time = time_ns();
        if ctx.control.should_measure() {
            stats.add_latency_sample((rx_time - tx_time).max(0) as u64, None);
        }
    }
    Ok(())
}

fn run_throughput(
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
) -> Result<()> {
    let mut conns = open_connections(ctx, true)?;
    let mut cursor = 0usize;
    let mut next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
    let mut since_refresh = 0u32;

    while ctx.control.should_load() {
        for idx in 0..conns.len() {
            if !conns[idx].closed {
                drain_isolating_faults(&mut conns, idx, proto, stats);
            }
        }

        if since_refresh >= IDIST_REFRESH_EVERY {
            idist.refresh(ctx.control.idist());
            since_refresh = 0;
        }
        since_refresh += 1;

        if time_ns() >= next_deadline_ns {
            if let Some(idx) = super::pick_conn(&mut cursor, conns.len(), |i| {
                !conns[i].closed && conns[i].outstanding < MAX_OUTSTANDING_PER_CONN
            }) {
                send_isolating_faults(&mut conns, idx, proto, stats);
            }
            next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    Ok(())
}

/// Symmetric TLS: tracks every send in a per-connection tx-timestamp ring
/// like `tcp.rs`'s symmetric engine. `SslStream` doesn't expose the
/// underlying socket cleanly enough for real `MSG_ERRQUEUE` hardware
/// timestamp retrieval through the TLS record layer, so `SymmetricNic`
/// here only enables kernel `SO_TIMESTAMPING` on the wrapped socket
/// (covering the TCP handshake and any cleartext ACKs) and otherwise
/// falls back to the same local-clock synthesis as plain `Symmetric` —
/// documented in DESIGN.md rather than silently no-op'd.
fn run_symmetric(
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
    nic_timestamping: bool,
) -> Result<()> {
    let mut conns = open_connections(ctx, true)?;

    if nic_timestamping {
        let if_name = ctx.if_name.as_deref().unwrap_or("");
        crate::timestamping::enable_nic_timestamping(if_name)?;
        for conn in &conns {
            crate::timestamping::sock_enable_timestamping(conn.stream.get_ref().as_raw_fd())?;
        }
    }

    let mut cursor = 0usize;
    let mut next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
    let mut since_refresh = 0u32;

    while ctx.control.should_load() {
        for idx in 0..conns.len() {
            if conns[idx].closed {
                continue;
            }
            let rx_time = time_ns();
            let before = conns[idx].outstanding;
            drain_isolating_faults(&mut conns, idx, proto, stats);
            let completed = before.saturating_sub(conns[idx].outstanding);
            if completed > 0 && ctx.control.should_measure() {
                if let Some(sample) = conns[idx].tx_ring.pop() {
                    let nsec =
                        (rx_time - sample.time.tv_sec * 1_000_000_000 - sample.time.tv_nsec).max(0) as u64;
                    stats.add_latency_sample(nsec, Some(sample.time));
                }
            }
        }

        if nic_timestamping {
            for conn in conns.iter_mut() {
                let fd = conn.stream.get_ref().as_raw_fd();
                loop {
                    match crate::timestamping::recv_tx_timestamp(fd) {
                        Ok(Some(info)) => conn.tx_ring.apply_timestamp(info.optid, info.time),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("tls tx timestamp retrieval failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if since_refresh >= IDIST_REFRESH_EVERY {
            idist.refresh(ctx.control.idist());
            since_refresh = 0;
        }
        since_refresh += 1;

        if time_ns() >= next_deadline_ns {
            if let Some(idx) = super::pick_conn(&mut cursor, conns.len(), |i| {
                !conns[i].closed && conns[i].outstanding < MAX_OUTSTANDING_PER_CONN
            }) {
                let outstanding_before = conns[idx].outstanding;
                send_isolating_faults(&mut conns, idx, proto, stats);
                if conns[idx].outstanding > outstanding_before {
                    conns[idx].tx_ring.add_pending(1);
                    if !nic_timestamping {
                        let head = conns[idx].tx_ring.head() as u32;
                        conns[idx].tx_ring.apply_timestamp(head, crate::misc::time_ns_to_timespec());
                    }
                }
            }
            next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_outstanding_caps_concurrent_requests_per_connection() {
        assert_eq!(MAX_OUTSTANDING_PER_CONN, 64);
    }

    #[test]
    fn max_payload_matches_wire_protocol_limit() {
        assert_eq!(MAX_PAYLOAD, 16_384);
    }
}
