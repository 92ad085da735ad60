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

//! UDP transport engine. Each connection is one bound/connected datagram
//! socket; framing is whatever the application protocol produces in a
//! single datagram, so there is no partial-message buffering to do beyond
//! what `recv` already hands back as one unit.

use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::warn;

use crate::app_proto::Protocol;
use crate::control::AgentRole;
use crate::error::{LancetError, Result};
use crate::misc::time_ns;
use crate::rand_gen::Distribution;
use crate::stats::PerThreadStats;
use crate::timestamping::PendingTxTimestamps;

use super::{WorkerContext, MAX_OUTSTANDING_PER_CONN, READ_TIMEOUT};

/// Matches `original_source/inc/lancet/tp_proto.h`'s `UDP_MAX_PAYLOAD`.
const MAX_DATAGRAM: usize = 1500;

/// See `tcp.rs`'s identical constant; same rationale.
const IDIST_REFRESH_EVERY: u32 = 64;

struct Conn {
    socket: UdpSocket,
    outstanding: usize,
    tx_ring: PendingTxTimestamps,
    closed: bool,
}

impl Conn {
    fn new(socket: UdpSocket, pending_cap: usize) -> Conn {
        Conn { socket, outstanding: 0, tx_ring: PendingTxTimestamps::new(pending_cap), closed: false }
    }
}

fn open_connections(ctx: &WorkerContext, nonblocking: bool) -> Result<Vec<Conn>> {
    let mut conns = Vec::with_capacity(ctx.targets.len() * ctx.connections_per_target);
    for target in &ctx.targets {
        for _ in 0..ctx.connections_per_target {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.connect(target)?;
            if nonblocking {
                socket.set_nonblocking(true)?;
            } else {
                socket.set_read_timeout(Some(READ_TIMEOUT))?;
            }
            conns.push(Conn::new(socket, ctx.pending_cap));
        }
    }
    if conns.is_empty() {
        return Err(LancetError::Config("no targets configured for udp transport".into()));
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
        AgentRole::Throughput => run_throughput_like(ctx, idist, proto, stats),
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
    let mut buf = vec![0u8; MAX_DATAGRAM];
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

        let req = proto.create_request();
        let tx_time = time_ns();
        if let Err(e) = send_all(&mut conns[idx], &req) {
            warn!("connection {} send failed: {}", idx, e);
            conns[idx].closed = true;
            continue;
        }
        stats.add_throughput_tx_sample(req.total_len() as u64, 1);

        let n = match conns[idx].socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                warn!("connection {} closed: {}", idx, e);
                conns[idx].closed = true;
                continue;
            }
        };
        let res = match proto.consume_response(&buf[..n]) {
            Ok(res) => res,
            Err(e) => {
                warn!("connection {} closed: {}", idx, e);
                conns[idx].closed = true;
                continue;
            }
        };
        if res.reqs > 0 {
            stats.add_throughput_rx_sample(res.bytes as u64, res.reqs as u64);
            if ctx.control.should_measure() {
                let rx_time = time_ns();
                stats.add_latency_sample((rx_time - tx_time).max(0) as u64, None);
            }
        }
    }
    Ok(())
}

fn send_all(conn: &mut Conn, req: &crate::app_proto::Request) -> Result<()> {
    for seg in &req.segments {
        conn.socket.send(seg)?;
    }
    Ok(())
}

fn run_throughput_like(
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
) -> Result<()> {
    let mut conns = open_connections(ctx, true)?;
    let mut cursor = 0usize;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
    let mut since_refresh = 0u32;

    while ctx.control.should_load() {
        for idx in 0..conns.len() {
            drain_datagrams(&mut conns, idx, proto, stats, &mut buf);
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
                let req = proto.create_request();
                if let Err(e) = send_all(&mut conns[idx], &req) {
                    warn!("connection {} send failed: {}", idx, e);
                    conns[idx].closed = true;
                } else {
                    conns[idx].outstanding += 1;
                    stats.add_throughput_tx_sample(req.total_len() as u64, 1);
                }
            }
            next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    Ok(())
}

/// Drains every datagram currently queued on `conns[idx]` without
/// blocking, updating throughput counters and clearing `outstanding`.
fn drain_datagrams(
    conns: &mut [Conn],
    idx: usize,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
    buf: &mut [u8],
) {
    loop {
        match conns[idx].socket.recv(buf) {
            Ok(n) => match proto.consume_response(&buf[..n]) {
                Ok(res) if res.reqs > 0 => {
                    stats.add_throughput_rx_sample(res.bytes as u64, res.reqs as u64);
                    conns[idx].outstanding = conns[idx].outstanding.saturating_sub(res.reqs);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("connection {} closed: {}", idx, e);
                    conns[idx].closed = true;
                    break;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("connection {} closed: {}", idx, e);
                conns[idx].closed = true;
                break;
            }
        }
    }
}

/// Symmetric UDP: like `run_throughput_like`'s datagram loop, but every tx
/// is tracked in a per-connection timestamp ring so a completed reply's
/// latency can be attributed back to its own send, the way `tcp.rs`'s
/// symmetric engine does for streaming connections. Datagram framing means
/// OPT_ID matching degenerates to "one send, one pending slot" rather than
/// a byte-counter ring, but `PendingTxTimestamps` handles that the same way.
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
            crate::timestamping::sock_enable_timestamping(conn.socket.as_raw_fd())?;
        }
    }

    let mut cursor = 0usize;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut next_deadline_ns = time_ns() + (idist.generate().max(0.0) * 1000.0) as i64;
    let mut since_refresh = 0u32;

    while ctx.control.should_load() {
        for idx in 0..conns.len() {
            let rx_time = time_ns();
            let before = conns[idx].outstanding;
            drain_datagrams(&mut conns, idx, proto, stats, &mut buf);
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
                loop {
                    match crate::timestamping::recv_tx_timestamp(conn.socket.as_raw_fd()) {
                        Ok(Some(info)) => conn.tx_ring.apply_timestamp(info.optid, info.time),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("tx timestamp retrieval failed: {}", e);
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
                let req = proto.create_request();
                if let Err(e) = send_all(&mut conns[idx], &req) {
                    warn!("connection {} send failed: {}", idx, e);
                    conns[idx].closed = true;
                } else {
                    conns[idx].outstanding += 1;
                    stats.add_throughput_tx_sample(req.total_len() as u64, 1);
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
    use crate::app_proto::Protocol;

    #[test]
    fn latency_round_trip_against_local_echo_socket() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).unwrap();
            server.send_to(&buf[..n], from).unwrap();
        });

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect(addr).unwrap();
        let mut proto = Protocol::parse("echo:64", 0).unwrap();
        let req = proto.create_request();
        for seg in &req.segments {
            client.send(seg).unwrap();
        }
        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        let res = proto.consume_response(&buf[..n]).unwrap();
        assert_eq!(res.reqs, 1);
        handle.join().unwrap();
    }
}
