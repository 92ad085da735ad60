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

//! Transport engines. Each engine opens a pool of connections to a set of
//! targets and drives the open-loop request/response loop appropriate to
//! its agent role. The source dispatches on a `tp_main[AGENT_NR]` table of
//! function pointers selected by transport kind and role; here that table
//! is a plain `match` over `Transport` x `AgentRole` in `run`.

pub mod tcp;
pub mod tls;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use crate::app_proto::Protocol;
use crate::control::{AgentRole, ControlBlock};
use crate::error::{LancetError, Result};
use crate::rand_gen::Distribution;
use crate::stats::PerThreadStats;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Tls,
}

impl Transport {
    pub fn parse(spec: &str) -> Result<Transport> {
        match spec {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            "tls" => Ok(Transport::Tls),
            other => Err(LancetError::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// Picks the next connection to use out of `count` candidates in strict
/// round-robin order, skipping entries marked unusable by `usable`. Shared
/// by every engine's scheduling loop; `cursor` is owned by one worker
/// thread, never shared.
pub fn pick_conn(cursor: &mut usize, count: usize, usable: impl Fn(usize) -> bool) -> Option<usize> {
    if count == 0 {
        return None;
    }
    for _ in 0..count {
        let idx = *cursor % count;
        *cursor = (*cursor + 1) % count;
        if usable(idx) {
            return Some(idx);
        }
    }
    None
}

/// Parameters shared by every engine's worker loop, gathered once at
/// thread startup.
pub struct WorkerContext {
    pub targets: Vec<SocketAddr>,
    pub connections_per_target: usize,
    pub role: AgentRole,
    pub control: Arc<ControlBlock>,
    pub idist_seed: u64,
    pub if_name: Option<String>,
    pub pending_cap: usize,
}

/// Per-connection outstanding-request budget; a connection is skipped by
/// `pick_conn` once its in-flight count reaches this.
pub const MAX_OUTSTANDING_PER_CONN: usize = 64;

pub const SOCKBUF_SIZE: usize = 524_288;
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One worker thread's full run: build connections for `ctx.role` and
/// `transport`, then loop generating requests according to `idist` and
/// `proto` until `ctx.control.should_load()` goes false.
pub fn run(
    transport: Transport,
    ctx: &WorkerContext,
    idist: &mut Distribution,
    proto: &mut Protocol,
    stats: &mut PerThreadStats,
) -> Result<()> {
    match transport {
        Transport::Tcp => tcp::run(ctx, idist, proto, stats),
        Transport::Udp => udp::run(ctx, idist, proto, stats),
        Transport::Tls => tls::run(ctx, idist, proto, stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_conn_round_robins_and_skips_unusable() {
        let mut cursor = 0;
        let usable = |idx: usize| idx != 1;
        let seq: Vec<usize> = (0..4)
            .map(|_| pick_conn(&mut cursor, 3, usable).unwrap())
            .collect();
        assert_eq!(seq, vec![0, 2, 0, 2]);
    }

    #[test]
    fn pick_conn_returns_none_when_all_unusable() {
        let mut cursor = 0;
        assert!(pick_conn(&mut cursor, 3, |_| false).is_none());
    }

    #[test]
    fn transport_parse_rejects_unknown() {
        assert!(Transport::parse("quic").is_err());
    }
}
