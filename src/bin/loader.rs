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

//! One-shot utility that pre-populates a key/value store before a run:
//! opens a single connection, issues nothing but SET operations (forced
//! by a `get_ratio` of 0) for a fixed request count, then exits. Reuses
//! the same application-protocol parsing and connection setup the agent
//! uses, just without a scheduler or shared control block.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process;

use log::{error, info};

use lancet::app_proto::Protocol;
use lancet::error::{LancetError, Result};

struct Args {
    target: String,
    kv_spec: String,
    count: u64,
}

fn parse_args(argv: &[String]) -> Result<Args> {
    let mut target = None;
    let mut kv_spec = None;
    let mut count = 10_000u64;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-s" => {
                target = argv.get(i + 1).cloned();
                i += 2;
            }
            "-r" => {
                kv_spec = argv.get(i + 1).cloned();
                i += 2;
            }
            "-n" => {
                count = argv
                    .get(i + 1)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| LancetError::Config("bad -n count".into()))?;
                i += 2;
            }
            other => return Err(LancetError::Config(format!("unrecognized flag '{}'", other))),
        }
    }

    Ok(Args {
        target: target.ok_or_else(|| LancetError::Config("missing -s target".into()))?,
        kv_spec: kv_spec.ok_or_else(|| LancetError::Config("missing -r protocol spec".into()))?,
        count,
    })
}

/// Forces `get_ratio` to 0 so every populated key is written, regardless
/// of what ratio the caller's spec named.
fn force_all_sets(spec: &str) -> String {
    let mut fields: Vec<&str> = spec.splitn(2, '_').collect();
    if fields.len() != 2 {
        return spec.to_string();
    }
    let tag = fields.remove(0);
    let rest = fields.remove(0);
    let mut parts: Vec<&str> = rest.trim_start_matches('_').split('_').collect();
    if parts.len() == 5 {
        parts[3] = "0";
    }
    format!("{}_{}", tag, parts.join("_"))
}

fn run(args: Args) -> Result<()> {
    let spec = force_all_sets(&args.kv_spec);
    let mut proto = Protocol::parse(&spec, 1)?;
    let mut stream = TcpStream::connect(&args.target)?;
    stream.set_nodelay(true)?;

    let mut buf = vec![0u8; 1 << 16];
    let mut completed = 0u64;
    while completed < args.count {
        let req = proto.create_request();
        for seg in &req.segments {
            stream.write_all(seg)?;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(LancetError::Proto("connection closed mid-load".into()));
        }
        let res = proto.consume_response(&buf[..n])?;
        completed += res.reqs as u64;
    }
    info!("populated {} keys against {}", completed, args.target);
    Ok(())
}

fn main() {
    env_logger::init();
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(a) => a,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };
    if let Err(e) = run(args) {
        error!("{}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_all_sets_zeroes_the_get_ratio_field() {
        let spec = "memcache-ascii_fixed:8_fixed:32_1000_0.9_rr";
        assert_eq!(
            force_all_sets(spec),
            "memcache-ascii_fixed:8_fixed:32_1000_0_rr"
        );
    }
}
