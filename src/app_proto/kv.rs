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

use std::sync::Arc;

use rand::{Rng, SeedableRng, XorShiftRng};

use crate::error::{LancetError, Result};
use crate::key_gen::KeyGen;
use crate::rand_gen::{DistKind, Distribution};

use super::{ByteReqPair, Request, RoutingHint};

/// Shared shape behind every key/value protocol: a materialized key set,
/// a value-length distribution, a key-selector distribution and a
/// read/write mix. Spec grammar (after the protocol tag is stripped):
/// `_<key_size_dist>_<val_size_dist>_<key_count>_<get_ratio>_<key_selector>`.
pub struct KvInfo {
    pub keys: Arc<KeyGen>,
    val_len: Distribution,
    key_sel: Distribution,
    get_ratio: f64,
    rng: XorShiftRng,
}

impl KvInfo {
    pub fn parse(rest: &str, seed: u64) -> Result<KvInfo> {
        let rest = rest.trim_start_matches('_');
        let fields: Vec<&str> = rest.split('_').collect();
        if fields.len() != 5 {
            return Err(LancetError::Config(format!(
                "expected 5 underscore-delimited fields in kv spec, got '{}'",
                rest
            )));
        }
        let key_dist = DistKind::parse(fields[0])?;
        let val_dist = DistKind::parse(fields[1])?;
        let key_count: usize = fields[2]
            .parse()
            .map_err(|_| LancetError::Config(format!("bad key count '{}'", fields[2])))?;
        let get_ratio: f64 = fields[3]
            .parse()
            .map_err(|_| LancetError::Config(format!("bad get ratio '{}'", fields[3])))?;
        // Matches the source's `sprintf(key_sel, "%s:%d", token, key_count)`:
        // the selector token is a bare distribution name, parameterized by
        // the key count.
        let key_sel_spec = format!("{}:{}", fields[4], key_count);
        let key_sel_dist = DistKind::parse(&key_sel_spec)?;

        let keys = Arc::new(KeyGen::new(key_dist, key_count, seed));
        Ok(KvInfo {
            keys,
            val_len: Distribution::new(val_dist, seed.wrapping_add(1)),
            key_sel: Distribution::new(key_sel_dist, seed.wrapping_add(2)),
            get_ratio,
            rng: XorShiftRng::from_seed([
                (seed as u32) | 1,
                (seed.wrapping_add(3) as u32) | 1,
                (seed.wrapping_add(5) as u32) | 1,
                (seed.wrapping_add(7) as u32) | 1,
            ]),
        })
    }

    fn pick_key(&mut self) -> Vec<u8> {
        let idx = self.key_sel.generate() as usize % self.keys.key_count().max(1);
        self.keys.key_at(idx).to_vec()
    }

    /// A fresh uniform draw `<= get_ratio` is a GET, matching the
    /// source's `drand48() > get_ratio` ⇒ SET convention (get_ratio is
    /// P(get)).
    fn is_get(&mut self) -> bool {
        self.rng.gen::<f64>() <= self.get_ratio
    }

    fn sample_val_len(&mut self) -> usize {
        self.val_len.generate().round().max(0.0) as usize
    }
}

fn filler(len: usize) -> Vec<u8> {
    vec![b'x'; len]
}

pub struct MemcachedAsciiProto {
    info: KvInfo,
}

impl MemcachedAsciiProto {
    pub fn parse(rest: &str, seed: u64) -> Result<MemcachedAsciiProto> {
        Ok(MemcachedAsciiProto { info: KvInfo::parse(rest, seed)? })
    }

    pub fn create_request(&mut self) -> Request {
        let key = self.info.pick_key();
        if self.info.is_get() {
            let mut buf = Vec::with_capacity(4 + key.len() + 2);
            buf.extend_from_slice(b"get ");
            buf.extend_from_slice(&key);
            buf.extend_from_slice(b"\r\n");
            Request { segments: vec![buf], meta: RoutingHint::None }
        } else {
            let val_len = self.info.sample_val_len();
            let mut buf = Vec::with_capacity(4 + key.len() + 5 + 20 + 2);
            buf.extend_from_slice(b"set ");
            buf.extend_from_slice(&key);
            buf.extend_from_slice(format!(" 0 0 {}\r\n", val_len).as_bytes());
            buf.extend_from_slice(&filler(val_len));
            buf.extend_from_slice(b"\r\n");
            Request { segments: vec![buf], meta: RoutingHint::None }
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> ByteReqPair {
        let mut consumed = 0usize;
        let mut reqs = 0usize;
        loop {
            let remaining = &buf[consumed..];
            if remaining.len() < 5 {
                break;
            }
            if remaining.starts_with(b"END\r\n") {
                consumed += 5;
                reqs += 1;
                continue;
            }
            if remaining.len() >= 8 && remaining.starts_with(b"STORED\r\n") {
                consumed += 8;
                reqs += 1;
                continue;
            }
            match nth_newline(remaining, 3) {
                Some(end) => {
                    consumed += end;
                    reqs += 1;
                }
                None => break,
            }
        }
        ByteReqPair { bytes: consumed, reqs }
    }
}

fn nth_newline(buf: &[u8], occurrence: usize) -> Option<usize> {
    let mut seen = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            seen += 1;
            if seen == occurrence {
                return Some(i + 1);
            }
        }
    }
    None
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BmcHeader {
    magic: u8,
    opcode: u8,
    key_len: u16,
    extra_len: u8,
    data_type: u8,
    vbucket_or_status: u16,
    body_len: u32,
    opaque: u32,
    version: u64,
}

const BMC_HEADER_LEN: usize = 24;
const CMD_GET: u8 = 0x00;
const CMD_SET: u8 = 0x01;

pub struct MemcachedBinaryProto {
    info: KvInfo,
}

impl MemcachedBinaryProto {
    pub fn parse(rest: &str, seed: u64) -> Result<MemcachedBinaryProto> {
        Ok(MemcachedBinaryProto { info: KvInfo::parse(rest, seed)? })
    }

    pub fn create_request(&mut self) -> Request {
        let key = self.info.pick_key();
        if self.info.is_get() {
            let header = BmcHeader {
                magic: 0x80,
                opcode: CMD_GET,
                key_len: (key.len() as u16).to_be(),
                extra_len: 0,
                data_type: 0,
                vbucket_or_status: 0,
                body_len: (key.len() as u32).to_be(),
                opaque: 0,
                version: 0,
            };
            Request {
                segments: vec![header_bytes(&header), key],
                meta: RoutingHint::None,
            }
        } else {
            let val_len = self.info.sample_val_len();
            let extras = 8u64.to_le_bytes().to_vec();
            let header = BmcHeader {
                magic: 0x80,
                opcode: CMD_SET,
                key_len: (key.len() as u16).to_be(),
                extra_len: 8,
                data_type: 0,
                vbucket_or_status: 0,
                body_len: ((key.len() + val_len + 8) as u32).to_be(),
                opaque: 0,
                version: 0,
            };
            Request {
                segments: vec![header_bytes(&header), extras, key, filler(val_len)],
                meta: RoutingHint::None,
            }
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> ByteReqPair {
        let mut consumed = 0usize;
        let mut reqs = 0usize;
        loop {
            let remaining = &buf[consumed..];
            if remaining.len() < BMC_HEADER_LEN {
                break;
            }
            let body_len = u32::from_be_bytes([
                remaining[8],
                remaining[9],
                remaining[10],
                remaining[11],
            ]) as usize;
            let total = BMC_HEADER_LEN + body_len;
            if remaining.len() < total {
                break;
            }
            consumed += total;
            reqs += 1;
        }
        ByteReqPair { bytes: consumed, reqs }
    }
}

fn header_bytes(header: &BmcHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BMC_HEADER_LEN);
    buf.push(header.magic);
    buf.push(header.opcode);
    buf.extend_from_slice(&header.key_len.to_ne_bytes());
    buf.push(header.extra_len);
    buf.push(header.data_type);
    buf.extend_from_slice(&header.vbucket_or_status.to_ne_bytes());
    buf.extend_from_slice(&header.body_len.to_ne_bytes());
    buf.extend_from_slice(&header.opaque.to_ne_bytes());
    buf.extend_from_slice(&header.version.to_ne_bytes());
    buf
}

pub struct RedisProto {
    info: KvInfo,
}

impl RedisProto {
    pub fn parse(rest: &str, seed: u64) -> Result<RedisProto> {
        Ok(RedisProto { info: KvInfo::parse(rest, seed)? })
    }

    pub fn create_request(&mut self) -> Request {
        let key = self.info.pick_key();
        if self.info.is_get() {
            let mut buf = Vec::new();
            buf.extend_from_slice(b"*2\r\n$3\r\nGET\r\n");
            buf.extend_from_slice(format!("${}\r\n", key.len()).as_bytes());
            buf.extend_from_slice(&key);
            buf.extend_from_slice(b"\r\n");
            Request { segments: vec![buf], meta: RoutingHint::None }
        } else {
            let val_len = self.info.sample_val_len();
            let val = filler(val_len);
            let mut buf = Vec::new();
            buf.extend_from_slice(b"*3\r\n$3\r\nSET\r\n");
            buf.extend_from_slice(format!("${}\r\n", key.len()).as_bytes());
            buf.extend_from_slice(&key);
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(format!("${}\r\n", val.len()).as_bytes());
            buf.extend_from_slice(&val);
            buf.extend_from_slice(b"\r\n");
            Request { segments: vec![buf], meta: RoutingHint::None }
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> Result<ByteReqPair> {
        let mut consumed = 0usize;
        let mut reqs = 0usize;
        loop {
            let remaining = &buf[consumed..];
            if remaining.is_empty() {
                break;
            }
            match remaining[0] {
                b'+' | b'-' => match find_crlf(remaining) {
                    Some(end) => {
                        consumed += end + 2;
                        reqs += 1;
                    }
                    None => break,
                },
                b'$' => match parse_bulk_string(remaining) {
                    Some(len) => {
                        consumed += len;
                        reqs += 1;
                    }
                    None => break,
                },
                other => {
                    return Err(LancetError::Proto(format!(
                        "unexpected redis reply tag byte {}",
                        other
                    )))
                }
            }
        }
        Ok(ByteReqPair { bytes: consumed, reqs })
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses a RESP bulk string header `$<n>\r\n` and returns the total byte
/// length of the framed reply, including the special `$-1\r\n` miss case
/// which the source treats as a fixed 5-byte reply.
fn parse_bulk_string(buf: &[u8]) -> Option<usize> {
    let header_end = find_crlf(buf)? + 2;
    let header = std::str::from_utf8(&buf[1..header_end - 2]).ok()?;
    let len: i64 = header.parse().ok()?;
    if len == -1 {
        return Some(5);
    }
    let total = header_end + len as usize + 2;
    if buf.len() < total {
        return None;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(spec: &str) -> KvInfo {
        KvInfo::parse(spec, 42).unwrap()
    }

    #[test]
    fn parses_kv_spec_fields() {
        let info = kv("_fixed:8_fixed:16_100_1.0_uni:100");
        assert_eq!(info.keys.key_count(), 100);
        assert_eq!(info.get_ratio, 1.0);
    }

    #[test]
    fn memcached_ascii_miss_and_stored() {
        let mut p = MemcachedAsciiProto::parse("_fixed:8_fixed:16_10_1.0_uni:10", 1).unwrap();
        let res = p.consume_response(b"END\r\n");
        assert_eq!(res, ByteReqPair { bytes: 5, reqs: 1 });
        let res = p.consume_response(b"STORED\r\n");
        assert_eq!(res, ByteReqPair { bytes: 8, reqs: 1 });
    }

    #[test]
    fn memcached_binary_header_and_body_roundtrip() {
        let mut p =
            MemcachedBinaryProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 9).unwrap();
        let mut buf = vec![0u8; BMC_HEADER_LEN + 16];
        buf[11] = 16; // body_len low byte, big-endian encoded
        let res = p.consume_response(&buf);
        assert_eq!(res, ByteReqPair { bytes: BMC_HEADER_LEN + 16, reqs: 1 });
    }

    #[test]
    fn memcached_binary_split_across_header_boundary_yields_zero_until_complete() {
        let mut p =
            MemcachedBinaryProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 9).unwrap();
        let mut buf = vec![0u8; BMC_HEADER_LEN + 16];
        buf[11] = 16;
        assert_eq!(p.consume_response(&buf[..1]), ByteReqPair::default());
        assert_eq!(p.consume_response(&buf[..23]), ByteReqPair::default());
        assert_eq!(
            p.consume_response(&buf),
            ByteReqPair { bytes: BMC_HEADER_LEN + 16, reqs: 1 }
        );
    }

    #[test]
    fn redis_miss_is_five_bytes_one_req() {
        let mut p = RedisProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 3).unwrap();
        let res = p.consume_response(b"$-1\r\n").unwrap();
        assert_eq!(res, ByteReqPair { bytes: 5, reqs: 1 });
    }

    #[test]
    fn redis_bulk_string_hit() {
        let mut p = RedisProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 3).unwrap();
        let res = p.consume_response(b"$3\r\nabc\r\n").unwrap();
        assert_eq!(res, ByteReqPair { bytes: 9, reqs: 1 });
    }

    #[test]
    fn redis_simple_string_ok() {
        let mut p = RedisProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 3).unwrap();
        let res = p.consume_response(b"+OK\r\n").unwrap();
        assert_eq!(res, ByteReqPair { bytes: 5, reqs: 1 });
    }

    #[test]
    fn redis_unexpected_tag_byte_is_a_proto_error_not_a_panic() {
        let mut p = RedisProto::parse("_fixed:8_fixed:16_100_1.0_uni:100", 3).unwrap();
        assert!(p.consume_response(b"!oops\r\n").is_err());
    }
}
