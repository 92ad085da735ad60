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

use super::{ByteReqPair, Request, RoutingHint};

/// Fixed-length echo: the service mirrors back exactly what it is sent,
/// so the reducer just divides the buffered length by `L`.
pub struct EchoProto {
    len: usize,
    payload: Vec<u8>,
}

impl EchoProto {
    pub fn new(len: usize) -> EchoProto {
        EchoProto { len, payload: vec![b'e'; len] }
    }

    pub fn create_request(&mut self) -> Request {
        Request {
            segments: vec![self.payload.clone()],
            meta: RoutingHint::None,
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> ByteReqPair {
        let reqs = buf.len() / self.len;
        ByteReqPair { bytes: reqs * self.len, reqs }
    }
}

/// 8-byte request carrying a service-time hint in nanoseconds; reply
/// framing mirrors the request, 8 bytes per unit.
pub struct SyntheticProto {
    service_time_ns: u64,
}

impl SyntheticProto {
    pub fn new() -> SyntheticProto {
        SyntheticProto { service_time_ns: 0 }
    }

    pub fn create_request(&mut self) -> Request {
        Request {
            segments: vec![self.service_time_ns.to_le_bytes().to_vec()],
            meta: RoutingHint::None,
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> ByteReqPair {
        let reqs = buf.len() / 8;
        ByteReqPair { bytes: reqs * 8, reqs }
    }
}

/// Self-delimiting `{u64 payload_size; byte[payload_size]}+` grammar.
/// The source's reducer here was flagged as ambiguous (uninitialized
/// accumulator); this greedily consumes as many complete records as are
/// fully buffered and stops at the first incomplete one.
pub struct StssProto {
    payload_len: u64,
}

impl StssProto {
    pub fn new() -> StssProto {
        StssProto { payload_len: 64 }
    }

    pub fn create_request(&mut self) -> Request {
        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(&self.payload_len.to_le_bytes());
        Request {
            segments: vec![header, vec![b's'; self.payload_len as usize]],
            meta: RoutingHint::None,
        }
    }

    pub fn consume_response(&mut self, buf: &[u8]) -> ByteReqPair {
        let mut consumed = 0usize;
        let mut reqs = 0usize;
        loop {
            let remaining = &buf[consumed..];
            if remaining.len() < 8 {
                break;
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&remaining[..8]);
            let payload_size = u64::from_le_bytes(size_bytes) as usize;
            if remaining.len() < 8 + payload_size {
                break;
            }
            consumed += 8 + payload_size;
            reqs += 1;
        }
        ByteReqPair { bytes: consumed, reqs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_divides_by_length() {
        let mut p = EchoProto::new(64);
        let buf = vec![0u8; 640_000];
        let res = p.consume_response(&buf);
        assert_eq!(res.reqs, 10_000);
        assert_eq!(res.bytes, 640_000);
    }

    #[test]
    fn echo_partial_tail_not_counted() {
        let mut p = EchoProto::new(64);
        let buf = vec![0u8; 100];
        let res = p.consume_response(&buf);
        assert_eq!(res.reqs, 1);
        assert_eq!(res.bytes, 64);
    }

    #[test]
    fn stss_consumes_greedily_and_stops_on_partial_tail() {
        let mut p = StssProto::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u64.to_le_bytes());
        buf.extend_from_slice(&[1u8; 10]);
        buf.extend_from_slice(&5u64.to_le_bytes());
        buf.extend_from_slice(&[2u8; 5]);
        // partial third record: declares 20 bytes but only 3 are present
        buf.extend_from_slice(&20u64.to_le_bytes());
        buf.extend_from_slice(&[3u8; 3]);

        let res = p.consume_response(&buf);
        assert_eq!(res.reqs, 2);
        assert_eq!(res.bytes, 8 + 10 + 8 + 5);
    }

    #[test]
    fn stss_empty_buffer_is_zero_zero() {
        let mut p = StssProto::new();
        let res = p.consume_response(&[]);
        assert_eq!(res, ByteReqPair { bytes: 0, reqs: 0 });
    }
}
