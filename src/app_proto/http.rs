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

use crate::error::{LancetError, Result};

use super::{ByteReqPair, Request, RoutingHint};

/// Pre-renders a static `GET <path> HTTP/1.1\r\nHost: <host>\r\n\r\n`
/// request once at construction and replays it on every send.
pub struct HttpProto {
    rendered: Vec<u8>,
}

impl HttpProto {
    /// `spec` is `<host>[:port]<path>`, e.g. `127.0.0.1:8080/index.html`.
    pub fn parse(spec: &str) -> Result<HttpProto> {
        let slash = spec.find('/');
        let (host, path) = match slash {
            Some(idx) => (&spec[..idx], &spec[idx..]),
            None => (spec, "/"),
        };
        if host.is_empty() {
            return Err(LancetError::Config(format!(
                "missing host in http spec 'http:{}'",
                spec
            )));
        }
        let rendered = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
        Ok(HttpProto { rendered: rendered.into_bytes() })
    }

    pub fn create_request(&mut self) -> Request {
        Request {
            segments: vec![self.rendered.clone()],
            meta: RoutingHint::None,
        }
    }

    /// A response with no `Content-Length` header is a protocol violation
    /// here (the source's `http_app.cc` treats it as fatal, `assert(0)`);
    /// surfaced as `LancetError::Proto` so the caller can drop the
    /// offending connection instead of aborting the whole worker thread.
    pub fn consume_response(&mut self, buf: &[u8]) -> Result<ByteReqPair> {
        let header_end = match find_subslice(buf, b"\r\n\r\n") {
            Some(idx) => idx + 4,
            None => return Ok(ByteReqPair::default()),
        };

        let headers = &buf[..header_end];
        let content_length = parse_content_length(headers)?;

        let total = header_end + content_length;
        if buf.len() < total {
            return Ok(ByteReqPair::default());
        }
        Ok(ByteReqPair { bytes: total, reqs: 1 })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(headers: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| LancetError::Proto("response headers are not valid utf-8".into()))?;
    for line in text.split("\r\n") {
        let mut parts = line.splitn(2, ':');
        let name = match parts.next() {
            Some(n) => n.trim(),
            None => continue,
        };
        if name.eq_ignore_ascii_case("Content-Length") {
            let value = parts
                .next()
                .ok_or_else(|| LancetError::Proto("Content-Length header has no value".into()))?
                .trim();
            return value
                .parse::<usize>()
                .map_err(|_| LancetError::Proto(format!("bad Content-Length value '{}'", value)));
        }
    }
    Err(LancetError::Proto("response is missing a Content-Length header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_get_request() {
        let mut p = HttpProto::parse("example.com/index.html").unwrap();
        let req = p.create_request();
        assert_eq!(
            req.segments[0],
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn partial_response_yields_zero_zero() {
        let mut p = HttpProto::parse("example.com/").unwrap();
        let prefix = b"HTTP/1.1 200 OK\r\n";
        let res = p.consume_response(prefix).unwrap();
        assert_eq!(res, ByteReqPair::default());
    }

    #[test]
    fn full_response_is_counted_once_content_length_is_satisfied() {
        let mut p = HttpProto::parse("example.com/").unwrap();
        let ten_bytes = b"HTTP/1.1 2";
        assert_eq!(p.consume_response(ten_bytes).unwrap(), ByteReqPair::default());

        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
        let res = p.consume_response(full).unwrap();
        assert_eq!(res.reqs, 1);
        assert_eq!(res.bytes, full.len());
    }

    #[test]
    fn missing_content_length_is_a_protocol_error() {
        let mut p = HttpProto::parse("example.com/").unwrap();
        let headers_only = b"HTTP/1.1 200 OK\r\n\r\n";
        assert!(p.consume_response(headers_only).is_err());
    }
}
