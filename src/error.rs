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

use std::fmt;
use std::io;

/// Crate-wide error taxonomy. `Config` and `Proto` cover the fatal,
/// bootstrap-time failures from the error handling design; `Io` wraps
/// unexpected syscall failures that are logged and cause a single
/// worker to exit its loop.
#[derive(Debug)]
pub enum LancetError {
    Config(String),
    Io(io::Error),
    Proto(String),
}

impl fmt::Display for LancetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LancetError::Config(s) => write!(f, "configuration error: {}", s),
            LancetError::Io(e) => write!(f, "io error: {}", e),
            LancetError::Proto(s) => write!(f, "protocol error: {}", s),
        }
    }
}

impl std::error::Error for LancetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LancetError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LancetError {
    fn from(e: io::Error) -> Self {
        LancetError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, LancetError>;
