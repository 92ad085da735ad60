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

//! Microsecond-scale RPC load generator: one process per agent, one
//! thread per core, open-loop request scheduling driven by an
//! inter-arrival distribution against a pluggable application protocol
//! and transport engine.

pub mod agent;
pub mod app_proto;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod key_gen;
pub mod misc;
pub mod rand_gen;
pub mod stats;
pub mod timestamping;
pub mod transport;

pub use error::{LancetError, Result};
