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

//! The agent side of the coordinator wire protocol: a length-prefixed
//! message header followed by a message-specific payload, all little
//! endian, matching the C struct layout `{u32 MessageType; u32
//! MessageLength;}` the coordinator and every agent share.

use std::io::{Read, Write};
use std::net::TcpStream;

use serde_derive::{Deserialize, Serialize};

use crate::control::ControlBlock;
use crate::error::{LancetError, Result};
use std::sync::Arc;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    StartLoad,
    StartMeasure,
    ReportReq,
    Reply,
    Terminate,
}

impl MessageType {
    fn to_code(self) -> u32 {
        match self {
            MessageType::StartLoad => 0,
            MessageType::StartMeasure => 1,
            MessageType::ReportReq => 2,
            MessageType::Reply => 3,
            MessageType::Terminate => 4,
        }
    }

    fn from_code(code: u32) -> Result<MessageType> {
        match code {
            0 => Ok(MessageType::StartLoad),
            1 => Ok(MessageType::StartMeasure),
            2 => Ok(MessageType::ReportReq),
            3 => Ok(MessageType::Reply),
            4 => Ok(MessageType::Terminate),
            other => Err(LancetError::Proto(format!("unknown message type code {}", other))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartLoadBody {
    pub rps: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportBody {
    pub tx_bytes: u64,
    pub tx_reqs: u64,
    pub rx_bytes: u64,
    pub rx_reqs: u64,
    pub latency_samples: u64,
    pub dropped_timestamp_mismatches: u64,
}

pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

pub fn write_message(stream: &mut TcpStream, kind: MessageType, payload: &[u8]) -> Result<()> {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&kind.to_code().to_le_bytes());
    header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    Ok(())
}

pub fn read_message(stream: &mut TcpStream) -> Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let mut type_bytes = [0u8; 4];
    type_bytes.copy_from_slice(&header[0..4]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[4..8]);
    let kind = MessageType::from_code(u32::from_le_bytes(type_bytes))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Message { kind, payload })
}

/// Serves one coordinator connection until it sends `TERMINATE` or closes.
/// `control` is the same block the worker threads poll, so `START_LOAD`/
/// `START_MEASURE` here take effect on the very next scheduling tick.
pub fn serve(stream: &mut TcpStream, control: &Arc<ControlBlock>, stats: &dyn Fn() -> ReportBody) -> Result<()> {
    loop {
        let msg = read_message(stream)?;
        match msg.kind {
            MessageType::StartLoad => {
                let body: StartLoadBody = bincode::deserialize(&msg.payload)
                    .map_err(|e| LancetError::Proto(format!("bad START_LOAD payload: {}", e)))?;
                control.set_load(body.rps)?;
                control.start_load();
                write_message(stream, MessageType::Reply, &[])?;
            }
            MessageType::StartMeasure => {
                control.start_measure();
                write_message(stream, MessageType::Reply, &[])?;
            }
            MessageType::ReportReq => {
                let body = stats();
                let encoded = bincode::serialize(&body)
                    .map_err(|e| LancetError::Proto(format!("encoding report failed: {}", e)))?;
                write_message(stream, MessageType::Reply, &encoded)?;
            }
            MessageType::Terminate => {
                control.stop_load();
                return Ok(());
            }
            MessageType::Reply => {
                return Err(LancetError::Proto("unexpected REPLY from coordinator".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn header_round_trips_over_a_socket_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let msg = read_message(&mut sock).unwrap();
            assert_eq!(msg.kind, MessageType::Terminate);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        write_message(&mut client, MessageType::Terminate, &[]).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn message_type_round_trips_through_code() {
        for kind in [
            MessageType::StartLoad,
            MessageType::StartMeasure,
            MessageType::ReportReq,
            MessageType::Reply,
            MessageType::Terminate,
        ] {
            assert_eq!(MessageType::from_code(kind.to_code()).unwrap(), kind);
        }
    }
}
