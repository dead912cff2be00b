//! TFTP message framing (RFC 1350, RFC 2347).
//!
//! Every datagram is a 2-byte big-endian opcode followed by a payload.
//! Only what a read-only server needs is decoded: requests, ACKs and
//! ERRORs. DATA, OACK and ERROR are encoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ErrorCode, Result, TftpError};
use crate::options::NegotiatedOption;
use crate::request::{ReadRequest, Request};

/// Largest UDP payload the server will read.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

const OPCODE_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

/// Split a datagram into its opcode and payload.
pub fn split_message(datagram: &[u8]) -> Result<(u16, &[u8])> {
    if datagram.len() < OPCODE_LEN {
        return Err(TftpError::NotTftp);
    }
    let (mut opcode, payload) = datagram.split_at(OPCODE_LEN);
    Ok((opcode.get_u16(), payload))
}

/// Decode a request received on the well-known port.
///
/// RRQ payload: `filename\0 mode\0 [name\0 value\0]* `. A payload that does
/// not contain at least the filename and mode terminators is not TFTP and
/// yields [`TftpError::NotTftp`]; a well-framed request with another opcode
/// or mode is an illegal operation.
pub fn parse_request(datagram: &[u8]) -> Result<Request> {
    let (opcode, payload) = split_message(datagram)?;
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    // The last field is whatever follows the final NUL.
    let [filename, mode, options @ .., _end] = fields.as_slice() else {
        return Err(TftpError::NotTftp);
    };

    if opcode != Opcode::Rrq as u16 {
        return Err(TftpError::illegal_operation(format!(
            "Only Read requests are supported while 0x{:02x} received",
            opcode
        )));
    }
    if !mode.eq_ignore_ascii_case(b"octet") {
        return Err(TftpError::illegal_operation(format!(
            "Only 'octet' mode is supported while '{}' received",
            String::from_utf8_lossy(mode)
        )));
    }

    let filename = std::str::from_utf8(filename).map_err(|_| TftpError::NotTftp)?;
    let options: HashMap<String, String> = options
        .chunks_exact(2)
        .map(|pair| {
            (
                String::from_utf8_lossy(pair[0]).to_lowercase(),
                String::from_utf8_lossy(pair[1]).into_owned(),
            )
        })
        .collect();

    Ok(Request::Read(ReadRequest::new(filename, options)))
}

/// Block index carried by an ACK payload.
pub fn parse_ack(payload: &[u8]) -> Option<u16> {
    let mut payload = payload;
    (payload.len() >= 2).then(|| payload.get_u16())
}

/// Turn an ERROR payload sent by the peer into an early-termination signal.
pub fn parse_error(payload: &[u8]) -> TftpError {
    let mut payload = payload;
    let code = if payload.len() >= 2 { payload.get_u16() } else { 0 };
    let message = payload.strip_suffix(b"\0").unwrap_or(payload);
    TftpError::EarlyTermination {
        code,
        message: String::from_utf8_lossy(message).into_owned(),
    }
}

// RFC 1350: ERROR packet format
// 2 bytes: opcode (05)
// 2 bytes: error code
// string: error message (null-terminated)
pub fn encode_error(code: ErrorCode, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code as u16);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

/// A message that stays outstanding until the peer acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexedMessage {
    Block { index: u16, payload: Bytes },
    OptionsAck { options: Vec<NegotiatedOption> },
}

impl IndexedMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            // RFC 1350: DATA packet format
            // 2 bytes: opcode (03)
            // 2 bytes: block number
            // n bytes: data (0-blocksize bytes)
            IndexedMessage::Block { index, payload } => {
                let mut packet = BytesMut::with_capacity(4 + payload.len());
                packet.put_u16(Opcode::Data as u16);
                packet.put_u16(*index);
                packet.put_slice(payload);
                packet.freeze()
            }
            // RFC 2347: OACK packet format
            // 2 bytes: opcode (06)
            // [name\0 value\0]*
            IndexedMessage::OptionsAck { options } => {
                let mut packet = BytesMut::new();
                packet.put_u16(Opcode::Oack as u16);
                for option in options {
                    packet.put_slice(option.name().as_bytes());
                    packet.put_u8(0);
                    packet.put_slice(option.value().as_bytes());
                    packet.put_u8(0);
                }
                packet.freeze()
            }
        }
    }

    /// OACK is acknowledged by block 0, DATA by its own index.
    pub fn is_acknowledged_by(&self, index: u16) -> bool {
        match self {
            IndexedMessage::Block { index: own, .. } => *own == index,
            IndexedMessage::OptionsAck { .. } => index == 0,
        }
    }
}

impl fmt::Display for IndexedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexedMessage::Block { index, .. } => write!(f, "<Block {}>", index),
            IndexedMessage::OptionsAck { options } => {
                write!(f, "<OACK")?;
                for (i, option) in options.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}{}: {}", sep, option.name(), option.value())?;
                }
                write!(f, ">")
            }
        }
    }
}
