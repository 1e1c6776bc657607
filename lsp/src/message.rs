//! Wire-format definitions for LSP messages.
//!
//! Every datagram exchanged between peers carries exactly one [`Message`].
//! This module is responsible for:
//! - Defining the on-wire binary layout.
//! - Serialising a [`Message`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Message`], returning a
//!   [`FormatError`] for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Kind      |         Connection ID         |   Sequence    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Payload Length         |          Payload ...          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 6 bytes.
//! kind(1) + conn_id(2) + seq(1) + payload_len(2)

use std::fmt;

/// Largest datagram the protocol will put on the wire.
pub const MAX_DATAGRAM: usize = 1500;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 6;

/// Largest payload that fits in a single datagram.
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

// Byte offsets of each field within the serialised header.
const OFF_KIND: usize = 0;
const OFF_CONN_ID: usize = 1;
const OFF_SEQ: usize = 3;
const OFF_PAYLOAD_LEN: usize = 4;

/// The four message kinds.
///
/// Only `Connect`, `Data` and `Ack` have a wire encoding.  `Invalid` marks a
/// closing connection inside send queues and ready buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    Connect,
    Data,
    Ack,
    Invalid,
}

impl MsgKind {
    fn to_wire(self) -> Option<u8> {
        match self {
            MsgKind::Connect => Some(0),
            MsgKind::Data => Some(1),
            MsgKind::Ack => Some(2),
            MsgKind::Invalid => None,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MsgKind::Connect),
            1 => Some(MsgKind::Data),
            2 => Some(MsgKind::Ack),
            _ => None,
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgKind::Connect => "Connect",
            MsgKind::Data => "Data",
            MsgKind::Ack => "Ack",
            MsgKind::Invalid => "Invalid",
        };
        f.write_str(name)
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MsgKind,
    /// Server-assigned connection id; `0` until the handshake completes.
    pub conn_id: u16,
    /// Per-direction sequence number, wrapping modulo 256.
    pub seq: u8,
    /// Application bytes.  Empty for every kind except `Data`.
    pub payload: Vec<u8>,
}

impl Message {
    /// Connection request.  Always id 0, sequence 0.
    pub fn connect() -> Self {
        Self {
            kind: MsgKind::Connect,
            conn_id: 0,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn data(conn_id: u16, seq: u8, payload: Vec<u8>) -> Self {
        Self {
            kind: MsgKind::Data,
            conn_id,
            seq,
            payload,
        }
    }

    pub fn ack(conn_id: u16, seq: u8) -> Self {
        Self {
            kind: MsgKind::Ack,
            conn_id,
            seq,
            payload: Vec::new(),
        }
    }

    /// Close sentinel for connection `conn_id` (`0` addresses the whole engine).
    pub fn invalid(conn_id: u16) -> Self {
        Self {
            kind: MsgKind::Invalid,
            conn_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.kind == MsgKind::Invalid
    }

    /// Serialise this message into a newly allocated byte vector.
    ///
    /// Fails for the `Invalid` kind, which has no wire representation, and for
    /// payloads that would not fit in [`MAX_DATAGRAM`].
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let kind = self.kind.to_wire().ok_or(FormatError::NotOnWire)?;
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FormatError::PayloadTooLarge(self.payload.len()));
        }
        if self.kind != MsgKind::Data && !self.payload.is_empty() {
            return Err(FormatError::UnexpectedPayload(self.kind));
        }

        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        buf[OFF_KIND] = kind;
        buf[OFF_CONN_ID..OFF_CONN_ID + 2].copy_from_slice(&self.conn_id.to_be_bytes());
        buf[OFF_SEQ] = self.seq;
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a [`Message`] from a raw datagram.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the kind byte is not a wire kind,
    /// - the `payload_len` field disagrees with `buf.len()`, or
    /// - a non-Data message carries payload bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::BufferTooShort);
        }

        let kind =
            MsgKind::from_wire(buf[OFF_KIND]).ok_or(FormatError::UnknownKind(buf[OFF_KIND]))?;
        let conn_id = u16::from_be_bytes([buf[OFF_CONN_ID], buf[OFF_CONN_ID + 1]]);
        let seq = buf[OFF_SEQ];
        let payload_len =
            u16::from_be_bytes([buf[OFF_PAYLOAD_LEN], buf[OFF_PAYLOAD_LEN + 1]]) as usize;

        if buf.len() != HEADER_LEN + payload_len {
            return Err(FormatError::LengthMismatch);
        }
        if kind != MsgKind::Data && payload_len != 0 {
            return Err(FormatError::UnexpectedPayload(kind));
        }

        Ok(Message {
            kind,
            conn_id,
            seq,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {}]",
            self.kind,
            self.conn_id,
            self.seq,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// Sequence number following `seq`, wrapping after 255.
pub fn next_seq(seq: u8) -> u8 {
    seq.wrapping_add(1)
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Buffer shorter than the fixed header size.
    BufferTooShort,
    /// Kind byte does not name a wire message kind.
    UnknownKind(u8),
    /// `payload_len` field does not match the actual remaining bytes.
    LengthMismatch,
    /// Connect or Ack message carrying payload bytes.
    UnexpectedPayload(MsgKind),
    /// Attempt to encode the internal `Invalid` sentinel.
    NotOnWire,
    /// Payload exceeds [`MAX_PAYLOAD`].
    PayloadTooLarge(usize),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::BufferTooShort => write!(f, "buffer too short to contain a header"),
            FormatError::UnknownKind(k) => write!(f, "unknown message kind {k}"),
            FormatError::LengthMismatch => {
                write!(f, "payload_len field does not match remaining bytes")
            }
            FormatError::UnexpectedPayload(kind) => write!(f, "{kind} message carries a payload"),
            FormatError::NotOnWire => write!(f, "Invalid messages have no wire encoding"),
            FormatError::PayloadTooLarge(n) => {
                write!(f, "payload of {n} bytes exceeds limit of {MAX_PAYLOAD}")
            }
        }
    }
}

impl std::error::Error for FormatError {}
