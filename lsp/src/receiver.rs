//! Inbound state for stop-and-wait reliability.
//!
//! The [`Receiver`] decides what happens to each inbound Data message:
//! - The expected sequence number is accepted and acknowledged.
//! - A repeat of the last accepted sequence number is acknowledged again,
//!   since the first Ack was evidently lost.
//! - Anything else is dropped silently; the peer's next retransmission
//!   sorts it out.
//!
//! Like [`crate::sender::Sender`] it never sends anything itself; it hands the
//! Ack to transmit back to the engine.

use crate::message::{next_seq, Message};

/// What the engine should do with an inbound Data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOutcome {
    /// In order: buffer the payload for the application and send this Ack.
    Deliver(Message),
    /// Duplicate of the last delivered message: send this Ack again, nothing else.
    Reack(Message),
    /// Out of order.
    Ignore,
}

/// Stop-and-wait receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Next expected Data sequence number.
    pub next_seq: u8,
    /// Most recently sent acknowledgement, resent every epoch.
    pub last_ack: Option<Message>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            next_seq: next_seq(0),
            last_ack: None,
        }
    }

    /// Record the handshake Ack (`seq` 0) so it is repeated on every epoch.
    pub fn acknowledge_handshake(&mut self, conn_id: u16) -> Message {
        let ack = Message::ack(conn_id, 0);
        self.last_ack = Some(ack.clone());
        ack
    }

    pub fn on_data(&mut self, conn_id: u16, seq: u8) -> DataOutcome {
        if seq == self.next_seq {
            let ack = Message::ack(conn_id, seq);
            self.next_seq = next_seq(seq);
            self.last_ack = Some(ack.clone());
            return DataOutcome::Deliver(ack);
        }
        match &self.last_ack {
            Some(ack) if ack.seq == seq => DataOutcome::Reack(ack.clone()),
            _ => DataOutcome::Ignore,
        }
    }
}
