//! Outbound state for stop-and-wait reliability.
//!
//! [`Sender`] owns the send queue, the single in-flight message and the send
//! sequence counter.  It does **not** touch the socket; the engine calls these
//! methods and performs the actual transmission.
//!
//! # Stop-and-Wait contract
//! - At most **one** message is in flight at any moment (`pending`).
//! - A queued message is promoted only once `pending` is `None`.
//! - On a matching Ack: clear `pending`.
//! - On an epoch tick: resend `pending` unchanged.

use std::collections::VecDeque;

use crate::message::{next_seq, Message};

/// Result of trying to move the head of the send queue into flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// Nothing to do: a message is already in flight, or the queue is empty.
    Idle,
    /// Transmit this message; it is now `pending`.
    Send(Message),
    /// The close sentinel reached the head: every earlier write was acknowledged.
    Drained,
}

/// Stop-and-wait send-side state for one connection.
#[derive(Debug)]
pub struct Sender {
    /// Sequence number given to the next promoted message.
    ///
    /// Data starts at 1; 0 belongs to the Connect handshake.
    pub next_seq: u8,

    /// The in-flight message, or `None` when the sender is idle.
    pub pending: Option<Message>,

    queue: VecDeque<Message>,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new()
    }
}

impl Sender {
    pub fn new() -> Self {
        Self {
            next_seq: next_seq(0),
            pending: None,
            queue: VecDeque::new(),
        }
    }

    /// Put a Connect in flight (client side).  Returns the message to transmit.
    pub fn start_handshake(&mut self) -> Message {
        let connect = Message::connect();
        self.pending = Some(connect.clone());
        connect
    }

    /// Append a Data message or the close sentinel to the send queue.
    pub fn enqueue(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    /// `true` when nothing is queued and nothing awaits acknowledgement.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Promote the queue head if the window is free, stamping it with
    /// `conn_id` and the next sequence number.
    pub fn promote(&mut self, conn_id: u16) -> Promotion {
        if self.pending.is_some() {
            return Promotion::Idle;
        }
        let Some(mut msg) = self.queue.pop_front() else {
            return Promotion::Idle;
        };
        msg.conn_id = conn_id;
        msg.seq = self.next_seq;
        self.next_seq = next_seq(self.next_seq);

        if msg.is_invalid() {
            Promotion::Drained
        } else {
            self.pending = Some(msg.clone());
            Promotion::Send(msg)
        }
    }

    /// Process an inbound Ack sequence number.
    ///
    /// Returns `true` if it acknowledges the in-flight message, which is then
    /// cleared.  A repeated or stale Ack returns `false` and changes nothing.
    pub fn on_ack(&mut self, seq: u8) -> bool {
        match &self.pending {
            Some(p) if p.seq == seq => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Abandon the in-flight message and everything queued behind it.
    pub fn abandon(&mut self) {
        self.pending = None;
        self.queue.clear();
    }
}
