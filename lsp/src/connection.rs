//! Per-connection protocol record.
//!
//! A [`Connection`] holds the complete state for one client↔server
//! association:
//! - identifiers (server-assigned id, peer address),
//! - the outbound half ([`Sender`]: send queue, in-flight message),
//! - the inbound half ([`Receiver`]: expected sequence, last Ack),
//! - liveness bookkeeping and the two done flags.
//!
//! Records do no I/O.  They are owned and mutated only by their engine's
//! coordinator task, which turns the values returned here into datagrams.

use std::net::SocketAddr;

use crate::message::{Message, MsgKind};
use crate::receiver::{DataOutcome, Receiver};
use crate::sender::{Promotion, Sender};
use crate::state::ConnectionState;

#[derive(Debug)]
pub struct Connection {
    /// Server-assigned id; `0` while the client handshake is outstanding.
    pub id: u16,
    /// Address of the other end.
    pub addr: SocketAddr,
    pub sender: Sender,
    pub receiver: Receiver,
    /// Engine epoch at which anything was last heard from the peer.
    pub last_heard_epoch: u64,
    /// The application has finished reading (closed, or consumed the final sentinel).
    pub read_done: bool,
    /// No further messages will be sent (queue drained, or peer declared dead).
    pub write_done: bool,
}

impl Connection {
    /// Client-side record, synthesized before the server has assigned an id.
    ///
    /// Returns the record and the Connect message to transmit.
    pub fn client(server: SocketAddr) -> (Self, Message) {
        let mut conn = Self::blank(server, 0, 0);
        let connect = conn.sender.start_handshake();
        (conn, connect)
    }

    /// Server-side record for a newly admitted peer.
    ///
    /// Returns the record and the handshake Ack to transmit.
    pub fn server(addr: SocketAddr, id: u16, epoch: u64) -> (Self, Message) {
        let mut conn = Self::blank(addr, id, epoch);
        let ack = conn.receiver.acknowledge_handshake(id);
        (conn, ack)
    }

    fn blank(addr: SocketAddr, id: u16, epoch: u64) -> Self {
        Self {
            id,
            addr,
            sender: Sender::new(),
            receiver: Receiver::new(),
            last_heard_epoch: epoch,
            read_done: false,
            write_done: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match (self.read_done, self.write_done) {
            (true, true) => ConnectionState::Closed,
            (true, false) | (false, true) => ConnectionState::Closing,
            (false, false) if self.id == 0 => ConnectionState::Connecting,
            (false, false) => ConnectionState::Established,
        }
    }

    pub fn heard(&mut self, epoch: u64) {
        self.last_heard_epoch = epoch;
    }

    /// `true` once more than `limit` epochs have passed without contact.
    pub fn is_silent(&self, epoch: u64, limit: u32) -> bool {
        epoch.saturating_sub(self.last_heard_epoch) > u64::from(limit)
    }

    /// Client: accept the Ack of the Connect.  Returns `false` if the Ack does
    /// not complete a handshake (wrong sequence, zero id, or already connected).
    pub fn establish(&mut self, ack: &Message) -> bool {
        let connecting = matches!(&self.sender.pending, Some(p) if p.kind == MsgKind::Connect);
        if self.id != 0 || !connecting || ack.seq != 0 || ack.conn_id == 0 {
            return false;
        }
        self.sender.on_ack(0);
        self.id = ack.conn_id;
        self.receiver.acknowledge_handshake(ack.conn_id);
        true
    }

    pub fn on_data(&mut self, seq: u8) -> DataOutcome {
        self.receiver.on_data(self.id, seq)
    }

    pub fn on_ack(&mut self, seq: u8) -> bool {
        self.sender.on_ack(seq)
    }

    /// Queue a Data message or the close sentinel behind earlier writes.
    pub fn enqueue(&mut self, msg: Message) {
        self.sender.enqueue(msg);
    }

    /// Move the next queued message into flight.  Held back until an id exists.
    pub fn promote(&mut self) -> Promotion {
        if self.id == 0 || self.write_done {
            return Promotion::Idle;
        }
        self.sender.promote(self.id)
    }

    /// Messages to resend on an epoch tick: the in-flight message, then the
    /// most recent Ack.
    pub fn retransmissions(&self) -> impl Iterator<Item = &Message> {
        self.sender
            .pending
            .iter()
            .chain(self.receiver.last_ack.iter())
    }

    /// Mark the outbound direction finished and stop all (re)transmission.
    pub fn finish_writes(&mut self) {
        self.write_done = true;
        self.sender.abandon();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:6666".parse().unwrap()
    }

    #[test]
    fn client_record_starts_connecting() {
        let (conn, connect) = Connection::client(addr());
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(connect.kind, MsgKind::Connect);
        assert_eq!(conn.retransmissions().collect::<Vec<_>>(), vec![&connect]);
    }

    #[test]
    fn handshake_ack_establishes_client() {
        let (mut conn, _) = Connection::client(addr());
        assert!(!conn.establish(&Message::ack(0, 0)), "zero id is not an assignment");
        assert!(!conn.establish(&Message::ack(3, 1)), "wrong sequence");
        assert!(conn.establish(&Message::ack(3, 0)));
        assert_eq!(conn.id, 3);
        assert_eq!(conn.state(), ConnectionState::Established);
        assert!(!conn.establish(&Message::ack(4, 0)), "id is fixed for life");
        assert_eq!(
            conn.retransmissions().cloned().collect::<Vec<_>>(),
            vec![Message::ack(3, 0)]
        );
    }

    #[test]
    fn writes_wait_for_an_id() {
        let (mut conn, _) = Connection::client(addr());
        conn.enqueue(Message::data(0, 0, b"early".to_vec()));
        assert_eq!(conn.promote(), Promotion::Idle);
        conn.establish(&Message::ack(2, 0));
        assert!(matches!(conn.promote(), Promotion::Send(m) if m.conn_id == 2 && m.seq == 1));
    }

    #[test]
    fn server_record_repeats_handshake_ack() {
        let (conn, ack) = Connection::server(addr(), 1, 10);
        assert_eq!(ack, Message::ack(1, 0));
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.retransmissions().collect::<Vec<_>>(), vec![&ack]);
    }

    #[test]
    fn silence_is_strictly_more_than_limit() {
        let (mut conn, _) = Connection::server(addr(), 1, 0);
        assert!(!conn.is_silent(5, 5));
        assert!(conn.is_silent(6, 5));
        conn.heard(6);
        assert!(!conn.is_silent(6, 5));
    }

    #[test]
    fn state_follows_done_flags() {
        let (mut conn, _) = Connection::server(addr(), 1, 0);
        conn.read_done = true;
        assert_eq!(conn.state(), ConnectionState::Closing);
        conn.finish_writes();
        assert!(conn.state().is_closed());
    }

    #[test]
    fn finished_writes_stop_retransmitting_data() {
        let (mut conn, _) = Connection::server(addr(), 1, 0);
        conn.enqueue(Message::data(0, 0, b"x".to_vec()));
        conn.promote();
        conn.finish_writes();
        assert!(conn.sender.pending.is_none());
        assert_eq!(conn.promote(), Promotion::Idle);
    }
}
