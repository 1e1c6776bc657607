//! Connection lifecycle states.
//!
//! ```text
//!  CONNECTING ──Ack(id, 0)──▶ ESTABLISHED ──close / silence──▶ CLOSING
//!   (client only)                                                 │
//!                                        read_done && write_done  │
//!                                                                 ▼
//!                                                              CLOSED
//! ```
//!
//! The state is never stored; [`crate::connection::Connection::state`]
//! derives it from the record's id and done flags.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connect sent, no id assigned yet.
    Connecting,
    /// Handshake complete; data flows both ways.
    Established,
    /// One direction finished (`read_done` or `write_done`).
    Closing,
    /// Both directions finished; the engine forgets the connection.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
