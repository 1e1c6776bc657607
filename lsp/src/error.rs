//! Application-visible error taxonomy.
//!
//! Lost packets, duplicate acknowledgements and retransmissions are normal
//! protocol events handled inside the engines; only the conditions below ever
//! reach a caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LspError {
    /// The handshake exceeded the epoch-silence limit before any Ack arrived.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The connection (or the whole engine) has shut down.  Sticky.
    #[error("connection closed")]
    ConnectionClosed,

    /// Server read: connection `id` was declared dead by the liveness check.
    #[error("connection {0} lost")]
    ConnectionLost(u16),

    /// Server write addressed to an id that was never assigned.
    #[error("unknown connection id {0}")]
    UnknownConnection(u16),

    #[error("payload of {0} bytes does not fit in one datagram")]
    PayloadTooLarge(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot resolve address: {0}")]
    Resolve(String),

    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
}
