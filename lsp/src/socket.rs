//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::message::Message`] instead of raw bytes and applies the
//! [`LossConfig`] fault model on both paths.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{FormatError, Message, MAX_DATAGRAM};
use crate::simulator::LossConfig;

// Larger than MAX_DATAGRAM so an oversized datagram shows up as a length
// mismatch instead of being silently truncated.
const RECV_BUF: usize = MAX_DATAGRAM + 512;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    Io(std::io::Error),
    /// The datagram could not be encoded or decoded as a valid message.
    Format(FormatError),
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "socket I/O error: {e}"),
            Self::Format(e) => write!(f, "malformed message: {e}"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FormatError> for SocketError {
    fn from(e: FormatError) -> Self {
        Self::Format(e)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, message-oriented, optionally lossy UDP socket.
///
/// All methods are `&self` so one socket can be shared by an engine's reader
/// task and its coordinator.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    loss: LossConfig,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing port `0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr, loss: LossConfig) -> std::io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            loss,
            inner,
        })
    }

    /// Encode `msg` and send it as a single UDP datagram to `dest`.
    ///
    /// A write-path drop reports success, exactly as a lossy network would.
    pub async fn send_to(&self, msg: &Message, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = msg.encode()?;
        if self.loss.drop_write() {
            log::trace!("[udp] dropping outbound {msg} to {dest}");
            return Ok(());
        }
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram that survives the read-path drop and decode it.
    ///
    /// Returns `(message, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to keep reading.
    pub async fn recv_from(&self) -> Result<(Message, SocketAddr), SocketError> {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (n, addr) = self.inner.recv_from(&mut buf).await?;
            if self.loss.drop_read() {
                log::trace!("[udp] dropping inbound datagram of {n} bytes from {addr}");
                continue;
            }
            let msg = Message::decode(&buf[..n])?;
            return Ok((msg, addr));
        }
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Spawn an engine's reading task.
///
/// Decodes every datagram and forwards well-formed messages with their source
/// address into `inbound`.  Malformed datagrams and receive errors are logged
/// and skipped; the task only ends when `inbound` is closed or it is aborted.
pub fn spawn_reader(
    socket: Arc<Socket>,
    inbound: mpsc::Sender<(Message, SocketAddr)>,
    tag: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match socket.recv_from().await {
                Ok((msg, addr)) => {
                    log::trace!("{tag} <- {msg} from {addr}");
                    if inbound.send((msg, addr)).await.is_err() {
                        break;
                    }
                }
                Err(SocketError::Format(e)) => {
                    log::debug!("{tag} discarding malformed datagram: {e}");
                }
                Err(SocketError::Io(e)) => {
                    log::warn!("{tag} receive failed: {e}");
                    if inbound.is_closed() {
                        break;
                    }
                }
            }
        }
    })
}
