//! Client engine: one connection to one server.
//!
//! # Architecture
//!
//! ```text
//!  Application
//!      │ write / close           read
//!      ▼                          ▲
//!  requests (mpsc)          reads (mpsc, cap 1)
//!      │                          │
//!      └──────▶ coordinator ──────┘       ◀── epoch ticks (timer task)
//!                 │     ▲
//!        send_to  │     │ (Message, addr)
//!                 ▼     │
//!               Socket ─┴── reader task
//! ```
//!
//! The coordinator is the only task that touches the [`Connection`].  Every
//! input (datagram, application request, tick, read permit) is one event; after
//! each event it promotes and transmits whatever the stop-and-wait window now
//! allows.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{lookup_host, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::LspError;
use crate::message::{Message, MsgKind, MAX_PAYLOAD};
use crate::receiver::DataOutcome;
use crate::sender::Promotion;
use crate::socket::{spawn_reader, Socket};
use crate::timer::spawn_epoch_timer;

const INBOUND_QUEUE: usize = 16;
const REQUEST_QUEUE: usize = 16;

enum Request {
    Write {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), LspError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Client: application handle
// ---------------------------------------------------------------------------

/// Handle to an established client connection.
///
/// All methods take `&self`, so the handle can be shared (e.g. in an `Arc`)
/// between a reading task and a writing task.  Dropping it closes the
/// connection gracefully in the background.
pub struct Client {
    conn_id: u16,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    requests: mpsc::Sender<Request>,
    reads: Mutex<mpsc::Receiver<Vec<u8>>>,
    /// Writes are refused: `close` was called or a write already failed.
    writes_closed: AtomicBool,
    /// The engine has delivered its last payload.
    reads_closed: AtomicBool,
}

impl Client {
    /// Connect to the server at `server`.
    ///
    /// Sends a Connect and repeats it every epoch until the server assigns a
    /// connection id.  Fails with [`LspError::ConnectTimeout`] once more than
    /// `config.epoch_limit` epochs pass without hearing from the server.
    pub async fn connect<A: ToSocketAddrs>(server: A, config: Config) -> Result<Self, LspError> {
        config.validate()?;
        let server_addr = lookup_host(server)
            .await
            .map_err(|e| LspError::Resolve(e.to_string()))?
            .next()
            .ok_or_else(|| LspError::Resolve("no address found".into()))?;

        let bind_addr: SocketAddr = if server_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = Arc::new(
            Socket::bind(bind_addr, config.loss)
                .await
                .map_err(LspError::Bind)?,
        );
        let local_addr = socket.local_addr;

        let (net_tx, net_rx) = mpsc::channel(INBOUND_QUEUE);
        let (epoch_tx, epoch_rx) = mpsc::channel(1);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
        let (read_tx, read_rx) = mpsc::channel(1);
        let (handshake_tx, handshake_rx) = oneshot::channel();

        let reader = spawn_reader(Arc::clone(&socket), net_tx, "[client]".to_string());
        let timer = spawn_epoch_timer(config.epoch_duration, epoch_tx);
        let (conn, connect) = Connection::client(server_addr);

        log::info!("[client] connecting to {server_addr} from {local_addr}");
        let engine = ClientEngine {
            socket,
            conn,
            config,
            epoch: 0,
            ready: VecDeque::new(),
            closing: false,
            handshake: Some(handshake_tx),
            reader,
            timer,
        };
        tokio::spawn(engine.run(connect, net_rx, req_rx, epoch_rx, read_tx));

        let conn_id = handshake_rx.await.unwrap_or(Err(LspError::ConnectTimeout))?;
        Ok(Self {
            conn_id,
            server_addr,
            local_addr,
            requests: req_tx,
            reads: Mutex::new(read_rx),
            writes_closed: AtomicBool::new(false),
            reads_closed: AtomicBool::new(false),
        })
    }

    /// Id assigned by the server during the handshake.
    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next in-order payload from the server.
    ///
    /// Payloads received before [`Client::close`] stay readable while the
    /// connection drains.  Fails with [`LspError::ConnectionClosed`] once the
    /// connection is closed, and keeps failing on every later call.
    pub async fn read(&self) -> Result<Vec<u8>, LspError> {
        if self.reads_closed.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        match self.reads.lock().await.recv().await {
            Some(payload) => Ok(payload),
            None => {
                self.reads_closed.store(true, Ordering::Release);
                Err(LspError::ConnectionClosed)
            }
        }
    }

    /// Queue `payload` for delivery.  Returns once queued, not once delivered.
    pub async fn write(&self, payload: &[u8]) -> Result<(), LspError> {
        if self.writes_closed.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(LspError::PayloadTooLarge(payload.len()));
        }

        let (reply, rx) = oneshot::channel();
        let req = Request::Write {
            payload: payload.to_vec(),
            reply,
        };
        if self.requests.send(req).await.is_err() {
            self.writes_closed.store(true, Ordering::Release);
            return Err(LspError::ConnectionClosed);
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.writes_closed.store(true, Ordering::Release);
                Err(e)
            }
            Err(_) => {
                self.writes_closed.store(true, Ordering::Release);
                Err(LspError::ConnectionClosed)
            }
        }
    }

    /// Close the connection.
    ///
    /// Returns once the close is queued behind every earlier write; those
    /// writes are still transmitted and acknowledged before the connection
    /// tears down.  Later writes fail at once; reads return what was already
    /// received, then fail.  Calling it again is a no-op.
    pub async fn close(&self) {
        if self.writes_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct ClientEngine {
    socket: Arc<Socket>,
    conn: Connection,
    config: Config,
    epoch: u64,
    /// In-order Data awaiting the application; an `Invalid` entry marks the end.
    ready: VecDeque<Message>,
    /// The application asked to close; the end-of-stream sentinel is queued.
    closing: bool,
    handshake: Option<oneshot::Sender<Result<u16, LspError>>>,
    reader: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl ClientEngine {
    async fn run(
        mut self,
        connect: Message,
        mut net_rx: mpsc::Receiver<(Message, SocketAddr)>,
        mut req_rx: mpsc::Receiver<Request>,
        mut epoch_rx: mpsc::Receiver<()>,
        read_tx: mpsc::Sender<Vec<u8>>,
    ) {
        self.transmit(&connect).await;
        let mut requests_open = true;

        loop {
            self.consume_end_of_stream();
            if self.conn.state().is_closed() {
                break;
            }
            let network_up = !self.conn.write_done;
            let offer = self.has_readable();

            tokio::select! {
                Some((msg, addr)) = net_rx.recv(), if network_up => {
                    self.handle_net(msg, addr).await;
                }
                req = req_rx.recv(), if requests_open => match req {
                    Some(req) => self.handle_request(req),
                    None => {
                        requests_open = false;
                        self.close();
                    }
                },
                Some(()) = epoch_rx.recv(), if network_up => {
                    self.handle_epoch().await;
                }
                permit = read_tx.reserve(), if offer => match permit {
                    Ok(permit) => {
                        if let Some(msg) = self.ready.pop_front() {
                            permit.send(msg.payload);
                        }
                    }
                    Err(_) => {
                        self.conn.read_done = true;
                        self.ready.clear();
                    }
                },
                else => break,
            }

            self.check_to_send().await;
        }

        self.reader.abort();
        self.timer.abort();
        log::info!("{} connection closed", self.tag());
    }

    fn tag(&self) -> String {
        format!("[client {}]", self.conn.id)
    }

    /// Reaching the end-of-stream sentinel means every read has been delivered.
    fn consume_end_of_stream(&mut self) {
        if self.ready.front().is_some_and(Message::is_invalid) {
            self.ready.clear();
            self.conn.read_done = true;
        }
    }

    fn has_readable(&self) -> bool {
        !self.conn.read_done && !self.ready.is_empty()
    }

    /// Buffer an in-order payload ahead of any end-of-stream sentinel.
    fn buffer(&mut self, msg: Message) {
        if self.conn.read_done {
            return;
        }
        match self.ready.back() {
            Some(last) if last.is_invalid() => {
                let at = self.ready.len() - 1;
                self.ready.insert(at, msg);
            }
            _ => self.ready.push_back(msg),
        }
    }

    async fn handle_net(&mut self, msg: Message, addr: SocketAddr) {
        if addr != self.conn.addr {
            log::debug!("{} ignoring {msg} from stranger {addr}", self.tag());
            return;
        }
        self.conn.heard(self.epoch);

        match msg.kind {
            MsgKind::Data => {
                if self.conn.id == 0 || msg.conn_id != self.conn.id {
                    log::debug!("{} ignoring {msg}: not for this connection", self.tag());
                    return;
                }
                match self.conn.on_data(msg.seq) {
                    DataOutcome::Deliver(ack) => {
                        log::debug!("{} received & acknowledged {msg}", self.tag());
                        self.buffer(msg);
                        self.transmit(&ack).await;
                    }
                    DataOutcome::Reack(ack) => {
                        log::debug!("{} duplicate data #{}; re-acknowledging", self.tag(), msg.seq);
                        self.transmit(&ack).await;
                    }
                    DataOutcome::Ignore => {
                        log::trace!(
                            "{} ignoring data #{}, expecting {}",
                            self.tag(),
                            msg.seq,
                            self.conn.receiver.next_seq
                        );
                    }
                }
            }
            MsgKind::Ack if self.conn.id == 0 => {
                if self.conn.establish(&msg) {
                    log::info!("{} connected to {}", self.tag(), self.conn.addr);
                    if let Some(tx) = self.handshake.take() {
                        let _ = tx.send(Ok(self.conn.id));
                    }
                } else {
                    log::debug!("{} ignoring {msg} during handshake", self.tag());
                }
            }
            MsgKind::Ack => {
                if self.conn.on_ack(msg.seq) {
                    log::trace!("{} ack #{} received", self.tag(), msg.seq);
                } else {
                    log::trace!("{} ignoring stale ack #{}", self.tag(), msg.seq);
                }
            }
            MsgKind::Connect | MsgKind::Invalid => {
                log::debug!("{} ignoring {msg}", self.tag());
            }
        }
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Write { payload, reply } => {
                let res = if self.closing || self.conn.read_done || self.conn.write_done {
                    Err(LspError::ConnectionClosed)
                } else {
                    self.conn.enqueue(Message::data(0, 0, payload));
                    Ok(())
                };
                let _ = reply.send(res);
            }
            Request::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
        }
    }

    /// Stop reads once the application has drained what was already received;
    /// stop writes once everything queued has been acknowledged.
    fn close(&mut self) {
        if self.closing {
            return;
        }
        log::debug!("{} closing from {}", self.tag(), self.conn.state());
        self.closing = true;
        self.ready.push_back(Message::invalid(self.conn.id));
        if !self.conn.write_done {
            self.conn.enqueue(Message::invalid(self.conn.id));
        }
    }

    async fn handle_epoch(&mut self) {
        self.epoch += 1;

        if self.conn.is_silent(self.epoch, self.config.epoch_limit) {
            log::warn!(
                "{} epoch limit of {} exceeded",
                self.tag(),
                self.config.epoch_limit
            );
            self.conn.finish_writes();
            self.ready.push_back(Message::invalid(self.conn.id));
            if self.conn.id == 0 {
                if let Some(tx) = self.handshake.take() {
                    let _ = tx.send(Err(LspError::ConnectTimeout));
                }
            }
            return;
        }

        let resend: Vec<Message> = self.conn.retransmissions().cloned().collect();
        for msg in &resend {
            log::trace!("{} resending {msg}", self.tag());
            self.transmit(msg).await;
        }
    }

    async fn check_to_send(&mut self) {
        match self.conn.promote() {
            Promotion::Send(msg) => {
                log::debug!("{} sending {msg}", self.tag());
                self.transmit(&msg).await;
            }
            Promotion::Drained => {
                log::debug!("{} all messages acknowledged", self.tag());
                self.conn.finish_writes();
            }
            Promotion::Idle => {}
        }
    }

    async fn transmit(&self, msg: &Message) {
        if let Err(e) = self.socket.send_to(msg, self.conn.addr).await {
            log::warn!("{} send of {msg} failed: {e}", self.tag());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> ClientEngine {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap(), Default::default())
            .await
            .unwrap();
        let (mut conn, _) = Connection::client(socket.local_addr);
        assert!(conn.establish(&Message::ack(4, 0)));
        ClientEngine {
            socket: Arc::new(socket),
            conn,
            config: Config::default(),
            epoch: 0,
            ready: VecDeque::new(),
            closing: false,
            handshake: None,
            reader: tokio::spawn(async {}),
            timer: tokio::spawn(async {}),
        }
    }

    #[tokio::test]
    async fn close_keeps_received_payloads_readable() {
        let mut e = engine().await;
        e.buffer(Message::data(4, 1, b"x".to_vec()));
        e.close();
        e.buffer(Message::data(4, 2, b"y".to_vec()));

        e.consume_end_of_stream();
        assert!(e.has_readable());
        assert_eq!(e.ready.pop_front().unwrap().payload, b"x");
        assert_eq!(e.ready.pop_front().unwrap().payload, b"y");

        e.consume_end_of_stream();
        assert!(e.conn.read_done);
        assert!(!e.has_readable());
        assert!(e.ready.is_empty());
    }

    #[tokio::test]
    async fn writes_are_refused_after_close() {
        let mut e = engine().await;
        e.close();
        e.close();
        let (reply, rx) = oneshot::channel();
        e.handle_request(Request::Write {
            payload: b"late".to_vec(),
            reply,
        });
        assert!(matches!(rx.await.unwrap(), Err(LspError::ConnectionClosed)));
        assert_eq!(e.ready.len(), 1, "one end-of-stream sentinel");
    }
}
