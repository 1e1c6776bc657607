//! Server engine: many connections multiplexed over one socket.
//!
//! Structure mirrors the client engine: a reader task, an epoch timer task and
//! one coordinator that owns the [`ConnectionTable`] and the shared ready
//! buffer.  The [`Server`] handle only talks to the coordinator through
//! channels.
//!
//! Shutdown (`close_all`) runs in two phases.  The application side stops
//! first: every connection is closed, the end-of-stream sentinel is appended
//! to the ready buffer and new Connects are refused.  The network side stops
//! once every record has drained out of the table.  The coordinator exits when
//! both sides have stopped and wakes every `close_all` caller.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::LspError;
use crate::message::{Message, MsgKind, MAX_PAYLOAD};
use crate::receiver::DataOutcome;
use crate::sender::Promotion;
use crate::socket::{spawn_reader, Socket};
use crate::table::ConnectionTable;
use crate::timer::spawn_epoch_timer;

const INBOUND_QUEUE: usize = 64;
const REQUEST_QUEUE: usize = 64;

enum Request {
    Write {
        conn_id: u16,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), LspError>>,
    },
    Close {
        conn_id: u16,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Server: application handle
// ---------------------------------------------------------------------------

/// Handle to a running server.
pub struct Server {
    local_addr: SocketAddr,
    requests: mpsc::Sender<Request>,
    reads: Mutex<mpsc::Receiver<Message>>,
    closed: AtomicBool,
}

impl Server {
    /// Listen on `port` on all IPv4 interfaces.
    pub async fn listen(port: u16, config: Config) -> Result<Self, LspError> {
        Self::bind(([0, 0, 0, 0], port).into(), config).await
    }

    /// Listen on an explicit address.  Port `0` picks an ephemeral port; see
    /// [`Server::local_addr`].
    pub async fn bind(addr: SocketAddr, config: Config) -> Result<Self, LspError> {
        config.validate()?;
        let socket = Arc::new(
            Socket::bind(addr, config.loss)
                .await
                .map_err(LspError::Bind)?,
        );
        let local_addr = socket.local_addr;

        let (net_tx, net_rx) = mpsc::channel(INBOUND_QUEUE);
        let (epoch_tx, epoch_rx) = mpsc::channel(1);
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE);
        let (read_tx, read_rx) = mpsc::channel(1);

        let reader = spawn_reader(Arc::clone(&socket), net_tx, "[server]".to_string());
        let timer = spawn_epoch_timer(config.epoch_duration, epoch_tx);

        log::info!("[server] listening on {local_addr}");
        let engine = ServerEngine::new(socket, config, reader, timer);
        tokio::spawn(engine.run(net_rx, req_rx, epoch_rx, read_tx));

        Ok(Self {
            local_addr,
            requests: req_tx,
            reads: Mutex::new(read_rx),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next payload from any client.
    ///
    /// Returns `Err(ConnectionLost(id))` once for each connection whose peer
    /// went silent, and `Err(ConnectionClosed)` on this and every later call
    /// after the server shut down.
    pub async fn read(&self) -> Result<(u16, Vec<u8>), LspError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        match self.reads.lock().await.recv().await {
            Some(msg) if msg.kind == MsgKind::Data => Ok((msg.conn_id, msg.payload)),
            Some(msg) if msg.is_invalid() && msg.conn_id != 0 => {
                Err(LspError::ConnectionLost(msg.conn_id))
            }
            _ => {
                self.closed.store(true, Ordering::Release);
                Err(LspError::ConnectionClosed)
            }
        }
    }

    /// Queue `payload` for connection `conn_id`.
    pub async fn write(&self, conn_id: u16, payload: &[u8]) -> Result<(), LspError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LspError::ConnectionClosed);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(LspError::PayloadTooLarge(payload.len()));
        }

        let (reply, rx) = oneshot::channel();
        let req = Request::Write {
            conn_id,
            payload: payload.to_vec(),
            reply,
        };
        if self.requests.send(req).await.is_err() {
            return Err(LspError::ConnectionClosed);
        }
        rx.await.unwrap_or(Err(LspError::ConnectionClosed))
    }

    /// Close one connection after its queued writes are acknowledged.
    /// Returns as soon as the request is queued.
    pub async fn close_conn(&self, conn_id: u16) {
        if conn_id == 0 || self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.requests.send(Request::Close { conn_id }).await;
    }

    /// Close every connection and wait until all pending writes have drained
    /// and the engine has stopped.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::CloseAll { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct ServerEngine {
    socket: Arc<Socket>,
    config: Config,
    epoch: u64,
    /// Next id to hand out.  Wider than `u16` so exhaustion is detectable.
    next_id: u32,
    table: ConnectionTable,
    /// Data for the application in arrival order, interleaved with `Invalid`
    /// sentinels: `Invalid(id)` for a lost connection, `Invalid(0)` for shutdown.
    ready: VecDeque<Message>,
    app_stopped: bool,
    network_stopped: bool,
    close_waiters: Vec<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl ServerEngine {
    fn new(
        socket: Arc<Socket>,
        config: Config,
        reader: JoinHandle<()>,
        timer: JoinHandle<()>,
    ) -> Self {
        Self {
            socket,
            config,
            epoch: 0,
            next_id: 1,
            table: ConnectionTable::new(),
            ready: VecDeque::new(),
            app_stopped: false,
            network_stopped: false,
            close_waiters: Vec::new(),
            reader,
            timer,
        }
    }

    async fn run(
        mut self,
        mut net_rx: mpsc::Receiver<(Message, SocketAddr)>,
        mut req_rx: mpsc::Receiver<Request>,
        mut epoch_rx: mpsc::Receiver<()>,
        read_tx: mpsc::Sender<Message>,
    ) {
        let mut requests_open = true;
        let mut reads_open = true;

        loop {
            self.filter_ready();
            if self.app_stopped && self.network_stopped {
                break;
            }
            let offer = reads_open && !self.ready.is_empty();
            let network_up = !self.network_stopped;

            tokio::select! {
                Some((msg, addr)) = net_rx.recv(), if network_up => {
                    self.handle_net(msg, addr).await;
                }
                req = req_rx.recv(), if requests_open => match req {
                    Some(req) => self.handle_request(req),
                    None => {
                        requests_open = false;
                        self.shutdown();
                    }
                },
                Some(()) = epoch_rx.recv(), if network_up => {
                    self.handle_epoch().await;
                }
                permit = read_tx.reserve(), if offer => match permit {
                    Ok(permit) => {
                        if let Some(msg) = self.deliver() {
                            permit.send(msg);
                        }
                    }
                    Err(_) => {
                        reads_open = false;
                        self.ready.clear();
                    }
                },
                else => break,
            }

            self.check_to_send().await;
        }

        self.stop_network();
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        log::info!("[server] stopped");
    }

    /// Discard entries at the front of the ready buffer that belong to
    /// connections the application has closed.
    fn filter_ready(&mut self) {
        while let Some(front) = self.ready.front() {
            if front.conn_id == 0 {
                break;
            }
            let stale = match self.table.get(front.conn_id) {
                Some(conn) => conn.read_done,
                None => true,
            };
            if !stale {
                break;
            }
            self.ready.pop_front();
        }
    }

    /// Pop the next entry for the application.  Handing out a lost
    /// connection's sentinel finishes that connection.
    fn deliver(&mut self) -> Option<Message> {
        let msg = self.ready.pop_front()?;
        if msg.is_invalid() && msg.conn_id != 0 {
            if let Some(conn) = self.table.get_mut(msg.conn_id) {
                conn.read_done = true;
                if conn.write_done {
                    self.table.remove(msg.conn_id);
                    log::debug!("[server] connection {} removed", msg.conn_id);
                }
            }
        }
        Some(msg)
    }

    async fn handle_net(&mut self, msg: Message, addr: SocketAddr) {
        match msg.kind {
            MsgKind::Connect => self.admit(msg.seq, addr).await,
            MsgKind::Data => self.handle_data(msg, addr).await,
            MsgKind::Ack => {
                let Some(conn) = self.table.get_mut(msg.conn_id) else {
                    log::debug!("[server] ignoring {msg}: unknown connection");
                    return;
                };
                if conn.addr != addr {
                    log::debug!("[server] ignoring {msg} from {addr}: address mismatch");
                    return;
                }
                conn.heard(self.epoch);
                if conn.on_ack(msg.seq) {
                    log::trace!("[server] ack #{} on connection {}", msg.seq, msg.conn_id);
                }
            }
            MsgKind::Invalid => {}
        }
    }

    async fn admit(&mut self, seq: u8, addr: SocketAddr) {
        if seq != 0 {
            log::debug!("[server] ignoring connect with seq {seq} from {addr}");
            return;
        }
        if let Some(conn) = self.table.get_by_addr_mut(&addr) {
            conn.heard(self.epoch);
            let ack = Message::ack(conn.id, 0);
            log::debug!("[server] duplicate connect from {addr}; re-acknowledging");
            self.transmit(&ack, addr).await;
            return;
        }
        if self.app_stopped {
            log::debug!("[server] refusing connect from {addr}: shutting down");
            return;
        }
        let Ok(id) = u16::try_from(self.next_id) else {
            log::warn!("[server] refusing connect from {addr}: connection ids exhausted");
            return;
        };
        self.next_id += 1;

        let (conn, ack) = Connection::server(addr, id, self.epoch);
        self.table.insert(conn);
        log::info!("[server] accepted connection {id} from {addr}");
        self.transmit(&ack, addr).await;
    }

    async fn handle_data(&mut self, msg: Message, addr: SocketAddr) {
        let epoch = self.epoch;
        let Some(conn) = self.table.get_mut(msg.conn_id) else {
            log::debug!("[server] ignoring {msg}: unknown connection");
            return;
        };
        if conn.addr != addr {
            log::debug!("[server] ignoring {msg} from {addr}: address mismatch");
            return;
        }
        conn.heard(epoch);

        let ack = match conn.on_data(msg.seq) {
            DataOutcome::Deliver(ack) => {
                log::debug!("[server] received & acknowledged {msg}");
                if !conn.read_done {
                    self.ready.push_back(msg);
                }
                ack
            }
            DataOutcome::Reack(ack) => {
                log::debug!(
                    "[server] duplicate data #{} on {}; re-acknowledging",
                    msg.seq,
                    msg.conn_id
                );
                ack
            }
            DataOutcome::Ignore => {
                log::trace!("[server] ignoring data #{} on {}", msg.seq, msg.conn_id);
                return;
            }
        };
        self.transmit(&ack, addr).await;
    }

    fn handle_request(&mut self, req: Request) {
        match req {
            Request::Write {
                conn_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.write(conn_id, payload));
            }
            Request::Close { conn_id } => self.finish_reads(conn_id),
            Request::CloseAll { reply } => {
                self.close_waiters.push(reply);
                self.shutdown();
            }
        }
    }

    fn write(&mut self, conn_id: u16, payload: Vec<u8>) -> Result<(), LspError> {
        match self.table.get_mut(conn_id) {
            Some(conn) if !conn.read_done && !conn.write_done => {
                conn.enqueue(Message::data(conn_id, 0, payload));
                Ok(())
            }
            Some(_) => Err(LspError::ConnectionClosed),
            None if conn_id == 0 || u32::from(conn_id) >= self.next_id => {
                Err(LspError::UnknownConnection(conn_id))
            }
            None => Err(LspError::ConnectionClosed),
        }
    }

    /// Application close of one connection.
    fn finish_reads(&mut self, conn_id: u16) {
        let Some(conn) = self.table.get_mut(conn_id) else {
            return;
        };
        if conn.read_done {
            return;
        }
        conn.read_done = true;
        if conn.write_done || conn.sender.is_idle() {
            self.table.remove(conn_id);
            log::debug!("[server] connection {conn_id} closed");
        } else {
            log::debug!(
                "[server] connection {conn_id} closing after {} queued",
                conn.sender.queued()
            );
            conn.enqueue(Message::invalid(conn_id));
        }
    }

    /// Peer is gone or every write is acknowledged.
    fn finish_writes_for(&mut self, conn_id: u16) {
        let Some(conn) = self.table.get_mut(conn_id) else {
            return;
        };
        conn.finish_writes();
        if conn.read_done {
            self.table.remove(conn_id);
            log::debug!("[server] connection {conn_id} removed");
        } else {
            self.ready.push_back(Message::invalid(conn_id));
        }
    }

    fn shutdown(&mut self) {
        if self.app_stopped {
            return;
        }
        log::info!("[server] closing {} connection(s)", self.table.len());
        for id in self.table.ids() {
            self.finish_reads(id);
        }
        self.ready.push_back(Message::invalid(0));
        self.app_stopped = true;
    }

    fn stop_network(&mut self) {
        if !self.network_stopped {
            self.network_stopped = true;
            self.reader.abort();
            self.timer.abort();
        }
    }

    async fn handle_epoch(&mut self) {
        self.epoch += 1;
        let limit = self.config.epoch_limit;

        let mut dead = Vec::new();
        let mut resend = Vec::new();
        for conn in self.table.iter_mut() {
            if conn.write_done {
                continue;
            }
            if conn.is_silent(self.epoch, limit) {
                dead.push(conn.id);
            } else {
                let addr = conn.addr;
                resend.extend(conn.retransmissions().cloned().map(|m| (m, addr)));
            }
        }

        for id in dead {
            log::warn!("[server] connection {id} lost: epoch limit of {limit} exceeded");
            self.finish_writes_for(id);
        }
        for (msg, addr) in &resend {
            log::trace!("[server] resending {msg}");
            self.transmit(msg, *addr).await;
        }
    }

    async fn check_to_send(&mut self) {
        for id in self.table.ids() {
            let Some(conn) = self.table.get_mut(id) else {
                continue;
            };
            let addr = conn.addr;
            match conn.promote() {
                Promotion::Send(msg) => {
                    log::debug!("[server] sending {msg}");
                    self.transmit(&msg, addr).await;
                }
                Promotion::Drained => {
                    log::debug!("[server] connection {id} drained");
                    self.finish_writes_for(id);
                }
                Promotion::Idle => {}
            }
        }
        if self.app_stopped && self.table.is_empty() {
            self.stop_network();
        }
    }

    async fn transmit(&self, msg: &Message, addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(msg, addr).await {
            log::warn!("[server] send of {msg} to {addr} failed: {e}");
        }
    }
}
