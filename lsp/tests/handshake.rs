//! Integration tests for connection establishment.
//!
//! Real engines talk over loopback.  Where a test needs to misbehave on one
//! side, a raw `tokio::net::UdpSocket` plays that peer and speaks the wire
//! format directly.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

use lsp::{Client, Config, LossConfig, LspError, Message, MsgKind, Server};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast() -> Config {
    Config::new(5, 50)
}

/// Epochs long enough that nothing is retransmitted during a test.
fn quiet() -> Config {
    Config::new(5, 10_000)
}

async fn server(config: Config) -> Server {
    Server::bind("127.0.0.1:0".parse().unwrap(), config)
        .await
        .expect("bind server")
}

async fn raw_peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.expect("bind raw peer")
}

async fn send(sock: &UdpSocket, msg: &Message, to: SocketAddr) {
    sock.send_to(&msg.encode().unwrap(), to).await.unwrap();
}

/// Next decoded message, or `None` if nothing arrives within `wait`.
async fn recv(sock: &UdpSocket, wait: Duration) -> Option<(Message, SocketAddr)> {
    let mut buf = [0u8; 2048];
    let (n, from) = tokio::time::timeout(wait, sock.recv_from(&mut buf))
        .await
        .ok()?
        .ok()?;
    Some((Message::decode(&buf[..n]).expect("server sent garbage"), from))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clients_receive_increasing_ids() {
    let server = server(fast()).await;
    let addr = server.local_addr();

    let first = Client::connect(addr, fast()).await.expect("first connect");
    let second = Client::connect(addr, fast()).await.expect("second connect");

    assert_eq!(first.conn_id(), 1);
    assert_eq!(second.conn_id(), 2);
    assert_eq!(first.server_addr(), addr);
    assert_ne!(first.local_addr(), second.local_addr());
}

#[tokio::test]
async fn connect_times_out_when_nobody_answers() {
    const LIMIT: u32 = 3;
    const EPOCH_MS: u64 = 100;
    let silent = raw_peer().await;

    let start = Instant::now();
    let res = tokio::time::timeout(
        Duration::from_secs(5),
        Client::connect(silent.local_addr().unwrap(), Config::new(LIMIT, EPOCH_MS)),
    )
    .await
    .expect("connect should give up on its own");
    let elapsed = start.elapsed();

    assert!(matches!(res, Err(LspError::ConnectTimeout)));
    assert!(
        elapsed >= Duration::from_millis(u64::from(LIMIT) * EPOCH_MS),
        "gave up early after {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(u64::from(LIMIT + 2) * EPOCH_MS),
        "gave up late after {elapsed:?}"
    );

    // The Connect was sent (and resent) on the wire in the meantime.
    let (msg, _) = recv(&silent, Duration::from_millis(100)).await.unwrap();
    assert_eq!(msg, Message::connect());
}

#[tokio::test]
async fn lost_connect_is_recovered_by_epoch_resend() {
    const EPOCH_MS: u64 = 50;
    let fake = raw_peer().await;
    let server_addr = fake.local_addr().unwrap();
    let connecting = tokio::spawn(Client::connect(server_addr, Config::new(5, EPOCH_MS)));

    // Treat the first two Connects as lost in transit.
    let (first, client_addr) = recv(&fake, Duration::from_secs(2)).await.unwrap();
    assert_eq!(first, Message::connect());
    let first_at = Instant::now();
    let (second, _) = recv(&fake, Duration::from_secs(2)).await.unwrap();
    assert_eq!(second, Message::connect());
    assert!(
        first_at.elapsed() >= Duration::from_millis(EPOCH_MS / 2),
        "resend must wait for an epoch tick"
    );
    let (third, _) = recv(&fake, Duration::from_secs(2)).await.unwrap();
    assert_eq!(third, Message::connect());

    send(&fake, &Message::ack(5, 0), client_addr).await;
    let client = connecting.await.unwrap().expect("connect after resends");
    assert_eq!(client.conn_id(), 5);
}

#[tokio::test]
async fn lost_handshake_ack_is_answered_on_next_connect() {
    let fake = raw_peer().await;
    let server_addr = fake.local_addr().unwrap();
    let connecting = tokio::spawn(Client::connect(server_addr, Config::new(5, 50)));

    // The Ack for the first Connect never reaches the client.
    let (_, client_addr) = recv(&fake, Duration::from_secs(2)).await.unwrap();

    let (again, from) = recv(&fake, Duration::from_secs(2)).await.unwrap();
    assert_eq!(again, Message::connect());
    assert_eq!(from, client_addr);
    send(&fake, &Message::ack(6, 0), client_addr).await;

    let client = connecting.await.unwrap().expect("connect after repeated ack");
    assert_eq!(client.conn_id(), 6);

    // Once connected the client only repeats its handshake Ack.  A Connect
    // already in flight when the Ack landed may still show up first.
    let mut msg = recv(&fake, Duration::from_secs(2)).await.unwrap().0;
    if msg == Message::connect() {
        msg = recv(&fake, Duration::from_secs(2)).await.unwrap().0;
    }
    assert_eq!(msg, Message::ack(6, 0));
    for _ in 0..2 {
        let (msg, _) = recv(&fake, Duration::from_secs(2)).await.unwrap();
        assert_eq!(msg, Message::ack(6, 0));
    }
}

#[tokio::test]
async fn connect_times_out_when_every_write_is_lost() {
    let server = server(fast()).await;
    let lossy = Config::new(2, 50).with_loss(LossConfig::new(0, 100));

    let res = Client::connect(server.local_addr(), lossy).await;
    assert!(matches!(res, Err(LspError::ConnectTimeout)));
}

#[tokio::test]
async fn duplicate_connect_is_acknowledged_with_same_id() {
    let server = server(quiet()).await;
    let addr = server.local_addr();
    let peer = raw_peer().await;
    let wait = Duration::from_secs(2);

    send(&peer, &Message::connect(), addr).await;
    let (ack, from) = recv(&peer, wait).await.expect("handshake ack");
    assert_eq!(ack, Message::ack(1, 0));
    assert_eq!(from, addr);

    send(&peer, &Message::connect(), addr).await;
    let (again, _) = recv(&peer, wait).await.expect("repeated ack");
    assert_eq!(again, Message::ack(1, 0));

    let other = raw_peer().await;
    send(&other, &Message::connect(), addr).await;
    let (ack, _) = recv(&other, wait).await.expect("second peer ack");
    assert_eq!(ack, Message::ack(2, 0));
}

#[tokio::test]
async fn connect_with_nonzero_sequence_is_ignored() {
    let server = server(quiet()).await;
    let peer = raw_peer().await;

    let mut bogus = Message::connect();
    bogus.seq = 3;
    send(&peer, &bogus, server.local_addr()).await;
    assert!(recv(&peer, Duration::from_millis(200)).await.is_none());

    send(&peer, &Message::connect(), server.local_addr()).await;
    let (ack, _) = recv(&peer, Duration::from_secs(2)).await.unwrap();
    assert_eq!((ack.kind, ack.conn_id), (MsgKind::Ack, 1));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let res = Server::bind("127.0.0.1:0".parse().unwrap(), Config::new(0, 100)).await;
    assert!(matches!(res, Err(LspError::InvalidConfig(_))));

    let server = server(fast()).await;
    let bad_loss = fast().with_loss(LossConfig::new(101, 0));
    let res = Client::connect(server.local_addr(), bad_loss).await;
    assert!(matches!(res, Err(LspError::InvalidConfig(_))));
}

#[tokio::test]
async fn client_ignores_acks_from_strangers() {
    let fake_server = raw_peer().await;
    let stranger = raw_peer().await;
    let server_addr = fake_server.local_addr().unwrap();

    let connecting = tokio::spawn(Client::connect(server_addr, Config::new(5, 50)));
    let (connect, client_addr) = recv(&fake_server, Duration::from_secs(2)).await.unwrap();
    assert_eq!(connect.kind, MsgKind::Connect);

    send(&stranger, &Message::ack(9, 0), client_addr).await;
    send(&fake_server, &Message::ack(4, 0), client_addr).await;

    let client = connecting.await.unwrap().expect("handshake with real server address");
    assert_eq!(client.conn_id(), 4);
}
