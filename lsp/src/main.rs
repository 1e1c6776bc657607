//! Entry point for `lsp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! The server echoes every message back to its sender; the client sends each
//! line of stdin and prints the replies.  All protocol work is delegated to the
//! library; `main.rs` owns only process setup (logging, argument parsing).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use lsp::config::{level_filter, DEFAULT_EPOCH_LIMIT, DEFAULT_EPOCH_MILLIS};
use lsp::{Client, Config, LossConfig, LspError, Server};

/// Reliable message transport over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run an echo server.
    Server {
        /// UDP port to listen on.
        port: u16,
        #[command(flatten)]
        opts: Opts,
    },
    /// Connect to a server and send lines from stdin.
    Client {
        /// Server host.
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Server port.
        port: u16,
        #[command(flatten)]
        opts: Opts,
    },
}

#[derive(Args)]
struct Opts {
    /// Epochs of silence before a peer is declared dead.
    #[arg(short = 'k', long, default_value_t = DEFAULT_EPOCH_LIMIT)]
    epoch_limit: u32,
    /// Epoch duration in milliseconds.
    #[arg(short = 'd', long, default_value_t = DEFAULT_EPOCH_MILLIS)]
    epoch_millis: u64,
    /// Percentage of received datagrams to drop.
    #[arg(short = 'r', long, default_value_t = 0)]
    read_drop: u8,
    /// Percentage of sent datagrams to drop.
    #[arg(short = 'w', long, default_value_t = 0)]
    write_drop: u8,
    /// Logging verbosity, 0 (off) to 6.
    #[arg(short = 'v', long, default_value_t = 1)]
    verbosity: u8,
}

impl Opts {
    fn config(&self) -> Config {
        Config::new(self.epoch_limit, self.epoch_millis)
            .with_loss(LossConfig::new(self.read_drop, self.write_drop))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbosity = match &cli.mode {
        Mode::Server { opts, .. } | Mode::Client { opts, .. } => opts.verbosity,
    };
    env_logger::Builder::new()
        .filter_level(level_filter(verbosity))
        .parse_default_env()
        .init();

    match cli.mode {
        Mode::Server { port, opts } => run_server(port, opts.config()).await,
        Mode::Client { host, port, opts } => run_client(&host, port, opts.config()).await,
    }
}

async fn run_server(port: u16, config: Config) -> Result<()> {
    log::info!("clients are dropped after {:?} of silence", config.silence_window());
    let server = Server::listen(port, config)
        .await
        .with_context(|| format!("starting server on port {port}"))?;
    println!("listening on {}", server.local_addr());

    loop {
        match server.read().await {
            Ok((id, payload)) => {
                println!("[{id}] {}", String::from_utf8_lossy(&payload));
                if let Err(e) = server.write(id, &payload).await {
                    log::warn!("echo to connection {id} failed: {e}");
                }
            }
            Err(LspError::ConnectionLost(id)) => println!("[{id}] connection lost"),
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_client(host: &str, port: u16, config: Config) -> Result<()> {
    log::info!("giving up after {:?} of silence", config.silence_window());
    let client = Arc::new(
        Client::connect((host, port), config)
            .await
            .with_context(|| format!("connecting to {host}:{port}"))?,
    );
    println!("connected as {} to {}", client.conn_id(), client.server_addr());

    let reader = Arc::clone(&client);
    let printer = tokio::spawn(async move {
        while let Ok(payload) = reader.read().await {
            println!("{}", String::from_utf8_lossy(&payload));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        client.write(line.as_bytes()).await?;
    }

    client.close().await;
    printer.await.context("reply printer panicked")?;
    Ok(())
}
