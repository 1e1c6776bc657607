//! `lsp`: a reliable, ordered, connection-oriented message transport over UDP.
//!
//! # Architecture
//!
//! ```text
//!   Client / Server handle   (application API)
//!        │ requests    ▲ ready messages
//!        ▼             │
//!  ┌──────────────────────────┐      ┌─────────────┐
//!  │ coordinator task         │◀─────│ epoch timer │
//!  │  Connection(s)           │ tick └─────────────┘
//!  │  Sender / Receiver       │
//!  └────┬────────────────▲────┘
//!       │ send_to        │ (Message, addr)
//!  ┌────▼─────┐    ┌─────┴──────┐
//!  │  Socket  │───▶│ reader task│
//!  └──────────┘    └────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`message`]:    wire format (encode / decode)
//! - [`socket`]:     async UDP socket abstraction and reader task
//! - [`simulator`]:  probabilistic datagram loss for testing
//! - [`timer`]:      epoch ticks
//! - [`sender`]:     stop-and-wait outbound state
//! - [`receiver`]:   stop-and-wait inbound state
//! - [`connection`]: per-connection record
//! - [`state`]:      connection lifecycle
//! - [`table`]:      server connection table
//! - [`client`]:     client engine
//! - [`server`]:     server engine
//! - [`config`]:     epoch parameters and logging verbosity
//! - [`error`]:      application-facing errors

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod table;
pub mod timer;

pub use client::Client;
pub use config::Config;
pub use error::LspError;
pub use message::{Message, MsgKind};
pub use server::Server;
pub use simulator::LossConfig;
