//! # minidb
//!
//! Peer-to-peer middleware that makes several SQL nodes look like one store:
//! - Reads run on whichever node receives them
//! - Writes go through two-phase commit on the coordinator
//! - Bully election replaces a coordinator that stops answering heartbeats
//! - Every message carries a BLAKE3 checksum over its canonical JSON form
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   client ──CLIENT_QUERY──▶ any node
//!                              │ read: local storage
//!                              │ write, not coordinator: REDIRECT
//!                              ▼ write, coordinator
//! ┌──────────────────────────────────────────────┐
//! │ Coordinator (highest live id)                 │
//! │   PREPARE ─▶ votes ─▶ COMMIT | ABORT          │
//! └───────┬──────────────────────┬───────────────┘
//!         │ TCP, one JSON line   │
//!   ┌─────▼──────┐         ┌─────▼──────┐
//!   │ Node 1     │         │ Node 2     │
//!   │ (SQLite)   │         │ (SQLite)   │
//!   └────────────┘         └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! minidb-node ./node1.json
//! ```
//!
//! ### Use the client
//! ```bash
//! minidb --addr 127.0.0.1:5000 --node 2=127.0.0.1:5001 --node 3=127.0.0.1:5002
//! ```

pub mod client;
pub mod common;
pub mod node;
pub mod protocol;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use client::Client;
pub use common::{ClusterConfig, Error, NodeId, Result};
pub use node::{NodeHandle, NodeServer};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
