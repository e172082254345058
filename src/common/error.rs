//! Error types for minidb

use crate::common::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Integrity Errors ===
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Network Errors ===
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: NodeId, reason: String },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Storage Errors ===
    #[error("{0}")]
    Storage(String),

    // === Cluster Errors ===
    #[error("Not coordinator: current coordinator is node {0}")]
    NotCoordinator(NodeId),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config loader error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. } | Error::Timeout(_) | Error::NotCoordinator(_)
        )
    }

    /// Did this error come from talking to a peer (as opposed to local state)?
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. } | Error::Timeout(_) | Error::Integrity { .. } | Error::Protocol(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}
