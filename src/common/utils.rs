//! Utility functions for minidb

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Statement keywords that never modify data.
const READ_ONLY_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESCRIBE", "DESC", "EXPLAIN"];

/// Get current Unix timestamp (seconds, fractional)
pub fn timestamp_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// First keyword of a statement, uppercased.
pub fn leading_keyword(query: &str) -> String {
    query
        .trim_start()
        .trim_start_matches('(')
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// Syntactic read classification: any statement that does not start with a
/// read-only keyword is treated as a write and goes through 2PC.
pub fn is_read_only(query: &str) -> bool {
    let keyword = leading_keyword(query);
    READ_ONLY_KEYWORDS.contains(&keyword.as_str())
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Peer health as seen from this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

impl NodeState {
    /// Is this node healthy enough to serve requests?
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    /// State after `consecutive_failures` failed exchanges in a row.
    pub fn from_failures(consecutive_failures: u32) -> Self {
        match consecutive_failures {
            0 => NodeState::Alive,
            1 | 2 => NodeState::Suspect,
            _ => NodeState::Dead,
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
        }
    }
}
