use crate::common::{Error, NodeId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// PREPARE vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Yes,
    No,
}

/// The single document sent back on every exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reply {
    /// Query executed; `node` is the node that ran it
    Ok { node: NodeId, result: Value },
    /// Writes must go to `leader`
    Redirect { leader: NodeId },
    Error { message: String },
    Vote { vote: Vote },
    Ack,
    Alive { node: NodeId, coordinator: NodeId },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    /// Only an explicit YES counts as a yes vote.
    pub fn is_yes_vote(&self) -> bool {
        matches!(self, Reply::Vote { vote: Vote::Yes })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("invalid reply: {}", e)))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
