//! Message envelope and payloads
//!
//! Every request on the wire is a [`Message`]:
//! `{origin_id, type, payload, timestamp, checksum}`. The checksum is the
//! fingerprint of the document without its `checksum` field and is checked
//! against the document exactly as received, before any field is trusted.

use crate::common::{fingerprint, fingerprint_value, timestamp_now, Error, NodeId, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

const CHECKSUM_FIELD: &str = "checksum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ClientQuery,
    Prepare,
    Commit,
    Abort,
    Coordinator,
    Heartbeat,
    Ack,
}

impl MessageType {
    /// Messages exchanged between cluster members; these must be signed.
    pub fn is_peer_message(&self) -> bool {
        !matches!(self, MessageType::ClientQuery)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ClientQuery => "CLIENT_QUERY",
            MessageType::Prepare => "PREPARE",
            MessageType::Commit => "COMMIT",
            MessageType::Abort => "ABORT",
            MessageType::Coordinator => "COORDINATOR",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Ack => "ACK",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender; absent for external clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<NodeId>,

    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub payload: Value,

    /// Seconds since the Unix epoch
    #[serde(default)]
    pub timestamp: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Message {
    /// Build a signed message stamped with the current time.
    pub fn new(origin_id: Option<NodeId>, kind: MessageType, payload: Value) -> Result<Self> {
        let mut message = Self {
            origin_id,
            kind,
            payload,
            timestamp: timestamp_now(),
            checksum: None,
        };
        message.sign()?;
        Ok(message)
    }

    /// Build a signed message with a typed payload.
    pub fn with_payload<P: Serialize>(
        origin_id: Option<NodeId>,
        kind: MessageType,
        payload: &P,
    ) -> Result<Self> {
        Self::new(origin_id, kind, serde_json::to_value(payload)?)
    }

    /// Fingerprint of every field except the checksum.
    fn digest(&self) -> Result<String> {
        if self.checksum.is_none() {
            return fingerprint(self);
        }
        let unsigned = Self {
            checksum: None,
            ..self.clone()
        };
        fingerprint(&unsigned)
    }

    pub fn sign(&mut self) -> Result<()> {
        self.checksum = None;
        self.checksum = Some(self.digest()?);
        Ok(())
    }

    /// Check the checksum of a message built in memory.
    pub fn verify(&self) -> Result<()> {
        let expected = self
            .checksum
            .as_deref()
            .ok_or_else(|| Error::Protocol("message is not signed".into()))?;
        let actual = self.digest()?;
        if actual != expected {
            return Err(Error::Integrity {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and verify a message received from the wire.
    ///
    /// The checksum is recomputed over the received document itself, so
    /// fields this version does not know about are still covered.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let document: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;
        let Value::Object(mut fields) = document else {
            return Err(Error::Protocol("message is not a JSON object".into()));
        };

        let checksum = match fields.remove(CHECKSUM_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => return Err(Error::Protocol("checksum must be a string".into())),
        };

        let unsigned = Value::Object(fields);
        if let Some(expected) = &checksum {
            let actual = fingerprint_value(&unsigned);
            if &actual != expected {
                return Err(Error::Integrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let mut message: Message = serde_json::from_value(unsigned)
            .map_err(|e| Error::Protocol(format!("invalid message: {}", e)))?;
        if checksum.is_none() && message.kind.is_peer_message() {
            return Err(Error::Protocol(format!("unsigned {} message", message.kind)));
        }
        message.checksum = checksum;
        Ok(message)
    }

    /// Deserialize the payload into the type expected for this message.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", self.kind, e)))
    }
}

/// `CLIENT_QUERY` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

impl QueryPayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
        }
    }
}

/// `PREPARE` and `COMMIT` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnPayload {
    pub txn_id: Uuid,
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

/// `ABORT` payload; the id is optional so a bare `{}` is still valid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<Uuid>,
}

/// `COORDINATOR` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorPayload {
    pub new_coord: NodeId,
}
