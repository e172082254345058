use crate::common::{Error, NodeId, PeerConfig, Result, RuntimeConfig};
use crate::protocol::{Message, MessageType, Reply};
use crate::transport::{round_trip, PeerTable};
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Signed, time-bounded request/reply to cluster peers
#[derive(Clone)]
pub struct PeerClient {
    origin: NodeId,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_message_bytes: usize,
    peers: Arc<PeerTable>,
}

impl PeerClient {
    pub fn new(peers: Arc<PeerTable>, settings: &RuntimeConfig) -> Self {
        Self {
            origin: peers.local_id(),
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
            max_message_bytes: settings.max_message_bytes,
            peers,
        }
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    /// Send one message to `peer` and wait for its reply.
    ///
    /// Connection refusal, timeouts, and unreadable replies all come back
    /// as `Err`; nothing here panics on a misbehaving peer.
    pub async fn send(&self, peer: &PeerConfig, kind: MessageType, payload: Value) -> Result<Reply> {
        let message = Message::new(Some(self.origin), kind, payload)?;
        let outcome = self.exchange(peer, &message).await;

        match &outcome {
            Ok(_) => self.peers.record_success(peer.id),
            Err(e) => {
                self.peers.record_failure(peer.id);
                tracing::debug!(peer = peer.id, %kind, error = %e, "peer exchange failed");
            }
        }
        outcome
    }

    async fn exchange(&self, peer: &PeerConfig, message: &Message) -> Result<Reply> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((peer.ip.as_str(), peer.port)),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "connect to node {} at {} after {:?}",
                peer.id,
                peer.addr(),
                self.connect_timeout
            ))
        })?
        .map_err(|e| Error::Unreachable {
            peer: peer.id,
            reason: e.to_string(),
        })?;

        timeout(
            self.request_timeout,
            round_trip(stream, message, self.max_message_bytes),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "{} to node {} after {:?}",
                message.kind, peer.id, self.request_timeout
            ))
        })?
        .map_err(|e| match e {
            Error::Io(io) => Error::Unreachable {
                peer: peer.id,
                reason: io.to_string(),
            },
            other => other,
        })
    }

    /// Send the same message to every peer concurrently.
    pub async fn broadcast(
        &self,
        peers: &[PeerConfig],
        kind: MessageType,
        payload: Value,
    ) -> Vec<(NodeId, Result<Reply>)> {
        let sends = peers.iter().map(|peer| {
            let payload = payload.clone();
            async move { (peer.id, self.send(peer, kind, payload).await) }
        });
        join_all(sends).await
    }

    /// Broadcast to the whole peer table.
    pub async fn broadcast_all(&self, kind: MessageType, payload: Value) -> Vec<(NodeId, Result<Reply>)> {
        let peers = self.peers.clone();
        self.broadcast(peers.peers(), kind, payload).await
    }
}
