//! Bully election
//!
//! The highest reachable id wins. A node that suspects the coordinator
//! probes every higher peer; if none answers it promotes itself and
//! announces the result with `COORDINATOR`. Announcements are applied
//! last-writer-wins, with no term check.

use crate::common::{NodeId, NodeMetrics};
use crate::node::state::CoordinatorCell;
use crate::protocol::{CoordinatorPayload, MessageType, Reply};
use crate::transport::PeerClient;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node is now coordinator
    Won,
    /// A higher node answered; `adopted` is set when it already claimed
    /// coordinatorship and this node switched to it
    Yielded { adopted: Option<NodeId> },
    /// Another election on this node was already running
    Coalesced,
}

pub struct Election {
    node_id: NodeId,
    client: PeerClient,
    coordinator: Arc<CoordinatorCell>,
    metrics: Arc<NodeMetrics>,
    gate: tokio::sync::Mutex<()>,
}

impl Election {
    pub fn new(client: PeerClient, coordinator: Arc<CoordinatorCell>, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            node_id: client.peers().local_id(),
            client,
            coordinator,
            metrics,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn run(&self) -> ElectionOutcome {
        let Ok(_running) = self.gate.try_lock() else {
            tracing::debug!("election already in progress");
            return ElectionOutcome::Coalesced;
        };

        self.metrics.record_election_started();
        let higher = self.client.peers().higher_than(self.node_id);
        tracing::info!(
            node = self.node_id,
            higher = higher.len(),
            "starting election"
        );

        if higher.is_empty() {
            self.promote().await;
            return ElectionOutcome::Won;
        }

        let mut answered = Vec::new();
        let mut claimed = None;
        for (peer, reply) in self
            .client
            .broadcast(&higher, MessageType::Heartbeat, json!({}))
            .await
        {
            if let Ok(Reply::Alive { node, coordinator }) = reply {
                answered.push(peer);
                if node == coordinator {
                    claimed = claimed.max(Some(node));
                }
            }
        }

        if answered.is_empty() {
            self.promote().await;
            return ElectionOutcome::Won;
        }

        if let Some(id) = claimed {
            let previous = self.coordinator.set(id);
            if previous != id {
                tracing::info!(coordinator = id, previous, "adopted coordinator");
            }
        } else {
            tracing::info!(?answered, "higher node alive, waiting for its announcement");
        }
        ElectionOutcome::Yielded { adopted: claimed }
    }

    async fn promote(&self) {
        let previous = self.coordinator.set(self.node_id);
        self.metrics.record_election_won();
        tracing::info!(node = self.node_id, previous, "elected coordinator");
        self.announce().await;
    }

    /// Broadcast `COORDINATOR{new_coord: self}` to every peer.
    pub async fn announce(&self) {
        let payload = json!({ "new_coord": self.node_id });
        for (peer, reply) in self
            .client
            .broadcast_all(MessageType::Coordinator, payload)
            .await
        {
            match reply {
                Ok(Reply::Ack) => {}
                Ok(other) => tracing::debug!(peer, reply = ?other, "unexpected reply to COORDINATOR"),
                Err(e) => tracing::debug!(peer, error = %e, "COORDINATOR not delivered"),
            }
        }
    }

    /// Announce on startup when this node holds the highest id, so a
    /// restarted top node reclaims coordinatorship.
    pub async fn announce_if_highest(&self) -> bool {
        if !self.client.peers().higher_than(self.node_id).is_empty() {
            return false;
        }
        self.coordinator.set(self.node_id);
        tracing::info!(node = self.node_id, "announcing coordinatorship");
        self.announce().await;
        true
    }

    /// Apply a received `COORDINATOR` announcement.
    pub fn handle_coordinator(&self, payload: CoordinatorPayload) -> Reply {
        let previous = self.coordinator.set(payload.new_coord);
        if previous != payload.new_coord {
            tracing::info!(coordinator = payload.new_coord, previous, "coordinator changed");
        }
        Reply::Ack
    }
}
