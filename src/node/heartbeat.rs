//! Coordinator liveness probe

use crate::common::{NodeId, NodeMetrics};
use crate::node::election::{Election, ElectionOutcome};
use crate::node::state::CoordinatorCell;
use crate::protocol::{MessageType, Reply};
use crate::transport::PeerClient;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// What one probe tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// This node is the coordinator
    Skipped,
    Healthy,
    /// The probed node named another coordinator, which this node adopted
    Adopted { coordinator: NodeId },
    /// Probe failed, threshold not reached yet
    Missed { failures: u32 },
    Elected(ElectionOutcome),
}

pub struct Heartbeat {
    node_id: NodeId,
    client: PeerClient,
    coordinator: Arc<CoordinatorCell>,
    election: Arc<Election>,
    metrics: Arc<NodeMetrics>,
    interval: Duration,
    failures_before_election: u32,
    failures: u32,
}

impl Heartbeat {
    pub fn new(
        client: PeerClient,
        coordinator: Arc<CoordinatorCell>,
        election: Arc<Election>,
        metrics: Arc<NodeMetrics>,
        interval: Duration,
        failures_before_election: u32,
    ) -> Self {
        Self {
            node_id: client.peers().local_id(),
            client,
            coordinator,
            election,
            metrics,
            interval,
            failures_before_election: failures_before_election.max(1),
            failures: 0,
        }
    }

    /// Probe forever, one tick per interval.
    pub async fn run(mut self) {
        loop {
            tokio::time::sleep(self.next_delay()).await;
            let probe = self.tick().await;
            tracing::debug!(?probe, metrics = ?self.metrics.snapshot(), "heartbeat tick");
        }
    }

    /// Interval plus up to 10% jitter so nodes do not probe in lockstep.
    fn next_delay(&self) -> Duration {
        let base = self.interval.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 10);
        Duration::from_millis(base + jitter)
    }

    pub async fn tick(&mut self) -> Probe {
        let coordinator = self.coordinator.get();
        if coordinator == self.node_id {
            self.failures = 0;
            return Probe::Skipped;
        }

        let Some(peer) = self.client.peers().get(coordinator).cloned() else {
            tracing::warn!(coordinator, "coordinator is not a known peer");
            return self.elect().await;
        };

        match self
            .client
            .send(&peer, MessageType::Heartbeat, json!({}))
            .await
        {
            Ok(Reply::Alive {
                node,
                coordinator: believed,
            }) if believed != node => {
                self.failures = 0;
                if believed == self.node_id {
                    tracing::info!(node, "probed node names this node as coordinator");
                    return self.elect().await;
                }
                self.coordinator.set(believed);
                tracing::info!(previous = coordinator, coordinator = believed, "adopted coordinator from probe");
                Probe::Adopted {
                    coordinator: believed,
                }
            }
            Ok(_) => {
                self.failures = 0;
                Probe::Healthy
            }
            Err(e) => {
                self.failures += 1;
                tracing::warn!(
                    coordinator,
                    failures = self.failures,
                    error = %e,
                    "coordinator probe failed"
                );
                if self.failures >= self.failures_before_election {
                    self.elect().await
                } else {
                    Probe::Missed {
                        failures: self.failures,
                    }
                }
            }
        }
    }

    async fn elect(&mut self) -> Probe {
        self.failures = 0;
        Probe::Elected(self.election.run().await)
    }
}
