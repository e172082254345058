//! Static peer table with advisory health records

use crate::common::{NodeId, NodeState, PeerConfig};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Last known health of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHealth {
    pub state: NodeState,
    pub consecutive_failures: u32,
    pub last_contact: Option<Instant>,
}

impl Default for PeerHealth {
    fn default() -> Self {
        Self {
            state: NodeState::Alive,
            consecutive_failures: 0,
            last_contact: None,
        }
    }
}

/// Membership is fixed at startup; only the health records change.
pub struct PeerTable {
    local_id: NodeId,
    peers: Vec<PeerConfig>,
    health: Mutex<HashMap<NodeId, PeerHealth>>,
}

impl PeerTable {
    pub fn new(local_id: NodeId, mut peers: Vec<PeerConfig>) -> Self {
        peers.retain(|p| p.id != local_id);
        peers.sort_by_key(|p| p.id);
        let health = peers
            .iter()
            .map(|p| (p.id, PeerHealth::default()))
            .collect();
        Self {
            local_id,
            peers,
            health: Mutex::new(health),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// All peers, ordered by id
    pub fn peers(&self) -> &[PeerConfig] {
        &self.peers
    }

    pub fn get(&self, id: NodeId) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Peers that outrank `id` in a Bully election
    pub fn higher_than(&self, id: NodeId) -> Vec<PeerConfig> {
        self.peers.iter().filter(|p| p.id > id).cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, PeerHealth>> {
        // Health records are advisory; a panic elsewhere must not wedge them.
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_success(&self, id: NodeId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.consecutive_failures = 0;
            entry.state = NodeState::Alive;
            entry.last_contact = Some(Instant::now());
        }
    }

    pub fn record_failure(&self, id: NodeId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.state = NodeState::from_failures(entry.consecutive_failures);
        }
    }

    pub fn health(&self, id: NodeId) -> Option<PeerHealth> {
        self.lock().get(&id).copied()
    }

    /// `(id, state)` for every peer, ordered by id
    pub fn states(&self) -> Vec<(NodeId, NodeState)> {
        let health = self.lock();
        self.peers
            .iter()
            .map(|p| {
                let state = health.get(&p.id).map(|h| h.state).unwrap_or(NodeState::Alive);
                (p.id, state)
            })
            .collect()
    }
}
