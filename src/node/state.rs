//! Coordinator cell

use crate::common::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Id of the node this node currently believes is coordinator.
///
/// One authoritative value per node. Reads and updates are single atomic
/// operations, so a request is never routed against a half-written id.
/// Only the election subsystem writes it.
#[derive(Debug)]
pub struct CoordinatorCell {
    current: AtomicU64,
}

impl CoordinatorCell {
    pub fn new(initial: NodeId) -> Self {
        Self {
            current: AtomicU64::new(initial),
        }
    }

    pub fn get(&self) -> NodeId {
        self.current.load(Ordering::SeqCst)
    }

    /// Unconditional update; returns the previous id.
    pub fn set(&self, id: NodeId) -> NodeId {
        self.current.swap(id, Ordering::SeqCst)
    }

    /// Update only if the cell still holds `expected`.
    pub fn compare_and_set(&self, expected: NodeId, new: NodeId) -> bool {
        self.current
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is(&self, id: NodeId) -> bool {
        self.get() == id
    }
}
