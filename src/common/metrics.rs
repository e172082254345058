//! Node counters
//!
//! Lock-free counters bumped from the router, the transaction coordinator and
//! the election subsystem. A [`MetricsSnapshot`] is a plain copy for logs and
//! tests.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NodeMetrics {
    requests: AtomicU64,
    reads: AtomicU64,
    redirects: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    integrity_failures: AtomicU64,
    protocol_drops: AtomicU64,
}

/// Point-in-time copy of [`NodeMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub reads: u64,
    pub redirects: u64,
    pub committed: u64,
    pub aborted: u64,
    pub elections_started: u64,
    pub elections_won: u64,
    pub integrity_failures: u64,
    pub protocol_drops: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_request => requests,
        record_read => reads,
        record_redirect => redirects,
        record_commit => committed,
        record_abort => aborted,
        record_election_started => elections_started,
        record_election_won => elections_won,
        record_integrity_failure => integrity_failures,
        record_protocol_drop => protocol_drops,
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            elections_started: self.elections_started.load(Ordering::Relaxed),
            elections_won: self.elections_won.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            protocol_drops: self.protocol_drops.load(Ordering::Relaxed),
        }
    }
}
