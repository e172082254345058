//! Common utilities and types shared across minidb

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod utils;

pub use config::{
    ClusterConfig, LocalNodeConfig, LogSyncPolicy, NodeId, PeerConfig, RuntimeConfig,
    StorageConfig,
};
pub use error::{Error, Result};
pub use hash::{blake3_hash, canonicalize, fingerprint, fingerprint_value, verify};
pub use metrics::{MetricsSnapshot, NodeMetrics};
pub use utils::{crc32, is_read_only, timestamp_now, NodeState};
