//! Cluster descriptor and runtime settings
//!
//! One descriptor per node, loaded once at startup:
//!
//! ```json
//! {
//!   "local_node": {"id": 1, "ip": "127.0.0.1", "port": 5000,
//!                  "storage_config": {"backend": "sqlite", "path": "./node1.db"}},
//!   "peers": [{"id": 2, "ip": "127.0.0.1", "port": 5001}],
//!   "settings": {"heartbeat_interval_ms": 5000}
//! }
//! ```
//!
//! Any `settings` field can be overridden from the environment with
//! `MINIDB__SETTINGS__<FIELD>`.

use crate::common::{Error, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Cluster-wide node identifier
pub type NodeId = u64;

/// Prefix for environment overrides
const ENV_PREFIX: &str = "MINIDB";

/// Full descriptor for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node
    pub local_node: LocalNodeConfig,

    /// Every other node in the cluster
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Timeouts, intervals and logging
    #[serde(default)]
    pub settings: RuntimeConfig,
}

/// Identity, bind address and storage of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,

    /// Local storage backend
    #[serde(default, alias = "db_config")]
    pub storage_config: StorageConfig,
}

impl LocalNodeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A remote member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
}

impl PeerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// SQLite database file
    Sqlite { path: String },
    /// Private in-memory SQLite database
    #[default]
    Memory,
}

/// When the transaction log is flushed to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// fsync after every record
    #[default]
    Always,
    /// flush to the OS after every record
    Interval,
    /// leave buffering to the writer
    Never,
}

/// Runtime tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Liveness probe period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Peer connect timeout; short so dead peers are detected quickly
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on a single request/reply exchange once connected
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Consecutive failed probes before an election starts
    #[serde(default = "default_failures_before_election")]
    pub failures_before_election: u32,

    /// Largest accepted inbound document
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    /// How long a participant keeps a PREPARE that never got a decision
    #[serde(default = "default_staged_txn_ttl")]
    pub staged_txn_ttl_ms: u64,

    /// Run at most one 2PC round at a time on the coordinator
    #[serde(default = "default_serialize_writes")]
    pub serialize_writes: bool,

    /// Transaction phase log; disabled when absent
    #[serde(default)]
    pub txn_log_path: Option<String>,

    #[serde(default)]
    pub txn_log_sync: LogSyncPolicy,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_connect_timeout() -> u64 {
    2_000
}
fn default_request_timeout() -> u64 {
    5_000
}
fn default_failures_before_election() -> u32 {
    1
}
fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_staged_txn_ttl() -> u64 {
    60_000
}
fn default_serialize_writes() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: default_request_timeout(),
            failures_before_election: default_failures_before_election(),
            max_message_bytes: default_max_message_bytes(),
            staged_txn_ttl_ms: default_staged_txn_ttl(),
            serialize_writes: default_serialize_writes(),
            txn_log_path: None,
            txn_log_sync: LogSyncPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl RuntimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn staged_txn_ttl(&self) -> Duration {
        Duration::from_millis(self.staged_txn_ttl_ms)
    }
}

impl ClusterConfig {
    /// Load a descriptor file (JSON), apply environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        };

        let cluster: ClusterConfig = config::Config::builder()
            .add_source(File::from(path).format(format).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cluster.validate()?;
        Ok(cluster)
    }

    /// Parse a descriptor from a JSON string (no environment overrides).
    pub fn from_json(json: &str) -> Result<Self> {
        let cluster: ClusterConfig = serde_json::from_str(json)?;
        cluster.validate()?;
        Ok(cluster)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_node.ip.is_empty() {
            return Err(Error::InvalidConfig("local_node needs an ip".into()));
        }

        let mut seen = HashSet::new();
        seen.insert(self.local_node.id);
        for peer in &self.peers {
            if peer.port == 0 {
                return Err(Error::InvalidConfig(format!(
                    "peer {} has no port",
                    peer.id
                )));
            }
            if !seen.insert(peer.id) {
                return Err(Error::InvalidConfig(format!(
                    "node id {} appears more than once",
                    peer.id
                )));
            }
        }

        let settings = &self.settings;
        if settings.heartbeat_interval_ms == 0
            || settings.connect_timeout_ms == 0
            || settings.request_timeout_ms == 0
        {
            return Err(Error::InvalidConfig(
                "intervals and timeouts must be non-zero".into(),
            ));
        }
        if settings.failures_before_election == 0 {
            return Err(Error::InvalidConfig(
                "failures_before_election must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Highest id among self and peers: the coordinator before any election.
    pub fn initial_coordinator(&self) -> NodeId {
        self.peers
            .iter()
            .map(|p| p.id)
            .chain(std::iter::once(self.local_node.id))
            .max()
            .unwrap_or(self.local_node.id)
    }
}
