//! Local cluster harness: real nodes on ephemeral ports, in-memory storage

#![allow(dead_code)]

use minidb::common::{ClusterConfig, LocalNodeConfig, PeerConfig, RuntimeConfig, StorageConfig};
use minidb::{NodeHandle, NodeId, NodeServer};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub fn fast_settings() -> RuntimeConfig {
    RuntimeConfig {
        heartbeat_interval_ms: 150,
        connect_timeout_ms: 300,
        request_timeout_ms: 1_000,
        ..RuntimeConfig::default()
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub addr: String,
    pub handle: NodeHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<minidb::Result<()>>>,
}

impl TestNode {
    /// Stop serving and release the port.
    pub async fn kill(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub directory: HashMap<NodeId, String>,
}

impl TestCluster {
    /// Start nodes `1..=size`.
    pub async fn start(size: u64) -> Self {
        Self::start_with(size, &[], fast_settings()).await
    }

    /// Start nodes `1..=size`, leaving the ids in `down` unreachable.
    pub async fn start_with(size: u64, down: &[NodeId], settings: RuntimeConfig) -> Self {
        let mut listeners = Vec::new();
        for id in 1..=size {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            listeners.push((id, port, listener));
        }

        let members: Vec<PeerConfig> = listeners
            .iter()
            .map(|(id, port, _)| PeerConfig {
                id: *id,
                ip: "127.0.0.1".into(),
                port: *port,
            })
            .collect();
        let directory = members.iter().map(|m| (m.id, m.addr())).collect();

        let mut nodes = Vec::new();
        for (id, port, listener) in listeners {
            if down.contains(&id) {
                drop(listener);
                continue;
            }

            let config = ClusterConfig {
                local_node: LocalNodeConfig {
                    id,
                    ip: "127.0.0.1".into(),
                    port,
                    storage_config: StorageConfig::Memory,
                },
                peers: members.iter().filter(|m| m.id != id).cloned().collect(),
                settings: settings.clone(),
            };

            let server = NodeServer::with_listener(config, listener).unwrap();
            let handle = server.handle();
            let (tx, rx) = oneshot::channel::<()>();
            let task = tokio::spawn(server.serve_until(async {
                let _ = rx.await;
            }));

            nodes.push(TestNode {
                id,
                addr: format!("127.0.0.1:{}", port),
                handle,
                shutdown: Some(tx),
                task: Some(task),
            });
        }

        Self { nodes, directory }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).unwrap()
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TestNode {
        self.nodes.iter_mut().find(|n| n.id == id).unwrap()
    }

    pub fn client(&self, id: NodeId) -> minidb::Client {
        minidb::Client::connect_to(self.node(id).addr.clone()).with_directory(self.directory.clone())
    }

    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            node.kill().await;
        }
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
