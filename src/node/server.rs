//! Node process: shared context, accept loop and background tasks

use crate::common::{
    ClusterConfig, MetricsSnapshot, NodeId, NodeMetrics, NodeState, Result,
};
use crate::node::election::Election;
use crate::node::heartbeat::Heartbeat;
use crate::node::router::handle_connection;
use crate::node::state::CoordinatorCell;
use crate::node::transaction::{Participant, TransactionCoordinator};
use crate::storage::Storage;
use crate::transport::{PeerClient, PeerTable};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

/// Everything a connection handler needs
pub struct NodeContext {
    pub node_id: NodeId,
    pub coordinator: Arc<CoordinatorCell>,
    pub peers: Arc<PeerTable>,
    pub client: PeerClient,
    pub storage: Storage,
    pub transactions: TransactionCoordinator,
    pub participant: Participant,
    pub election: Arc<Election>,
    pub metrics: Arc<NodeMetrics>,
    pub request_timeout: Duration,
    pub max_message_bytes: usize,
}

impl NodeContext {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let settings = &config.settings;
        let node_id = config.local_node.id;

        let peers = Arc::new(PeerTable::new(node_id, config.peers.clone()));
        let client = PeerClient::new(peers.clone(), settings);
        let coordinator = Arc::new(CoordinatorCell::new(config.initial_coordinator()));
        let metrics = Arc::new(NodeMetrics::new());
        let storage = Storage::open(&config.local_node.storage_config)?;

        let transactions =
            TransactionCoordinator::new(client.clone(), storage.clone(), metrics.clone(), settings)?;
        let election = Arc::new(Election::new(
            client.clone(),
            coordinator.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            node_id,
            coordinator,
            peers,
            client,
            participant: Participant::new(storage.clone(), settings.staged_txn_ttl()),
            storage,
            transactions,
            election,
            metrics,
            request_timeout: settings.request_timeout(),
            max_message_bytes: settings.max_message_bytes,
        })
    }
}

/// Read-only view of a running node
#[derive(Clone)]
pub struct NodeHandle {
    node_id: NodeId,
    coordinator: Arc<CoordinatorCell>,
    metrics: Arc<NodeMetrics>,
    peers: Arc<PeerTable>,
}

impl NodeHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Coordinator this node currently believes in
    pub fn coordinator(&self) -> NodeId {
        self.coordinator.get()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator.is(self.node_id)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn peer_states(&self) -> Vec<(NodeId, NodeState)> {
        self.peers.states()
    }
}

pub struct NodeServer {
    listener: TcpListener,
    config: ClusterConfig,
    ctx: Arc<NodeContext>,
}

impl NodeServer {
    /// Validate the descriptor, open storage and bind the listener.
    pub async fn bind(config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.local_node.bind_addr()).await?;
        Self::with_listener(config, listener)
    }

    /// Build a node around an already bound listener.
    pub fn with_listener(config: ClusterConfig, listener: TcpListener) -> Result<Self> {
        config.validate()?;
        let ctx = Arc::new(NodeContext::new(&config)?);
        Ok(Self {
            listener,
            config,
            ctx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            node_id: self.ctx.node_id,
            coordinator: self.ctx.coordinator.clone(),
            metrics: self.ctx.metrics.clone(),
            peers: self.ctx.peers.clone(),
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let NodeServer {
            listener,
            config,
            ctx,
        } = self;
        let settings = &config.settings;

        tracing::info!("Starting node {}", ctx.node_id);
        tracing::info!("  Listening on: {}", listener.local_addr()?);
        tracing::info!("  Peers: {}", ctx.peers.peers().len());
        tracing::info!("  Storage: {:?}", config.local_node.storage_config);
        tracing::info!("  Coordinator: {}", ctx.coordinator.get());

        let report = ctx.transactions.recover().await?;
        if !report.is_clean() {
            tracing::warn!(
                in_doubt = report.in_doubt.len(),
                unfinished = report.unfinished_commits.len(),
                "recovered transaction log"
            );
        }

        let announce = {
            let election = ctx.election.clone();
            tokio::spawn(async move {
                election.announce_if_highest().await;
            })
        };

        let heartbeat = Heartbeat::new(
            ctx.client.clone(),
            ctx.coordinator.clone(),
            ctx.election.clone(),
            ctx.metrics.clone(),
            settings.heartbeat_interval(),
            settings.failures_before_election,
        );
        let heartbeat = tokio::spawn(heartbeat.run());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("node {} shutting down", ctx.node_id);
                    break;
                }
                accepted = listener.accept() => {
                    handle_accept_result(accepted, &ctx);
                }
            }
        }

        heartbeat.abort();
        announce.abort();
        Ok(())
    }

    pub async fn serve_until_ctrl_c(self) -> Result<()> {
        self.serve_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, ctx: &Arc<NodeContext>) {
    match result {
        Ok((stream, peer)) => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, &ctx).await {
                    tracing::warn!(peer = %peer, error = %err, "connection closed with error");
                }
            });
        }
        Err(err) => tracing::warn!(error = ?err, "failed to accept connection"),
    }
}
