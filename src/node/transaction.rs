//! Two-phase commit
//!
//! [`TransactionCoordinator`] drives a write across every peer:
//!
//! 1. log PREPARE, send `PREPARE` to all peers concurrently
//! 2. only an explicit YES vote counts; silence and errors are NO
//! 3. all YES: log COMMIT, broadcast `COMMIT`, apply locally, log COMPLETE
//! 4. any NO: log ABORT, broadcast `ABORT`, nothing applied locally
//!
//! [`Participant`] is the other side: it stages on PREPARE, applies on
//! COMMIT and forgets on ABORT.

use crate::common::{NodeId, NodeMetrics, Result, RuntimeConfig};
use crate::node::txlog::{RecoveryReport, TxnLog, TxnPhase};
use crate::protocol::{AbortPayload, MessageType, Reply, TxnPayload, Vote};
use crate::storage::{QueryResult, Storage};
use crate::transport::PeerClient;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// How a 2PC round ended
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome {
    Committed {
        txn_id: Uuid,
        result: QueryResult,
        /// Confirmation naming the node that executed the write
        message: String,
    },
    Aborted {
        txn_id: Uuid,
        /// Names the peers that did not vote YES
        reason: String,
    },
}

impl TxnOutcome {
    /// Client reply for this outcome, as produced by node `node`.
    ///
    /// Both outcomes are `OK`: the round itself completed, and the result
    /// text says whether it committed. `ERROR` is left for storage failures.
    pub fn into_reply(self, node: NodeId) -> Reply {
        let result = match self {
            TxnOutcome::Committed { message, .. } => message,
            TxnOutcome::Aborted { reason, .. } => reason,
        };
        Reply::Ok {
            node,
            result: Value::String(result),
        }
    }

    pub fn txn_id(&self) -> Uuid {
        match self {
            TxnOutcome::Committed { txn_id, .. } | TxnOutcome::Aborted { txn_id, .. } => *txn_id,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed { .. })
    }
}

/// Coordinator side of 2PC
pub struct TransactionCoordinator {
    node_id: NodeId,
    client: PeerClient,
    storage: Storage,
    metrics: Arc<NodeMetrics>,
    write_gate: Option<tokio::sync::Mutex<()>>,
    log: Option<Mutex<TxnLog>>,
}

impl TransactionCoordinator {
    pub fn new(
        client: PeerClient,
        storage: Storage,
        metrics: Arc<NodeMetrics>,
        settings: &RuntimeConfig,
    ) -> Result<Self> {
        let log = match &settings.txn_log_path {
            Some(path) => Some(Mutex::new(TxnLog::open(path, settings.txn_log_sync)?)),
            None => None,
        };

        Ok(Self {
            node_id: client.peers().local_id(),
            client,
            storage,
            metrics,
            write_gate: settings.serialize_writes.then(|| tokio::sync::Mutex::new(())),
            log,
        })
    }

    fn lock_log(log: &Mutex<TxnLog>) -> MutexGuard<'_, TxnLog> {
        log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a phase record; a settling record also compacts the log.
    fn log_phase(&self, txn_id: Uuid, phase: TxnPhase, query: Option<&str>) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let mut log = Self::lock_log(log);
        log.append(txn_id, phase, query)?;
        if matches!(phase, TxnPhase::Abort | TxnPhase::Complete) && log.compact()? {
            tracing::debug!(%txn_id, "transaction log compacted");
        }
        Ok(())
    }

    /// Run one write through 2PC.
    ///
    /// `Err` only when the local apply fails after the commit decision, or
    /// when the phase log cannot be written before any peer was contacted.
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<TxnOutcome> {
        let _gate = match &self.write_gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let txn_id = Uuid::new_v4();
        let payload = serde_json::to_value(TxnPayload {
            txn_id,
            query: query.to_string(),
            params: params.to_vec(),
        })?;

        self.log_phase(txn_id, TxnPhase::Prepare, Some(query))?;
        tracing::debug!(%txn_id, query, "PREPARE");

        let votes: Vec<(NodeId, bool)> = self
            .client
            .broadcast_all(MessageType::Prepare, payload.clone())
            .await
            .into_iter()
            .map(|(peer, reply)| {
                let yes = match &reply {
                    Ok(reply) => reply.is_yes_vote(),
                    Err(e) => {
                        tracing::warn!(%txn_id, peer, error = %e, "no vote from peer");
                        false
                    }
                };
                (peer, yes)
            })
            .collect();

        let refused: Vec<NodeId> = votes
            .iter()
            .filter(|(_, yes)| !yes)
            .map(|(peer, _)| *peer)
            .collect();

        if !refused.is_empty() {
            return Ok(self.abort(txn_id, &refused).await);
        }

        if let Err(e) = self.log_phase(txn_id, TxnPhase::Commit, None) {
            tracing::error!(%txn_id, error = %e, "could not log commit decision");
            return Ok(self.abort(txn_id, &[]).await);
        }

        let acked = self
            .client
            .broadcast_all(MessageType::Commit, payload)
            .await
            .into_iter()
            .filter(|(peer, reply)| match reply {
                Ok(Reply::Ack) => true,
                Ok(other) => {
                    tracing::warn!(%txn_id, peer, reply = ?other, "COMMIT not acknowledged");
                    false
                }
                Err(e) => {
                    tracing::warn!(%txn_id, peer, error = %e, "COMMIT not delivered");
                    false
                }
            })
            .count();

        let result = self.storage.execute(query, params).await?;
        if let Err(e) = self.log_phase(txn_id, TxnPhase::Complete, None) {
            tracing::warn!(%txn_id, error = %e, "could not log completion");
        }
        self.metrics.record_commit();

        let message = format!(
            "SUCCESS: transaction committed by node {} and replicated to {} peer(s)",
            self.node_id, acked
        );
        tracing::info!(%txn_id, acked, "transaction committed");

        Ok(TxnOutcome::Committed {
            txn_id,
            result,
            message,
        })
    }

    async fn abort(&self, txn_id: Uuid, refused: &[NodeId]) -> TxnOutcome {
        if let Err(e) = self.log_phase(txn_id, TxnPhase::Abort, None) {
            tracing::warn!(%txn_id, error = %e, "could not log abort decision");
        }

        self.broadcast_abort(txn_id).await;
        self.metrics.record_abort();

        let reason = if refused.is_empty() {
            format!("ERROR: transaction {} aborted by node {}", txn_id, self.node_id)
        } else {
            let ids: Vec<String> = refused.iter().map(|id| id.to_string()).collect();
            format!(
                "ERROR: transaction aborted, no YES vote from node(s) {}",
                ids.join(", ")
            )
        };
        tracing::warn!(%txn_id, ?refused, "transaction aborted");

        TxnOutcome::Aborted { txn_id, reason }
    }

    async fn broadcast_abort(&self, txn_id: Uuid) {
        let payload = AbortPayload {
            txn_id: Some(txn_id),
        };
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(%txn_id, error = %e, "could not encode ABORT");
                return;
            }
        };
        for (peer, reply) in self.client.broadcast_all(MessageType::Abort, payload).await {
            if let Err(e) = reply {
                tracing::debug!(%txn_id, peer, error = %e, "ABORT not delivered");
            }
        }
    }

    /// Settle rounds a previous run left open in the phase log.
    ///
    /// Undecided rounds are presumed aborted: the abort is logged and sent
    /// to every peer. Commits without a completion record are reported and
    /// stay in the log.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let Some(log) = &self.log else {
            return Ok(RecoveryReport::default());
        };

        let path = Self::lock_log(log).path().to_path_buf();
        let report = TxnLog::recover(&path)?;

        for record in &report.in_doubt {
            tracing::warn!(
                txn_id = %record.txn_id,
                query = record.query.as_deref().unwrap_or(""),
                "presuming abort for undecided transaction"
            );
            self.log_phase(record.txn_id, TxnPhase::Abort, None)?;
            self.broadcast_abort(record.txn_id).await;
        }

        for record in &report.unfinished_commits {
            tracing::warn!(
                txn_id = %record.txn_id,
                query = record.query.as_deref().unwrap_or(""),
                "commit decided but never completed locally"
            );
        }

        Self::lock_log(log).compact()?;

        Ok(report)
    }
}

/// A PREPARE waiting for its decision
struct Staged {
    txn: TxnPayload,
    at: Instant,
}

/// Participant side of 2PC
///
/// Staged entries older than the TTL are dropped on the next PREPARE, so a
/// coordinator that dies between phases leaves nothing behind for long.
pub struct Participant {
    storage: Storage,
    ttl: Duration,
    staged: Mutex<HashMap<Uuid, Staged>>,
}

impl Participant {
    pub fn new(storage: Storage, ttl: Duration) -> Self {
        Self {
            storage,
            ttl,
            staged: Mutex::new(HashMap::new()),
        }
    }

    fn staged(&self) -> MutexGuard<'_, HashMap<Uuid, Staged>> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stage the write and vote YES. There is no conflict check.
    pub fn prepare(&self, txn: TxnPayload) -> Reply {
        let now = Instant::now();
        let mut staged = self.staged();

        let before = staged.len();
        staged.retain(|_, entry| now.duration_since(entry.at) < self.ttl);
        let expired = before - staged.len();
        if expired > 0 {
            tracing::warn!(expired, "dropped undecided transactions");
        }

        tracing::debug!(txn_id = %txn.txn_id, "staged");
        staged.insert(txn.txn_id, Staged { txn, at: now });
        Reply::Vote { vote: Vote::Yes }
    }

    /// Apply the committed write to local storage.
    ///
    /// The staged PREPARE is what gets applied; the COMMIT payload is used
    /// only when nothing is staged under its id.
    pub async fn commit(&self, txn: TxnPayload) -> Reply {
        let txn = match self.staged().remove(&txn.txn_id) {
            Some(entry) => entry.txn,
            None => {
                tracing::debug!(txn_id = %txn.txn_id, "commit without a staged prepare");
                txn
            }
        };

        match self.storage.execute(&txn.query, &txn.params).await {
            Ok(_) => {
                tracing::debug!(txn_id = %txn.txn_id, "applied");
                Reply::Ack
            }
            Err(e) => {
                tracing::warn!(txn_id = %txn.txn_id, error = %e, "commit failed locally");
                Reply::error(e.to_string())
            }
        }
    }

    pub fn abort(&self, abort: AbortPayload) -> Reply {
        if let Some(txn_id) = abort.txn_id {
            if self.staged().remove(&txn_id).is_some() {
                tracing::debug!(%txn_id, "dropped staged transaction");
            }
        }
        Reply::Ack
    }

    /// Number of transactions staged and not yet decided
    pub fn pending(&self) -> usize {
        self.staged().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PeerConfig;
    use crate::protocol::{read_document, write_document, Message};
    use crate::transport::PeerTable;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    /// Peer that answers every PREPARE with `vote` and records what it saw.
    async fn fake_peer(id: NodeId, vote: Vote) -> (PeerConfig, Arc<Mutex<Vec<MessageType>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader);
                let Ok(Some(bytes)) = read_document(&mut reader, 1 << 20).await else {
                    continue;
                };
                let message = Message::decode(&bytes).unwrap();
                log.lock().unwrap().push(message.kind);
                let reply = match message.kind {
                    MessageType::Prepare => Reply::Vote { vote },
                    _ => Reply::Ack,
                };
                let _ = write_document(&mut writer, &reply.encode().unwrap()).await;
            }
        });

        let peer = PeerConfig {
            id,
            ip: "127.0.0.1".into(),
            port,
        };
        (peer, seen)
    }

    async fn dead_peer(id: NodeId) -> PeerConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        PeerConfig {
            id,
            ip: "127.0.0.1".into(),
            port,
        }
    }

    fn settings() -> RuntimeConfig {
        RuntimeConfig {
            connect_timeout_ms: 300,
            request_timeout_ms: 500,
            ..RuntimeConfig::default()
        }
    }

    async fn coordinator(peers: Vec<PeerConfig>, settings: &RuntimeConfig) -> (TransactionCoordinator, Storage) {
        let storage = Storage::new_memory().unwrap();
        storage
            .execute("CREATE TABLE t (id INTEGER)", &[])
            .await
            .unwrap();
        let client = PeerClient::new(Arc::new(PeerTable::new(3, peers)), settings);
        let coordinator = TransactionCoordinator::new(
            client,
            storage.clone(),
            Arc::new(NodeMetrics::new()),
            settings,
        )
        .unwrap();
        (coordinator, storage)
    }

    async fn count(storage: &Storage) -> usize {
        storage
            .execute("SELECT id FROM t", &[])
            .await
            .unwrap()
            .rows()
            .map(|r| r.len())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_commit_without_peers() {
        let (coordinator, storage) = coordinator(vec![], &settings()).await;
        let outcome = coordinator
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap();

        assert!(outcome.is_committed());
        assert_eq!(count(&storage).await, 1);
        match outcome.into_reply(3) {
            Reply::Ok { node, result } => {
                assert_eq!(node, 3);
                assert!(result.as_str().unwrap().contains("node 3"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_yes_commits_everywhere() {
        let (p1, seen1) = fake_peer(1, Vote::Yes).await;
        let (p2, seen2) = fake_peer(2, Vote::Yes).await;
        let (coordinator, storage) = coordinator(vec![p1, p2], &settings()).await;

        let outcome = coordinator
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap();

        assert!(outcome.is_committed());
        assert_eq!(count(&storage).await, 1);
        for seen in [seen1, seen2] {
            assert_eq!(
                *seen.lock().unwrap(),
                vec![MessageType::Prepare, MessageType::Commit]
            );
        }
        assert_eq!(coordinator.metrics.snapshot().committed, 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_aborts_everywhere() {
        let (p1, seen1) = fake_peer(1, Vote::Yes).await;
        let p2 = dead_peer(2).await;
        let (coordinator, storage) = coordinator(vec![p1, p2], &settings()).await;

        let outcome = coordinator
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap();

        match &outcome {
            TxnOutcome::Aborted { reason, .. } => assert!(reason.contains('2')),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(count(&storage).await, 0);
        assert_eq!(
            *seen1.lock().unwrap(),
            vec![MessageType::Prepare, MessageType::Abort]
        );
        assert_eq!(coordinator.metrics.snapshot().aborted, 1);
        match outcome.into_reply(3) {
            Reply::Ok { node, result } => {
                assert_eq!(node, 3);
                let text = result.as_str().unwrap();
                assert!(text.starts_with("ERROR: transaction aborted"), "{}", text);
                assert!(text.contains("node(s) 2"), "{}", text);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_vote_aborts() {
        let (p1, _) = fake_peer(1, Vote::No).await;
        let (coordinator, storage) = coordinator(vec![p1], &settings()).await;

        let outcome = coordinator
            .execute("INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap();
        assert!(!outcome.is_committed());
        assert_eq!(count(&storage).await, 0);
    }

    #[tokio::test]
    async fn test_local_failure_after_commit_is_storage_error() {
        let (coordinator, _) = coordinator(vec![], &settings()).await;
        let err = coordinator
            .execute("INSERT INTO missing VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::common::Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_participant_lifecycle() {
        let storage = Storage::new_memory().unwrap();
        storage
            .execute("CREATE TABLE t (id INTEGER)", &[])
            .await
            .unwrap();
        let participant = Participant::new(storage.clone(), Duration::from_secs(60));

        let txn = TxnPayload {
            txn_id: Uuid::new_v4(),
            query: "INSERT INTO t VALUES (?1)".into(),
            params: vec![serde_json::json!(7)],
        };
        assert!(participant.prepare(txn.clone()).is_yes_vote());
        assert_eq!(participant.pending(), 1);
        assert_eq!(participant.commit(txn).await, Reply::Ack);
        assert_eq!(participant.pending(), 0);
        assert_eq!(count(&storage).await, 1);

        let dropped = TxnPayload {
            txn_id: Uuid::new_v4(),
            query: "INSERT INTO t VALUES (8)".into(),
            params: vec![],
        };
        participant.prepare(dropped.clone());
        let reply = participant.abort(AbortPayload {
            txn_id: Some(dropped.txn_id),
        });
        assert_eq!(reply, Reply::Ack);
        assert_eq!(participant.pending(), 0);
        assert_eq!(count(&storage).await, 1);

        assert_eq!(participant.abort(AbortPayload::default()), Reply::Ack);
    }

    #[tokio::test]
    async fn test_participant_commit_reports_storage_error() {
        let participant = Participant::new(Storage::new_memory().unwrap(), Duration::from_secs(60));
        let reply = participant
            .commit(TxnPayload {
                txn_id: Uuid::new_v4(),
                query: "INSERT INTO missing VALUES (1)".into(),
                params: vec![],
            })
            .await;
        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[tokio::test]
    async fn test_undecided_prepares_expire() {
        let participant = Participant::new(Storage::new_memory().unwrap(), Duration::from_millis(20));
        for _ in 0..100 {
            participant.prepare(TxnPayload {
                txn_id: Uuid::new_v4(),
                query: "INSERT INTO t VALUES (1)".into(),
                params: vec![],
            });
        }
        assert_eq!(participant.pending(), 100);

        tokio::time::sleep(Duration::from_millis(60)).await;
        participant.prepare(TxnPayload {
            txn_id: Uuid::new_v4(),
            query: "INSERT INTO t VALUES (2)".into(),
            params: vec![],
        });
        assert_eq!(participant.pending(), 1);
    }

    #[tokio::test]
    async fn test_commit_applies_staged_write() {
        let storage = Storage::new_memory().unwrap();
        storage
            .execute("CREATE TABLE t (id INTEGER)", &[])
            .await
            .unwrap();
        let participant = Participant::new(storage.clone(), Duration::from_secs(60));

        let txn_id = Uuid::new_v4();
        participant.prepare(TxnPayload {
            txn_id,
            query: "INSERT INTO t VALUES (5)".into(),
            params: vec![],
        });
        let reply = participant
            .commit(TxnPayload {
                txn_id,
                query: String::new(),
                params: vec![],
            })
            .await;
        assert_eq!(reply, Reply::Ack);

        let rows = storage.execute("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.to_json(), serde_json::json!([{"id": 5}]));
    }

    #[tokio::test]
    async fn test_recovery_presumes_abort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let undecided = Uuid::new_v4();
        {
            let mut log = TxnLog::open(&path, crate::common::LogSyncPolicy::Always).unwrap();
            log.append(undecided, TxnPhase::Prepare, Some("INSERT INTO t VALUES (1)"))
                .unwrap();
        }

        let (p1, seen1) = fake_peer(1, Vote::Yes).await;
        let settings = RuntimeConfig {
            txn_log_path: Some(path.to_string_lossy().into_owned()),
            ..settings()
        };
        let (coordinator, _) = coordinator(vec![p1], &settings).await;

        let report = coordinator.recover().await.unwrap();
        assert_eq!(report.in_doubt.len(), 1);
        assert_eq!(report.in_doubt[0].txn_id, undecided);
        assert_eq!(*seen1.lock().unwrap(), vec![MessageType::Abort]);

        // settled and truncated
        assert!(TxnLog::recover(&path).unwrap().is_clean());
        assert!(coordinator.recover().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_phase_log_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let (p1, _) = fake_peer(1, Vote::Yes).await;
        let settings = RuntimeConfig {
            txn_log_path: Some(path.to_string_lossy().into_owned()),
            ..settings()
        };
        let (coordinator, storage) = coordinator(vec![p1], &settings).await;

        for n in 0..50 {
            let outcome = coordinator
                .execute(&format!("INSERT INTO t VALUES ({})", n), &[])
                .await
                .unwrap();
            assert!(outcome.is_committed());
        }
        assert_eq!(count(&storage).await, 50);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
