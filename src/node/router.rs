//! Request router
//!
//! One document in, at most one document out, per connection. Anything
//! that fails to parse, fails its checksum or has no handler is dropped
//! without a reply.

use crate::common::{is_read_only, Error, Result};
use crate::node::server::NodeContext;
use crate::protocol::{
    read_document, write_document, AbortPayload, CoordinatorPayload, Message, MessageType,
    QueryPayload, Reply, TxnPayload,
};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Serve one inbound exchange.
pub async fn handle_connection(stream: TcpStream, ctx: &NodeContext) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let bytes = match timeout(
        ctx.request_timeout,
        read_document(&mut reader, ctx.max_message_bytes),
    )
    .await
    {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            ctx.metrics.record_protocol_drop();
            tracing::debug!(error = %e, "dropping unreadable request");
            return Ok(());
        }
        Err(_) => {
            tracing::debug!("no request within {:?}", ctx.request_timeout);
            return Ok(());
        }
    };

    let message = match Message::decode(&bytes) {
        Ok(message) => message,
        Err(e @ Error::Integrity { .. }) => {
            ctx.metrics.record_integrity_failure();
            tracing::warn!(error = %e, "dropping message with bad checksum");
            return Ok(());
        }
        Err(e) => {
            ctx.metrics.record_protocol_drop();
            tracing::debug!(error = %e, "dropping malformed message");
            return Ok(());
        }
    };

    let kind = message.kind;
    let Some(reply) = dispatch(ctx, message).await else {
        ctx.metrics.record_protocol_drop();
        tracing::debug!(%kind, "no handler, dropping");
        return Ok(());
    };

    write_document(&mut writer, &reply.encode()?).await?;
    let _ = writer.shutdown().await;
    Ok(())
}

/// Route a verified message to its handler.
///
/// `None` means the message must go unanswered.
pub async fn dispatch(ctx: &NodeContext, message: Message) -> Option<Reply> {
    tracing::debug!(kind = %message.kind, origin = ?message.origin_id, "received");

    match message.kind {
        MessageType::ClientQuery => {
            let payload: QueryPayload = decode_payload(&message)?;
            Some(handle_query(ctx, payload).await)
        }
        MessageType::Prepare => {
            let txn: TxnPayload = decode_payload(&message)?;
            Some(ctx.participant.prepare(txn))
        }
        MessageType::Commit => {
            let txn: TxnPayload = decode_payload(&message)?;
            Some(ctx.participant.commit(txn).await)
        }
        MessageType::Abort => {
            let abort: AbortPayload = decode_payload(&message)?;
            Some(ctx.participant.abort(abort))
        }
        MessageType::Coordinator => {
            let payload: CoordinatorPayload = decode_payload(&message)?;
            Some(ctx.election.handle_coordinator(payload))
        }
        MessageType::Heartbeat => Some(Reply::Alive {
            node: ctx.node_id,
            coordinator: ctx.coordinator.get(),
        }),
        MessageType::Ack => None,
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(message: &Message) -> Option<T> {
    match message.payload_as() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::debug!(error = %e, "bad payload");
            None
        }
    }
}

/// Reads run here; writes run 2PC here or get redirected.
async fn handle_query(ctx: &NodeContext, payload: QueryPayload) -> Reply {
    ctx.metrics.record_request();

    if is_read_only(&payload.query) {
        ctx.metrics.record_read();
        return match ctx.storage.execute(&payload.query, &payload.params).await {
            Ok(result) => Reply::Ok {
                node: ctx.node_id,
                result: result.to_json(),
            },
            Err(e) => Reply::error(e.to_string()),
        };
    }

    let leader = ctx.coordinator.get();
    if leader != ctx.node_id {
        ctx.metrics.record_redirect();
        tracing::debug!(leader, "redirecting write");
        return Reply::Redirect { leader };
    }

    match ctx
        .transactions
        .execute(&payload.query, &payload.params)
        .await
    {
        Ok(outcome) => outcome.into_reply(ctx.node_id),
        Err(e) => {
            tracing::warn!(error = %e, "write failed");
            Reply::error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ClusterConfig, LocalNodeConfig, PeerConfig, RuntimeConfig, StorageConfig};
    use crate::protocol::Vote;
    use serde_json::json;
    use uuid::Uuid;

    fn context(id: u64, peers: Vec<PeerConfig>) -> NodeContext {
        let config = ClusterConfig {
            local_node: LocalNodeConfig {
                id,
                ip: "127.0.0.1".into(),
                port: 0,
                storage_config: StorageConfig::Memory,
            },
            peers,
            settings: RuntimeConfig {
                connect_timeout_ms: 300,
                request_timeout_ms: 300,
                ..RuntimeConfig::default()
            },
        };
        NodeContext::new(&config).unwrap()
    }

    fn far_peer(id: u64) -> PeerConfig {
        PeerConfig {
            id,
            ip: "127.0.0.1".into(),
            port: 9,
        }
    }

    fn query(text: &str) -> Message {
        Message::with_payload(None, MessageType::ClientQuery, &QueryPayload::new(text)).unwrap()
    }

    #[tokio::test]
    async fn test_write_on_coordinator_commits() {
        let ctx = context(3, vec![]);
        dispatch(&ctx, query("CREATE TABLE t (id INTEGER)")).await.unwrap();
        let reply = dispatch(&ctx, query("INSERT INTO t VALUES (1)")).await.unwrap();
        assert!(matches!(reply, Reply::Ok { node: 3, .. }));

        let reply = dispatch(&ctx, query("select id from t")).await.unwrap();
        assert_eq!(
            reply,
            Reply::Ok {
                node: 3,
                result: json!([{"id": 1}])
            }
        );
        let metrics = ctx.metrics.snapshot();
        assert_eq!(metrics.requests, 3);
        assert_eq!(metrics.reads, 1);
        assert_eq!(metrics.committed, 2);
    }

    #[tokio::test]
    async fn test_write_on_follower_redirects() {
        let ctx = context(1, vec![far_peer(3)]);
        let reply = dispatch(&ctx, query("INSERT INTO t VALUES (1)")).await.unwrap();
        assert_eq!(reply, Reply::Redirect { leader: 3 });
        assert_eq!(ctx.metrics.snapshot().redirects, 1);
        assert_eq!(ctx.participant.pending(), 0);
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let ctx = context(1, vec![far_peer(3)]);
        let reply = dispatch(&ctx, query("SELECT * FROM missing")).await.unwrap();
        assert!(matches!(reply, Reply::Error { .. }));
    }

    #[tokio::test]
    async fn test_peer_messages() {
        let ctx = context(1, vec![far_peer(3)]);

        let heartbeat = Message::new(Some(3), MessageType::Heartbeat, json!({})).unwrap();
        assert_eq!(
            dispatch(&ctx, heartbeat).await,
            Some(Reply::Alive {
                node: 1,
                coordinator: 3
            })
        );

        let txn = TxnPayload {
            txn_id: Uuid::new_v4(),
            query: "CREATE TABLE t (id INTEGER)".into(),
            params: vec![],
        };
        let prepare = Message::with_payload(Some(3), MessageType::Prepare, &txn).unwrap();
        assert_eq!(
            dispatch(&ctx, prepare).await,
            Some(Reply::Vote { vote: Vote::Yes })
        );
        let commit = Message::with_payload(Some(3), MessageType::Commit, &txn).unwrap();
        assert_eq!(dispatch(&ctx, commit).await, Some(Reply::Ack));

        let abort = Message::new(Some(3), MessageType::Abort, json!({})).unwrap();
        assert_eq!(dispatch(&ctx, abort).await, Some(Reply::Ack));

        let announce = Message::new(Some(3), MessageType::Coordinator, json!({"new_coord": 1})).unwrap();
        assert_eq!(dispatch(&ctx, announce).await, Some(Reply::Ack));
        assert_eq!(ctx.coordinator.get(), 1);
    }

    #[tokio::test]
    async fn test_unanswered_messages() {
        let ctx = context(1, vec![]);
        let ack = Message::new(Some(2), MessageType::Ack, json!({})).unwrap();
        assert!(dispatch(&ctx, ack).await.is_none());

        let bad = Message::new(Some(2), MessageType::Prepare, json!({"query": 1})).unwrap();
        assert!(dispatch(&ctx, bad).await.is_none());

        let bad = Message::new(None, MessageType::ClientQuery, json!([])).unwrap();
        assert!(dispatch(&ctx, bad).await.is_none());
    }
}
