//! Client library and shell helpers
//!
//! A [`Client`] talks to one node at a time. Writes sent to a node that is
//! not the coordinator come back as `REDIRECT`; the client resolves the
//! leader through its directory and resends there.

use crate::common::{ClusterConfig, Error, NodeId, Result};
use crate::protocol::{Message, MessageType, QueryPayload, Reply};
use crate::transport::round_trip;
use serde_json::Value;
use std::collections::HashMap;
use tokio::net::TcpStream;

/// Redirects followed per query before the reply is handed back as is
pub const DEFAULT_MAX_REDIRECTS: usize = 3;

const MAX_REPLY_BYTES: usize = 16 * 1024 * 1024;

pub struct Client {
    endpoint: String,
    directory: HashMap<NodeId, String>,
    max_redirects: usize,
}

impl Client {
    pub fn connect_to(addr: impl Into<String>) -> Self {
        Self {
            endpoint: addr.into(),
            directory: HashMap::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }

    /// Node id → `host:port`, used to follow redirects
    pub fn with_directory(mut self, directory: HashMap<NodeId, String>) -> Self {
        self.directory.extend(directory);
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Client pointed at the descriptor's local node, knowing every member.
    pub fn from_cluster(config: &ClusterConfig) -> Self {
        Self::connect_to(config.local_node.bind_addr()).with_directory(directory_of(config))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn set_endpoint(&mut self, addr: impl Into<String>) {
        self.endpoint = addr.into();
    }

    pub fn directory(&self) -> &HashMap<NodeId, String> {
        &self.directory
    }

    pub async fn query(&mut self, text: &str) -> Result<Reply> {
        self.query_with_params(text, Vec::new()).await
    }

    /// Send a query, following up to `max_redirects` redirects.
    ///
    /// A redirect to a leader missing from the directory is returned to
    /// the caller unchanged.
    pub async fn query_with_params(&mut self, text: &str, params: Vec<Value>) -> Result<Reply> {
        let payload = QueryPayload {
            query: text.to_string(),
            params,
        };
        let message = Message::with_payload(None, MessageType::ClientQuery, &payload)?;

        let mut redirects = 0;
        loop {
            let leader = match self.send(&message).await? {
                Reply::Redirect { leader } => leader,
                reply => return Ok(reply),
            };
            if redirects == self.max_redirects {
                return Ok(Reply::Redirect { leader });
            }
            let Some(addr) = self.directory.get(&leader) else {
                tracing::debug!(leader, "redirect to unknown node");
                return Ok(Reply::Redirect { leader });
            };
            tracing::info!(leader, addr = %addr, "following redirect");
            self.endpoint = addr.clone();
            redirects += 1;
        }
    }

    async fn send(&self, message: &Message) -> Result<Reply> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        round_trip(stream, message, MAX_REPLY_BYTES).await
    }
}

/// Every member of the descriptor, local node included
pub fn directory_of(config: &ClusterConfig) -> HashMap<NodeId, String> {
    config
        .peers
        .iter()
        .map(|p| (p.id, p.addr()))
        .chain(std::iter::once((
            config.local_node.id,
            config.local_node.bind_addr(),
        )))
        .collect()
}

/// Parse `id=host:port`.
pub fn parse_node_arg(arg: &str) -> Result<(NodeId, String)> {
    let (id, addr) = arg
        .split_once('=')
        .ok_or_else(|| Error::InvalidConfig(format!("expected id=host:port, got {:?}", arg)))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad node id in {:?}", arg)))?;
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(Error::InvalidConfig(format!("missing address in {:?}", arg)));
    }
    Ok((id, addr.to_string()))
}

/// One line of shell input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `:node`, switch endpoint
    Node,
    /// `:info`, show the endpoint
    Info,
    /// `:exit`
    Exit,
    Query(String),
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Command::Empty,
            ":node" => Command::Node,
            ":info" => Command::Info,
            ":exit" | ":quit" => Command::Exit,
            query => Command::Query(query.to_string()),
        }
    }
}

/// Human-readable rendering of a reply
pub fn render(reply: &Reply) -> String {
    match reply {
        Reply::Ok { node, result } => {
            let mut out = format!("node {}:", node);
            match result {
                Value::Array(rows) if rows.is_empty() => out.push_str("\n(no rows)"),
                Value::Array(rows) => {
                    for row in rows {
                        out.push('\n');
                        out.push_str(&row.to_string());
                    }
                }
                Value::String(s) => {
                    out.push('\n');
                    out.push_str(s);
                }
                other => {
                    out.push('\n');
                    out.push_str(&other.to_string());
                }
            }
            out
        }
        Reply::Redirect { leader } => {
            format!("redirected to coordinator (node {}), address unknown", leader)
        }
        Reply::Error { message } => message.clone(),
        other => format!("unexpected reply: {:?}", other),
    }
}
