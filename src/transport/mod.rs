//! Peer messaging layer
//!
//! [`round_trip`] performs one exchange on a fresh connection. [`PeerClient`]
//! wraps it with the cluster's timeouts, signs outgoing messages with the
//! local node id, and folds every failure into a `Result` so callers can
//! treat it as a missing vote or a dead peer.

pub mod peer_client;
pub mod peers;

pub use peer_client::PeerClient;
pub use peers::{PeerHealth, PeerTable};

use crate::common::{Error, Result};
use crate::protocol::{read_document, write_document, Message, Reply};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Send `message` on `stream` and read exactly one reply.
///
/// The stream is consumed and dropped on every path.
pub async fn round_trip(stream: TcpStream, message: &Message, limit: usize) -> Result<Reply> {
    let (reader, mut writer) = stream.into_split();
    write_document(&mut writer, &message.encode()?).await?;

    let mut reader = BufReader::new(reader);
    let reply = match read_document(&mut reader, limit).await? {
        Some(bytes) => Reply::decode(&bytes),
        None => Err(Error::Protocol("connection closed without a reply".into())),
    };

    let _ = writer.shutdown().await;
    reply
}
