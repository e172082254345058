//! Framing: one JSON document per line
//!
//! Line-oriented framing keeps the protocol usable from netcat-style tools.
//! Senders that do not frame at all are served too: a document cut short by
//! end-of-stream is accepted, and so is a complete JSON value that arrives
//! without a newline while the connection stays open.

use crate::common::{Error, Result};
use serde::de::IgnoredAny;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Read the next non-blank document, at most `limit` bytes long.
///
/// A document ends at a newline, at end-of-stream, or as soon as the bytes
/// received so far form one complete JSON value. Returns `Ok(None)` when the
/// stream ends before any document.
pub async fn read_document<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            let line = trim_line(&buf);
            return Ok((!line.is_empty()).then(|| line.to_vec()));
        }

        let (chunk, consumed, newline) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (&available[..pos], pos + 1, true),
            None => (available, available.len(), false),
        };
        buf.extend_from_slice(chunk);
        reader.consume(consumed);

        let line = trim_line(&buf);
        if line.len() > limit {
            return Err(Error::Protocol(format!(
                "message exceeds {} bytes",
                limit
            )));
        }
        if newline {
            if line.is_empty() {
                buf.clear();
                continue;
            }
            return Ok(Some(line.to_vec()));
        }
        if is_complete(line) {
            return Ok(Some(line.to_vec()));
        }
    }
}

/// Do `bytes` hold a whole JSON value, or something no further input can fix?
fn is_complete(bytes: &[u8]) -> bool {
    let mut values = serde_json::Deserializer::from_slice(bytes).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => true,
        Some(Err(e)) => !e.is_eof(),
        None => false,
    }
}

/// Write one document followed by the line delimiter, then flush.
pub async fn write_document<W>(writer: &mut W, document: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(document.len() + 1);
    encoded.extend_from_slice(document);
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && LINE_ENDINGS.contains(&(buf[end - 1] as char)) {
        end -= 1;
    }
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_roundtrip_document() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        write_document(&mut writer, br#"{"status":"ACK"}"#)
            .await
            .expect("write document");
        let parsed = read_document(&mut reader, 1024)
            .await
            .expect("read document")
            .expect("expected document");

        assert_eq!(parsed, br#"{"status":"ACK"}"#);
    }

    #[tokio::test]
    async fn test_skips_blank_lines_and_accepts_eof_terminated() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\r\n\n")
            .read(br#"{"type":"HEARTBEAT"}"#)
            .build();
        let mut reader = BufReader::new(stream);

        let parsed = read_document(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(parsed, br#"{"type":"HEARTBEAT"}"#);
        assert!(read_document(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_yields_none() {
        let stream = tokio_test::io::Builder::new().build();
        let mut reader = BufReader::new(stream);
        assert!(read_document(&mut reader, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_oversized_document() {
        let stream = tokio_test::io::Builder::new()
            .read(b"0123456789abcdef-overflow\n")
            .build();
        let mut reader = BufReader::new(stream);

        let err = read_document(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_exact_fit_is_accepted() {
        let stream = tokio_test::io::Builder::new().read(b"0123456789\n").build();
        let mut reader = BufReader::new(stream);

        let parsed = read_document(&mut reader, 10).await.unwrap().unwrap();
        assert_eq!(parsed, b"0123456789");
    }

    #[tokio::test]
    async fn test_unterminated_document_on_open_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(br#"{"type":"HEARTBEAT","payload":{}}"#).await.unwrap();
        let parsed = read_document(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(parsed, br#"{"type":"HEARTBEAT","payload":{}}"#);
        drop(writer);
    }

    #[tokio::test]
    async fn test_document_split_across_reads() {
        let stream = tokio_test::io::Builder::new()
            .read(br#"{"type":"HEAR"#)
            .read(br#"TBEAT","payload":{"#)
            .read(b"}}")
            .build();
        let mut reader = BufReader::new(stream);

        let parsed = read_document(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(parsed, br#"{"type":"HEARTBEAT","payload":{}}"#);
    }

    #[tokio::test]
    async fn test_malformed_unterminated_input_is_returned_for_rejection() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"{not json").await.unwrap();
        let parsed = read_document(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(parsed, b"{not json");
        drop(writer);
    }
}
