//! Newline-delimited JSON framing over an async byte stream.
//!
//! This is the process-IPC analogue of the teacher's flatbuffer framing: one
//! JSON value per line, UTF-8, no embedded newlines. Simple enough to debug
//! by eye with `cat` on a worker's stdout, which matters since there is no
//! flatbuffer schema compiler in this workspace to inspect the wire format.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("peer closed the stream")]
    Closed,
}

/// Read one message from `reader`. Returns `Ok(None)` equivalent via
/// `FramingError::Closed` when the stream ends before a full line arrives.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, FramingError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Err(FramingError::Closed);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(serde_json::from_str(trimmed)?)
}

/// Write one message to `writer` as a single JSON line, flushing afterwards
/// so the peer observes it promptly (worker stdout pipes are not
/// line-buffered by default once piped).
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_string(message)?;
    encoded.push('\n');
    writer.write_all(encoded.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HostMessage, WorkerMessage, LoadResult};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trips_a_message_through_a_pipe() {
        let msg = HostMessage::Load {
            plugin: crate::PluginDescriptor {
                id: "p".into(),
                module: "./m.js".into(),
                globals: Default::default(),
                concurrency: 1,
            },
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        assert!(buf.ends_with(b"\n"));

        let mut reader = BufReader::new(buf.as_slice());
        let decoded: HostMessage = read_message(&mut reader).await.unwrap();
        match decoded {
            HostMessage::Load { plugin } => assert_eq!(plugin.id, "p"),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn reading_past_eof_reports_closed() {
        let mut reader = BufReader::new(&b""[..]);
        let result: Result<WorkerMessage, FramingError> = read_message(&mut reader).await;
        assert!(matches!(result, Err(FramingError::Closed)));
    }

    #[tokio::test]
    async fn multiple_messages_are_separated_by_newlines() {
        let mut buf = Vec::new();
        write_message(&mut buf, &WorkerMessage::Loaded {
            result: LoadResult { ok: true, error: None, exports: vec!["handler".into()] },
        }).await.unwrap();
        write_message(&mut buf, &WorkerMessage::Loaded {
            result: LoadResult { ok: false, error: None, exports: vec![] },
        }).await.unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        let first: WorkerMessage = read_message(&mut reader).await.unwrap();
        let second: WorkerMessage = read_message(&mut reader).await.unwrap();
        match (first, second) {
            (WorkerMessage::Loaded { result: a }, WorkerMessage::Loaded { result: b }) => {
                assert!(a.ok);
                assert!(!b.ok);
            }
            _ => panic!("wrong variants"),
        }
    }
}
