//! Transport layer for host ↔ worker communication.
//!
//! Provides the `Transport` trait and newline-delimited JSON framing.
//! `StdioPipeTransport` talks to a worker process over its stdin/stdout;
//! other transports (with real cooperative cancellation) can plug in
//! behind the same trait.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{OperationRequest, OperationResponse, ResponseDiagnostics};
pub use stdio_pipe::{ProcessLauncher, StdioPipeTransport, WorkerCommand};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum line size (16 MB). Safety valve against runaway output.
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Failures talking to a worker.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The worker process could not be started.
    #[error("failed to spawn worker: {message}")]
    Spawn {
        message: String,
        #[source]
        source: Option<Arc<std::io::Error>>,
    },

    /// The worker closed its output or exited before answering.
    #[error("worker process exited unexpectedly{}", exit_suffix(.status))]
    Closed { status: Option<i32> },

    /// The worker wrote something that is not a response envelope.
    #[error("malformed worker output: {message}")]
    Malformed { message: String },

    /// Any other pipe failure.
    #[error("I/O error talking to worker: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

fn exit_suffix(status: &Option<i32>) -> String {
    status.map(|s| format!(" (status {s})")).unwrap_or_default()
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset => Self::Closed { status: None },
            _ => Self::Io(Arc::new(err)),
        }
    }
}

/// Abstraction over host ↔ worker channels.
///
/// One request in flight at a time: the channel has no request ids, so the
/// supervisor owns each transport exclusively while a call is running.
#[async_trait]
pub trait Transport: Send {
    /// Send a request and wait for its response. Not time-bounded; the
    /// supervisor wraps this in its deadline.
    async fn request(
        &mut self,
        req: &OperationRequest,
    ) -> Result<OperationResponse, TransportError>;

    /// Stop the worker immediately. For process transports this kills the
    /// whole process tree, which is the only way to unblock a hung backend.
    async fn cancel(&mut self);

    /// Ask the worker to exit cleanly, falling back to `cancel`.
    async fn shutdown(&mut self);

    /// Whether the worker is still running.
    fn is_alive(&mut self) -> bool;

    /// OS process id, if this transport is backed by a process.
    fn pid(&self) -> Option<u32>;
}

/// Creates fresh workers for the supervisor.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Write one JSON document as a single line.
pub async fn send_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    if payload.len() > MAX_LINE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("message exceeds max size: {} > {MAX_LINE_SIZE}", payload.len()),
        ));
    }
    if payload.contains(&b'\n') {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "message contains a raw newline",
        ));
    }

    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line, without its terminator.
///
/// Returns `None` on a clean end-of-stream. A final line without a trailing
/// newline is still returned. Lines over `MAX_LINE_SIZE` are an error.
pub async fn recv_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let limit = u64::try_from(MAX_LINE_SIZE + 1).unwrap_or(u64::MAX);
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line exceeds max size of {MAX_LINE_SIZE} bytes"),
        ));
    }
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn roundtrip_framing() {
        let mut buf = Vec::new();
        send_line(&mut buf, br#"{"operation":"Ping"}"#).await.unwrap();
        send_line(&mut buf, br#"{"operation":"ListOperations"}"#).await.unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = BufReader::new(std::io::Cursor::new(buf));
        let first = recv_line(&mut reader).await.unwrap().unwrap();
        let second = recv_line(&mut reader).await.unwrap().unwrap();
        assert_eq!(first, br#"{"operation":"Ping"}"#);
        assert_eq!(second, br#"{"operation":"ListOperations"}"#);
        assert!(recv_line(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_embedded_newline() {
        let mut buf = Vec::new();
        let err = send_line(&mut buf, b"{\n}").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn accepts_crlf_and_unterminated_tail() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"a\r\nb".to_vec()));
        assert_eq!(recv_line(&mut reader).await.unwrap().unwrap(), b"a");
        assert_eq!(recv_line(&mut reader).await.unwrap().unwrap(), b"b");
        assert!(recv_line(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn broken_pipe_maps_to_closed() {
        let err = TransportError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(matches!(err, TransportError::Closed { status: None }));
        assert_eq!(err.to_string(), "worker process exited unexpectedly");

        let err = TransportError::Closed { status: Some(3) };
        assert_eq!(err.to_string(), "worker process exited unexpectedly (status 3)");
    }

    #[test]
    fn protocol_serialize_request() {
        let req = OperationRequest::new("Invoke").with_parameter("elementId", "OkButton");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"operation\":\"Invoke\""));
        assert!(json.contains("\"elementId\":\"OkButton\""));
    }

    #[test]
    fn protocol_deserialize_unknown_failure() {
        let json =
            r#"{"success":false,"error":"Unknown operation: Bogus. Supported operations: Ping"}"#;
        let resp: OperationResponse = serde_json::from_str(json).unwrap();
        assert!(!resp.success);
        assert!(resp.data.is_null());
        assert!(resp.error.unwrap().starts_with("Unknown operation: Bogus"));
    }
}
