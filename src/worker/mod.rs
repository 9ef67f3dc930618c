//! Worker process: a blocking read-dispatch-write loop over stdin/stdout.
//!
//! The worker owns the automation backend. It reads one JSON request per line,
//! dispatches it, and writes exactly one JSON response line back, in order.
//! Nothing a handler does can make it skip a response; the only way out of
//! the loop is end of input or a broken pipe.

pub mod dispatch;
pub mod handlers;

use std::io::{self, BufRead, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::{AutomationBackend, MemoryBackend};
use crate::transport::protocol::OperationResponse;
use crate::transport::MAX_LINE_SIZE;

pub use dispatch::{Dispatcher, OperationError, OperationRegistry};

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Input closed; `served` responses were written.
    Shutdown { served: u64 },
}

enum Line {
    Eof,
    Request,
    Oversized,
}

/// Serve requests from `reader` until end of input.
///
/// Read and write failures are returned; everything else is answered.
pub fn run<R: BufRead, W: Write>(
    reader: R,
    writer: W,
    dispatcher: &Dispatcher,
) -> io::Result<WorkerExit> {
    run_with_limit(reader, writer, dispatcher, MAX_LINE_SIZE)
}

fn run_with_limit<R: BufRead, W: Write>(
    mut reader: R,
    mut writer: W,
    dispatcher: &Dispatcher,
    limit: usize,
) -> io::Result<WorkerExit> {
    let mut served = 0u64;
    let mut buf = Vec::new();

    loop {
        let response = match read_line(&mut reader, &mut buf, limit)? {
            Line::Eof => {
                debug!(served, "Input closed, shutting down");
                return Ok(WorkerExit::Shutdown { served });
            }
            Line::Oversized => {
                warn!(limit, "Discarded oversized request line");
                OperationResponse::failure_with(
                    format!("Invalid request: line exceeds {limit} bytes"),
                    "protocol",
                    None,
                )
            }
            Line::Request if buf.iter().all(u8::is_ascii_whitespace) => continue,
            Line::Request => dispatcher.handle_line(&buf),
        };

        write_response(&mut writer, &response)?;
        served += 1;
    }
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<Line> {
    buf.clear();
    let cap = u64::try_from(limit.saturating_add(1)).unwrap_or(u64::MAX);
    let n = reader.by_ref().take(cap).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(Line::Request);
    }
    if buf.len() > limit {
        discard_through_newline(reader)?;
        buf.clear();
        return Ok(Line::Oversized);
    }
    // Final line without a trailing newline.
    Ok(Line::Request)
}

fn discard_through_newline<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(i) = available.iter().position(|b| *b == b'\n') {
            reader.consume(i + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

fn write_response<W: Write>(writer: &mut W, response: &OperationResponse) -> io::Result<()> {
    let mut line = serde_json::to_vec(response).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Build the backend for this host.
///
/// Uses the desktop fixture when one is given, otherwise an empty desktop.
pub fn backend(fixture: Option<&Path>) -> Result<Arc<dyn AutomationBackend>> {
    let backend = match fixture {
        Some(path) => MemoryBackend::from_fixture_file(path)?,
        None => MemoryBackend::new(),
    };
    Ok(Arc::new(backend))
}

/// Entry point for `--worker`: serve stdin/stdout until the host goes away.
pub fn serve_stdio(fixture: Option<&Path>) -> Result<WorkerExit> {
    let dispatcher =
        Dispatcher::standard(backend(fixture)?).context("Failed to build operation registry")?;
    info!(
        pid = std::process::id(),
        operations = dispatcher.registry().len(),
        "Worker ready"
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let exit = run(stdin.lock(), stdout.lock(), &dispatcher).context("Worker I/O failed")?;
    info!(?exit, "Worker exiting");
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::handlers::testing::dispatcher;
    use serde_json::Value;
    use std::io::Cursor;

    fn serve(input: &[u8]) -> (WorkerExit, Vec<Value>) {
        serve_limited(input, MAX_LINE_SIZE)
    }

    fn serve_limited(input: &[u8], limit: usize) -> (WorkerExit, Vec<Value>) {
        let mut out = Vec::new();
        let exit =
            run_with_limit(Cursor::new(input.to_vec()), &mut out, &dispatcher(), limit).unwrap();
        let responses = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (exit, responses)
    }

    #[test]
    fn one_response_per_request_in_order() {
        let input = b"{\"operation\":\"Ping\"}\n\
            {\"operation\":\"Invoke\",\"parameters\":{\"elementId\":\"OkButton\"}}\n\
            {\"operation\":\"Bogus\"}\n";
        let (exit, responses) = serve(input);
        assert_eq!(exit, WorkerExit::Shutdown { served: 3 });
        assert_eq!(responses[0]["data"], "pong");
        assert_eq!(responses[1]["data"], "Element invoked successfully");
        assert_eq!(responses[2]["success"], false);
    }

    #[test]
    fn malformed_lines_are_answered() {
        let input = b"not json\n{\"parameters\":{}}\n\xff\xfe\n{\"operation\":\"Ping\"}\n";
        let (exit, responses) = serve(input);
        assert_eq!(exit, WorkerExit::Shutdown { served: 4 });
        for resp in &responses[..3] {
            assert_eq!(resp["success"], false);
            assert_eq!(resp["diagnostics"]["errorType"], "protocol");
        }
        assert_eq!(responses[3]["data"], "pong");
    }

    #[test]
    fn blank_lines_and_crlf() {
        let input = b"\n   \n{\"operation\":\"Ping\"}\r\n\n";
        let (exit, responses) = serve(input);
        assert_eq!(exit, WorkerExit::Shutdown { served: 1 });
        assert_eq!(responses[0]["data"], "pong");
    }

    #[test]
    fn last_line_without_newline() {
        let (_, responses) = serve(b"{\"operation\":\"Ping\"}");
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn oversized_line_is_rejected_and_skipped() {
        let mut input =
            format!("{{\"operation\":\"Ping\",\"pad\":\"{}\"}}\n", "x".repeat(200)).into_bytes();
        input.extend_from_slice(b"{\"operation\":\"Ping\"}\n");
        let (exit, responses) = serve_limited(&input, 64);
        assert_eq!(exit, WorkerExit::Shutdown { served: 2 });
        assert_eq!(responses[0]["success"], false);
        assert!(responses[0]["error"].as_str().unwrap().contains("exceeds 64 bytes"));
        assert_eq!(responses[1]["data"], "pong");
    }

    #[test]
    fn empty_input_shuts_down() {
        let (exit, responses) = serve(b"");
        assert_eq!(exit, WorkerExit::Shutdown { served: 0 });
        assert!(responses.is_empty());
    }

    #[test]
    fn write_failure_is_fatal() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let input = Cursor::new(b"{\"operation\":\"Ping\"}\n".to_vec());
        let err = run(input, Broken, &dispatcher()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
