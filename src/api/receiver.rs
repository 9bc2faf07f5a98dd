//! `POST /perf` -- flood sink.
//!
//! The handler commits a 200 and its headers before touching the body, drains
//! the body into a discard sink on a background task, and only then emits a
//! trailing `FinalStatus: <outcome>` record. Stream failures can therefore
//! never surface as an HTTP error status.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state::AppState;

/// Name of the deferred status field.
pub const FINAL_STATUS: &str = "FinalStatus";

/// Upper bound for the fallback copy buffer.
pub const COPY_BUF_SIZE: usize = 32 * 1024;

/// Outcome of draining one flood body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalStatus {
    Success,
    UnexpectedEof,
    ShortRead { expected: u64, found: u64 },
    Failed(String),
}

impl FinalStatus {
    /// Classify a finished copy against the declared body length.
    ///
    /// A stream that ends cleanly, or whose peer closed before the declared
    /// length arrived, is a short read. Resets and aborts mid-stream are an
    /// unexpected EOF.
    pub fn classify(result: Result<u64, CopyError>, expected: Option<u64>) -> Self {
        let (found, err) = match result {
            Ok(found) => (found, None),
            Err(e) => (e.written, Some(e.source)),
        };
        match (err, expected) {
            (None, Some(expected)) if expected != found => FinalStatus::ShortRead { expected, found },
            (None, _) => FinalStatus::Success,
            (Some(e), Some(expected))
                if e.kind() == io::ErrorKind::UnexpectedEof && found < expected =>
            {
                FinalStatus::ShortRead { expected, found }
            }
            (Some(e), _) => match e.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => FinalStatus::UnexpectedEof,
                _ => FinalStatus::Failed(e.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FinalStatus::Success)
    }

    /// The trailing record written after the body has been consumed.
    pub fn record(&self) -> String {
        format!("{}: {}\n", FINAL_STATUS, self)
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinalStatus::Success => write!(f, "Success"),
            FinalStatus::UnexpectedEof => write!(f, "unexpected EOF"),
            FinalStatus::ShortRead { expected, found } => {
                write!(f, "short read: expected {} found {}", expected, found)
            }
            FinalStatus::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

/// Extract the status text from a response body carrying a trailing record.
pub fn parse_final_status(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let prefix = format!("{}: ", FINAL_STATUS);
    text.lines()
        .rev()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .map(|status| status.trim_end().to_string())
}

/// A copy that stopped early, with the bytes already written.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct CopyError {
    pub written: u64,
    #[source]
    pub source: io::Error,
}

impl CopyError {
    fn new(written: u64, source: io::Error) -> Self {
        Self { written, source }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "copy cancelled")
}

/// Bulk copy for buffered sources: each chunk the source already holds is
/// written straight to `dst` with no intermediate buffer.
pub async fn copy_buf_with_cancel<R, W>(
    cancel: &CancellationToken,
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::new(written, cancelled()));
        }
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::new(written, cancelled())),
            chunk = src.fill_buf() => chunk.map_err(|e| CopyError::new(written, e))?,
        };
        if chunk.is_empty() {
            return Ok(written);
        }
        let n = chunk.len();
        dst.write_all(chunk)
            .await
            .map_err(|e| CopyError::new(written, e))?;
        src.consume(n);
        written += n as u64;
    }
}

/// Copy through a fixed buffer of `min(32 KiB, remaining)` bytes, for
/// sources without their own buffer.
///
/// HTTP bodies are always buffered and take [`copy_buf_with_cancel`].
pub async fn copy_with_cancel<R, W>(
    cancel: &CancellationToken,
    src: &mut R,
    dst: &mut W,
    remaining: Option<u64>,
) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let size = match remaining {
        Some(n) if n < COPY_BUF_SIZE as u64 => n.max(1) as usize,
        _ => COPY_BUF_SIZE,
    };
    let mut buf = vec![0u8; size];
    let mut written = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(CopyError::new(written, cancelled()));
        }
        let nr = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::new(written, cancelled())),
            nr = src.read(&mut buf) => nr.map_err(|e| CopyError::new(written, e))?,
        };
        if nr == 0 {
            return Ok(written);
        }
        dst.write_all(&buf[..nr])
            .await
            .map_err(|e| CopyError::new(written, e))?;
        written += nr as u64;
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Map a body read error onto the transport event behind it.
///
/// hyper reports a peer that closed before the declared length as an
/// `UnexpectedEof` I/O error somewhere in the source chain. Anything else
/// (reset, abort, protocol error) is treated as the stream being cut.
fn body_error(err: axum::Error) -> io::Error {
    let closed_early = std::iter::successors(Some(&err as &(dyn StdError + 'static)), |&e| e.source())
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::UnexpectedEof);
    let kind = if closed_early {
        io::ErrorKind::UnexpectedEof
    } else {
        io::ErrorKind::ConnectionAborted
    };
    io::Error::new(kind, err)
}

/// Drain an HTTP body into a discard sink and classify the outcome.
pub async fn drain_body(cancel: &CancellationToken, body: Body, expected: Option<u64>) -> FinalStatus {
    let stream = body.into_data_stream().map_err(body_error);
    let mut reader = StreamReader::new(stream);
    let result = copy_buf_with_cancel(cancel, &mut reader, &mut tokio::io::sink()).await;
    FinalStatus::classify(result, expected)
}

pub async fn receive(State(state): State<AppState>, request: Request) -> Response {
    let expected = content_length(request.headers());
    let body = request.into_body();
    let cancel = state.shutdown.clone();

    let (status_tx, status_rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = drain_body(&cancel, body, expected).await;
        if status.is_success() {
            debug!(bytes = ?expected, "flood body consumed");
        } else {
            warn!(bytes = ?expected, status = %status, "flood body ended early");
        }
        let _ = status_tx.send(status);
    });

    let trailer = futures::stream::once(async move {
        let status = status_rx
            .await
            .unwrap_or_else(|_| FinalStatus::Failed("receiver task dropped".to_string()));
        Ok::<_, Infallible>(Bytes::from(status.record()))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::TRAILER, FINAL_STATUS),
        ],
        Body::from_stream(trailer),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_copy_buf_counts_all_bytes() {
        let cancel = CancellationToken::new();
        let mut src = BufReader::new(Cursor::new(vec![1u8; 100_000]));
        let mut dst = Vec::new();
        let n = copy_buf_with_cancel(&cancel, &mut src, &mut dst).await.unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(dst.len(), 100_000);
    }

    #[tokio::test]
    async fn test_copy_with_small_hint() {
        let cancel = CancellationToken::new();
        let mut src = Cursor::new(b"hello flood".to_vec());
        let mut dst = Vec::new();
        let n = copy_with_cancel(&cancel, &mut src, &mut dst, Some(11)).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(dst, b"hello flood");
    }

    #[tokio::test]
    async fn test_copy_with_zero_hint_still_progresses() {
        let cancel = CancellationToken::new();
        let mut src = Cursor::new(vec![9u8; 70_000]);
        let n = copy_with_cancel(&cancel, &mut src, &mut tokio::io::sink(), Some(0))
            .await
            .unwrap();
        assert_eq!(n, 70_000);
    }

    #[tokio::test]
    async fn test_copy_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut src = Cursor::new(vec![0u8; 1024]);
        let err = copy_with_cancel(&cancel, &mut src, &mut tokio::io::sink(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);

        let mut src = BufReader::new(Cursor::new(vec![0u8; 1024]));
        let err = copy_buf_with_cancel(&cancel, &mut src, &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_copy_cancelled_while_waiting_for_data() {
        let cancel = CancellationToken::new();
        // The write half stays open, so the read would block forever.
        let (_tx, mut rx) = tokio::io::duplex(64);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = copy_with_cancel(&cancel, &mut rx, &mut tokio::io::sink(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    fn failed_after(written: u64, kind: io::ErrorKind) -> Result<u64, CopyError> {
        Err(CopyError::new(written, io::Error::new(kind, "body read failed")))
    }

    #[test]
    fn test_classify() {
        assert_eq!(FinalStatus::classify(Ok(10), Some(10)), FinalStatus::Success);
        assert_eq!(FinalStatus::classify(Ok(10), None), FinalStatus::Success);
        assert_eq!(
            FinalStatus::classify(Ok(7), Some(10)),
            FinalStatus::ShortRead {
                expected: 10,
                found: 7
            }
        );
        // Peer closed before the declared length arrived.
        assert_eq!(
            FinalStatus::classify(failed_after(7, io::ErrorKind::UnexpectedEof), Some(10)),
            FinalStatus::ShortRead {
                expected: 10,
                found: 7
            }
        );
        assert_eq!(
            FinalStatus::classify(failed_after(7, io::ErrorKind::UnexpectedEof), None),
            FinalStatus::UnexpectedEof
        );
        assert_eq!(
            FinalStatus::classify(failed_after(7, io::ErrorKind::ConnectionReset), Some(10)),
            FinalStatus::UnexpectedEof
        );
        assert_eq!(
            FinalStatus::classify(failed_after(7, io::ErrorKind::ConnectionAborted), Some(10)),
            FinalStatus::UnexpectedEof
        );
        assert_eq!(
            FinalStatus::classify(Err(CopyError::new(3, cancelled())), Some(10)),
            FinalStatus::Failed("copy cancelled".to_string())
        );
    }

    #[tokio::test]
    async fn test_copy_error_carries_bytes_written() {
        let cancel = CancellationToken::new();
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(vec![0u8; 1500])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")),
        ];
        let mut src = StreamReader::new(futures::stream::iter(chunks));

        let err = copy_buf_with_cancel(&cancel, &mut src, &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert_eq!(err.written, 1500);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_record_roundtrip() {
        let status = FinalStatus::ShortRead {
            expected: 1024,
            found: 1000,
        };
        assert_eq!(status.record(), "FinalStatus: short read: expected 1024 found 1000\n");
        assert_eq!(
            parse_final_status(status.record().as_bytes()).as_deref(),
            Some("short read: expected 1024 found 1000")
        );
        assert_eq!(
            parse_final_status(FinalStatus::Success.record().as_bytes()).as_deref(),
            Some("Success")
        );
        assert_eq!(parse_final_status(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_drain_body_outcomes() {
        let cancel = CancellationToken::new();

        let full = Body::from(vec![0u8; 4096]);
        assert_eq!(drain_body(&cancel, full, Some(4096)).await, FinalStatus::Success);

        let truncated = Body::from(vec![0u8; 4000]);
        assert_eq!(
            drain_body(&cancel, truncated, Some(4096)).await,
            FinalStatus::ShortRead {
                expected: 4096,
                found: 4000
            }
        );

        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(vec![0u8; 1024])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")),
        ];
        let reset = Body::from_stream(futures::stream::iter(chunks));
        assert_eq!(
            drain_body(&cancel, reset, Some(4096)).await,
            FinalStatus::UnexpectedEof
        );

        // hyper surfaces a clean close before Content-Length as an
        // UnexpectedEof I/O error under the body error.
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(vec![0u8; 1024])),
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of file before message length reached",
            )),
        ];
        let closed = Body::from_stream(futures::stream::iter(chunks));
        assert_eq!(
            drain_body(&cancel, closed, Some(4096)).await,
            FinalStatus::ShortRead {
                expected: 4096,
                found: 1024
            }
        );
    }
}
