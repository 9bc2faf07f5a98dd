//! Transfer progress accounting shared by concurrent trials.
//!
//! Every trial body is wrapped in a [`ProgressReader`], which reports each
//! chunk handed to the HTTP stack over a channel. A single accumulator task
//! owned by [`TransferCounter`] folds those reports into a running total that
//! trials sample before and after their request.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Sending half of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<u64>,
}

impl ProgressSender {
    fn report(&self, bytes: u64) {
        // The counter may already be finished; late reports are dropped.
        let _ = self.tx.send(bytes);
    }
}

/// Read-only view of the running byte total.
#[derive(Debug, Clone, Default)]
pub struct TransferTotal(Arc<AtomicU64>);

impl TransferTotal {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::SeqCst);
    }
}

/// Owns the accumulator task that drains progress reports.
pub struct TransferCounter {
    total: TransferTotal,
    tx: mpsc::UnboundedSender<u64>,
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl TransferCounter {
    /// Start the accumulator task.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let total = TransferTotal::default();
        let done = CancellationToken::new();

        let task_total = total.clone();
        let task_done = done.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    report = rx.recv() => match report {
                        Some(bytes) => task_total.add(bytes),
                        None => break,
                    },
                    _ = task_done.cancelled() => break,
                }
            }
            // Refuse new reports, then fold in whatever is already queued.
            rx.close();
            while let Some(bytes) = rx.recv().await {
                task_total.add(bytes);
            }
        });

        Self {
            total,
            tx,
            done,
            task,
        }
    }

    pub fn sender(&self) -> ProgressSender {
        ProgressSender {
            tx: self.tx.clone(),
        }
    }

    pub fn total(&self) -> TransferTotal {
        self.total.clone()
    }

    /// Stop accepting reports and return the final total once every queued
    /// report has been counted.
    ///
    /// Does not wait for outstanding senders to be dropped.
    pub async fn finish(self) -> u64 {
        self.done.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "transfer accumulator task failed");
        }
        self.total.get()
    }
}

/// Wraps a byte source and reports every successful read to a
/// [`ProgressSender`].
pub struct ProgressReader<R> {
    inner: R,
    progress: ProgressSender,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: ProgressSender) -> Self {
        Self { inner, progress }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let read = buf.filled().len() - before;
            if read > 0 {
                self.progress.report(read as u64);
            }
        }
        poll
    }
}
