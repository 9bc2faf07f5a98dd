//! Load generator: one tier of concurrent `POST /perf` trials.
//!
//! Trials run as tasks in a [`JoinSet`], admitted through a semaphore with one
//! permit per tier thread. Every trial streams the same random payload through
//! its own [`ProgressReader`], so the shared byte total reflects everything
//! handed to the HTTP stack across the tier. A trial that blows its latency
//! budget or its deadline counts as slow; once enough are slow the tier's inner
//! token is cancelled and the tier reports overload.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use rand::RngCore;
use reqwest::header::CONTENT_LENGTH;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::budget::latency_budget;
use super::progress::{ProgressReader, ProgressSender, TransferCounter, TransferTotal};
use super::{ProbeError, Tier, TierRunner};
use crate::analysis::{compute_perf, Perf};
use crate::api::receiver::{parse_final_status, FinalStatus};
use crate::config::ProbeConfig;
use crate::net;

/// Chunk size for streaming a payload into the request body.
const STREAM_CHUNK: usize = 64 * 1024;

/// Measurement from one completed trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub latency_secs: f64,
    pub throughput_bps: f64,
}

/// Slow-trial counter for one tier.
#[derive(Debug)]
struct SlowSamples {
    count: AtomicUsize,
    limit: usize,
}

impl SlowSamples {
    fn new(tier: Tier) -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit: tier.slow_sample_limit(),
        }
    }

    /// Count one slow trial. Returns `true` for exactly the call that reaches
    /// the limit.
    fn record(&self) -> bool {
        self.count.fetch_add(1, Ordering::SeqCst) + 1 == self.limit
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// State shared by every trial of one tier.
struct TierRun {
    client: reqwest::Client,
    url: String,
    payload: Bytes,
    progress: ProgressSender,
    total: TransferTotal,
    inner: CancellationToken,
    errors: mpsc::UnboundedSender<ProbeError>,
    slow: SlowSamples,
    samples: usize,
    budget: f64,
    trial_timeout: Duration,
}

impl TierRun {
    /// Report a tier-ending error and stop every in-flight trial.
    fn fail(&self, err: ProbeError) {
        let _ = self.errors.send(err);
        self.inner.cancel();
    }

    fn slow_trial(&self) {
        if self.slow.record() {
            self.fail(ProbeError::Overload {
                slow: self.slow.limit,
                samples: self.samples,
            });
        }
    }

    async fn trial(&self) -> Option<Sample> {
        let reader = ProgressReader::new(Cursor::new(self.payload.clone()), self.progress.clone());
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(reader, STREAM_CHUNK));

        let exchange = async {
            let resp = self
                .client
                .post(&self.url)
                .header(CONTENT_LENGTH, self.payload.len())
                .body(body)
                .send()
                .await?;
            let status = resp.status();
            let record = resp.bytes().await?;
            Ok::<_, reqwest::Error>((status, record))
        };

        let before = self.total.get();
        let start = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.inner.cancelled() => return None,
            outcome = tokio::time::timeout(self.trial_timeout, exchange) => outcome,
        };
        let latency = start.elapsed().as_secs_f64();

        let (status, record) = match outcome {
            Err(_) => {
                debug!(url = %self.url, "trial deadline exceeded");
                self.slow_trial();
                return None;
            }
            Ok(Err(e)) if e.is_timeout() => {
                debug!(url = %self.url, error = %e, "trial timed out");
                self.slow_trial();
                return None;
            }
            Ok(Err(e)) => {
                self.fail(ProbeError::Transport(e.to_string()));
                return None;
            }
            Ok(Ok(pair)) => pair,
        };

        if !status.is_success() {
            self.fail(ProbeError::Transport(format!(
                "{} answered {}",
                self.url, status
            )));
            return None;
        }

        let final_status = parse_final_status(&record);
        if final_status.as_deref() != Some(FinalStatus::Success.to_string().as_str()) {
            debug!(url = %self.url, status = ?final_status, "receiver reported incomplete body");
        }

        if latency > self.budget {
            self.slow_trial();
        }

        let sent = self.total.get().saturating_sub(before);
        Some(Sample {
            latency_secs: latency,
            throughput_bps: sent as f64 / latency.max(1e-9),
        })
    }
}

/// Fill a payload buffer with random bytes so nothing on the path can
/// compress it.
fn random_payload(size: u64) -> Result<Bytes, ProbeError> {
    let len = usize::try_from(size)
        .map_err(|_| ProbeError::Transport(format!("payload of {} bytes is too large", size)))?;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Ok(Bytes::from(buf))
}

/// HTTP flood client for the `/perf` endpoint of remote probe receivers.
#[derive(Clone)]
pub struct LoadGenerator {
    client: reqwest::Client,
    peer_port: u16,
    trial_timeout: Duration,
    tier_timeout: Option<Duration>,
}

impl LoadGenerator {
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            client: net::build_client(config.network.connect_timeout())?,
            peer_port: config.network.peer_port,
            trial_timeout: config.flood.trial_timeout(),
            tier_timeout: config.flood.tier_timeout(),
        })
    }

    async fn flood_tier(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        tier: Tier,
    ) -> Result<Perf, ProbeError> {
        let url = net::peer_url(remote, self.peer_port, "perf")?;
        let payload = random_payload(tier.payload_size)?;
        let counter = TransferCounter::spawn();
        let (errors, mut failures) = mpsc::unbounded_channel();

        let run = Arc::new(TierRun {
            client: self.client.clone(),
            url,
            payload,
            progress: counter.sender(),
            total: counter.total(),
            inner: cancel.child_token(),
            errors,
            slow: SlowSamples::new(tier),
            samples: tier.max_samples(),
            budget: latency_budget(tier.payload_size, tier.threads),
            trial_timeout: self.trial_timeout,
        });

        debug!(
            url = %run.url,
            %tier,
            samples = run.samples,
            budget_secs = run.budget,
            "starting tier"
        );

        let permits = Arc::new(Semaphore::new(tier.threads));
        let mut trials = JoinSet::new();
        let mut failure = None;

        for _ in 0..run.samples {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                err = failures.recv() => {
                    failure = err;
                    break;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if run.inner.is_cancelled() {
                // Release without dispatching.
                drop(permit);
                continue;
            }
            let run = run.clone();
            trials.spawn(async move {
                let sample = run.trial().await;
                drop(permit);
                sample
            });
        }

        let mut samples = Vec::with_capacity(run.samples);
        while let Some(joined) = trials.join_next().await {
            match joined {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "trial task failed"),
            }
        }
        let sent = counter.finish().await;

        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        if let Some(err) = failure.or_else(|| failures.try_recv().ok()) {
            debug!(url = %run.url, %tier, slow = run.slow.count(), error = %err, "tier failed");
            return Err(err);
        }

        let (latencies, throughputs): (Vec<f64>, Vec<f64>) = samples
            .iter()
            .map(|s| (s.latency_secs, s.throughput_bps))
            .unzip();
        let perf = compute_perf(&latencies, &throughputs)?;

        info!(
            url = %run.url,
            %tier,
            samples = perf.samples,
            bytes = sent,
            slow = run.slow.count(),
            "tier complete"
        );
        Ok(perf)
    }
}

#[async_trait::async_trait]
impl TierRunner for LoadGenerator {
    async fn run_tier(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        tier: Tier,
    ) -> Result<Perf, ProbeError> {
        match self.tier_timeout {
            Some(limit) => tokio::time::timeout(limit, self.flood_tier(cancel, remote, tier))
                .await
                .unwrap_or(Err(ProbeError::Timeout)),
            None => self.flood_tier(cancel, remote, tier).await,
        }
    }
}
