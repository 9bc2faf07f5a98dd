//! Tiered bandwidth prober: concurrent HTTP floods stepping down a ladder of
//! (payload size, thread count) tiers until the link sustains one.

pub mod budget;
pub mod generator;
pub mod ladder;
pub mod progress;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::analysis::{Perf, StatsError};
use crate::net::AddressError;

pub use budget::latency_budget;
pub use generator::LoadGenerator;
pub use ladder::TierSelector;

const MIB: u64 = 1024 * 1024;

/// Trials per thread in a tier; enough for a stable latency distribution.
pub const SAMPLES_PER_THREAD: usize = 10;

/// Fraction of a tier's trials allowed to be slow before it is overloaded.
pub const SLOW_SAMPLE_FRACTION: f64 = 0.05;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("network overloaded: {slow} of {samples} trials exceeded the latency budget")]
    Overload { slow: usize, samples: usize },

    #[error("tier deadline exceeded")]
    Timeout,

    #[error("probe cancelled")]
    Cancelled,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("failed to summarize samples: {0}")]
    Stats(#[from] StatsError),

    #[error("no tiers configured")]
    EmptyLadder,
}

impl ProbeError {
    /// Whether the tier selector should absorb this error and try the next,
    /// weaker tier instead of aborting.
    pub fn is_step_down(&self) -> bool {
        matches!(
            self,
            ProbeError::Overload { .. } | ProbeError::Timeout | ProbeError::Cancelled
        )
    }
}

/// One rung of the bandwidth ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Bytes sent per trial.
    pub payload_size: u64,
    /// Concurrent in-flight trials.
    pub threads: usize,
}

impl Tier {
    pub const fn new(payload_size: u64, threads: usize) -> Self {
        Self {
            payload_size,
            threads,
        }
    }

    /// Total trials dispatched for this tier.
    pub fn max_samples(&self) -> usize {
        SAMPLES_PER_THREAD * self.threads
    }

    /// Slow trials that declare the tier overloaded.
    pub fn slow_sample_limit(&self) -> usize {
        (SLOW_SAMPLE_FRACTION * self.max_samples() as f64).ceil() as usize
    }

    /// Bytes in flight when every thread is sending at once.
    pub fn nominal_throughput(&self) -> u64 {
        self.payload_size.saturating_mul(self.threads as u64)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.payload_size >= MIB {
            write!(f, "{}MiB x {}", self.payload_size / MIB, self.threads)
        } else {
            write!(f, "{}KiB x {}", self.payload_size / 1024, self.threads)
        }
    }
}

/// Ladder sized for 100, 40, 25, 10 and 1 Gbit links, strongest first.
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier::new(256 * MIB, 50),
        Tier::new(256 * MIB, 20),
        Tier::new(128 * MIB, 25),
        Tier::new(128 * MIB, 10),
        Tier::new(64 * MIB, 2),
    ]
}

/// Runs a single tier of trials against a remote probe receiver.
#[async_trait::async_trait]
pub trait TierRunner: Send + Sync {
    async fn run_tier(
        &self,
        cancel: &CancellationToken,
        remote: &str,
        tier: Tier,
    ) -> Result<Perf, ProbeError>;
}
