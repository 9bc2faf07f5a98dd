use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("no samples to summarize")]
    Empty,

    #[error("sample length mismatch: {latencies} latencies vs {throughputs} throughputs")]
    LengthMismatch {
        latencies: usize,
        throughputs: usize,
    },

    #[error("non-finite sample value {value}")]
    NonFinite { value: f64 },
}

/// Distribution summary for one sample sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

/// Performance summary of one tier's completed trials.
///
/// Latency is in seconds, throughput in bytes per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perf {
    pub samples: usize,
    pub latency: Summary,
    pub throughput: Summary,
}

/// Reduce per-trial latency and throughput samples into a [`Perf`].
///
/// Both slices must be the same non-zero length. Arrival order is irrelevant:
/// every statistic is computed over a sorted copy.
pub fn compute_perf(latencies: &[f64], throughputs: &[f64]) -> Result<Perf, StatsError> {
    if latencies.len() != throughputs.len() {
        return Err(StatsError::LengthMismatch {
            latencies: latencies.len(),
            throughputs: throughputs.len(),
        });
    }
    if latencies.is_empty() {
        return Err(StatsError::Empty);
    }

    Ok(Perf {
        samples: latencies.len(),
        latency: summarize(latencies)?,
        throughput: summarize(throughputs)?,
    })
}

fn summarize(values: &[f64]) -> Result<Summary, StatsError> {
    if let Some(&value) = values.iter().find(|v| !v.is_finite()) {
        return Err(StatsError::NonFinite { value });
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let mean = sum / count as f64;

    let variance_sum: f64 = sorted
        .iter()
        .map(|v| {
            let diff = mean - *v;
            diff * diff
        })
        .sum();

    let variance = if count > 1 {
        variance_sum / (count - 1) as f64 // Sample variance
    } else {
        0.0
    };

    Ok(Summary {
        avg: mean,
        min: sorted[0],
        max: sorted[count - 1],
        std_dev: variance.sqrt(),
        p50: percentile(&sorted, 0.50),
        p90: percentile(&sorted, 0.90),
        p99: percentile(&sorted, 0.99),
    })
}

/// Nearest-rank percentile over an already sorted, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
