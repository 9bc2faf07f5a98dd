//! Per-trial latency budget for a tier.
//!
//! Each tier is sized so that, on a link it fully saturates, every thread
//! finishes its payload in about one second. Latency is treated as normally
//! distributed around that 1s mean, so about 95% of trials should land within
//! 2s (two standard deviations). Anything slower counts towards overload.
//!
//! | link      | budget |
//! |-----------|--------|
//! | 100 Gbit  | 2s     |
//! |  40 Gbit  | 2s     |
//! |  25 Gbit  | 2s     |
//! |  10 Gbit  | 2s     |
//! |   below   | inf    |

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// (name, bytes in flight, latency budget in seconds), strongest first.
const THRESHOLDS: [(&str, f64, f64); 4] = [
    ("100Gbit", 12.5 * GIB, 2.0),
    ("40Gbit", 5.0 * GIB, 2.0),
    ("25Gbit", 3.25 * GIB, 2.0),
    ("10Gbit", 1.25 * GIB, 2.0),
];

/// Latency budget in seconds for one trial of `size` bytes run `threads` wide.
///
/// Returns [`f64::INFINITY`] below the 10 Gbit threshold; only explicit
/// timeouts count as slow there.
pub fn latency_budget(size: u64, threads: usize) -> f64 {
    let throughput = size as f64 * threads as f64;
    THRESHOLDS
        .iter()
        .find(|(_, bytes, _)| throughput >= *bytes)
        .map(|(_, _, budget)| *budget)
        .unwrap_or(f64::INFINITY)
}

/// Name of the highest link class a tier targets, if it reaches one.
pub fn link_class(size: u64, threads: usize) -> Option<&'static str> {
    let throughput = size as f64 * threads as f64;
    THRESHOLDS
        .iter()
        .find(|(_, bytes, _)| throughput >= *bytes)
        .map(|(name, _, _)| *name)
}
