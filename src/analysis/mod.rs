//! Statistical reduction of flood samples.

pub mod stats;

pub use stats::{compute_perf, Perf, StatsError, Summary};
