//! Test doubles for tier runners.

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use super::{ProbeError, Tier, TierRunner};
use crate::analysis::{compute_perf, Perf};

type Script = Box<dyn Fn(&str, Tier) -> Result<Perf, ProbeError> + Send + Sync>;

/// Answers each tier from a closure and records every call.
pub struct ScriptedRunner {
    script: Script,
    calls: Mutex<Vec<(String, Tier)>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, Tier) -> Result<Perf, ProbeError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Tier)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TierRunner for ScriptedRunner {
    async fn run_tier(
        &self,
        _cancel: &CancellationToken,
        remote: &str,
        tier: Tier,
    ) -> Result<Perf, ProbeError> {
        self.calls.lock().unwrap().push((remote.to_string(), tier));
        (self.script)(remote, tier)
    }
}

pub fn sample_perf() -> Perf {
    compute_perf(&[0.8, 1.0, 1.2], &[1.0e9, 1.2e9, 0.9e9]).unwrap()
}
