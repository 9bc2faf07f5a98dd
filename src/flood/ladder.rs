//! Top-down tier selection: the first tier the link sustains wins.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::budget::link_class;
use super::{ProbeError, Tier, TierRunner};
use crate::analysis::Perf;

pub struct TierSelector<R> {
    runner: R,
    tiers: Vec<Tier>,
}

impl<R: TierRunner> TierSelector<R> {
    /// `tiers` must be ordered strongest first.
    pub fn new(runner: R, tiers: Vec<Tier>) -> Self {
        Self { runner, tiers }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Flood `remote` one tier at a time, strongest first.
    ///
    /// Overload, timeout and cancellation step down to the next tier; any
    /// other error is returned immediately. If every tier fails, the last
    /// tier's error is returned.
    pub async fn probe(&self, cancel: &CancellationToken, remote: &str) -> Result<Perf, ProbeError> {
        let mut last = ProbeError::EmptyLadder;

        for (rung, tier) in self.tiers.iter().enumerate() {
            debug!(%remote, rung, %tier, "probing tier");
            match self.runner.run_tier(cancel, remote, *tier).await {
                Ok(perf) => {
                    info!(
                        %remote,
                        rung,
                        %tier,
                        link = link_class(tier.payload_size, tier.threads).unwrap_or("sub-10Gbit"),
                        throughput_avg = perf.throughput.avg,
                        latency_p99 = perf.latency.p99,
                        "link sustained tier"
                    );
                    return Ok(perf);
                }
                Err(e) if e.is_step_down() => {
                    info!(%remote, rung, %tier, reason = %e, "stepping down");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flood::testing::{sample_perf, ScriptedRunner};

    fn ladder() -> Vec<Tier> {
        vec![
            Tier::new(4096, 8),
            Tier::new(4096, 4),
            Tier::new(2048, 2),
        ]
    }

    fn overload() -> ProbeError {
        ProbeError::Overload {
            slow: 1,
            samples: 20,
        }
    }

    #[tokio::test]
    async fn test_first_sustained_tier_wins() {
        let runner = ScriptedRunner::new(|_, tier| {
            if tier.threads > 4 {
                Err(overload())
            } else {
                Ok(sample_perf())
            }
        });
        let selector = TierSelector::new(runner, ladder());

        let perf = selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.unwrap();
        assert_eq!(perf, sample_perf());

        // Tier 1 succeeded, so tier 2 never runs.
        let tiers: Vec<Tier> = selector.runner().calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(tiers, vec![Tier::new(4096, 8), Tier::new(4096, 4)]);
    }

    #[tokio::test]
    async fn test_top_tier_success_runs_nothing_else() {
        let selector = TierSelector::new(ScriptedRunner::new(|_, _| Ok(sample_perf())), ladder());
        selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.unwrap();
        assert_eq!(selector.runner().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_every_tier_failing_is_an_error() {
        let runner = ScriptedRunner::new(|_, tier| {
            if tier.threads == 2 {
                Err(ProbeError::Timeout)
            } else {
                Err(overload())
            }
        });
        let selector = TierSelector::new(runner, ladder());

        let err = selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.unwrap_err();
        // The last tier's error is the one reported.
        assert!(matches!(err, ProbeError::Timeout));
        assert_eq!(selector.runner().calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_steps_down() {
        let runner = ScriptedRunner::new(|_, tier| {
            if tier.threads == 8 {
                Err(ProbeError::Cancelled)
            } else {
                Ok(sample_perf())
            }
        });
        let selector = TierSelector::new(runner, ladder());
        assert!(selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.is_ok());
        assert_eq!(selector.runner().calls().len(), 2);
    }

    #[tokio::test]
    async fn test_hard_error_aborts_ladder() {
        let runner = ScriptedRunner::new(|_, _| Err(ProbeError::Transport("no route to host".into())));
        let selector = TierSelector::new(runner, ladder());

        let err = selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
        assert_eq!(selector.runner().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_ladder() {
        let selector = TierSelector::new(ScriptedRunner::new(|_, _| Ok(sample_perf())), vec![]);
        let err = selector.probe(&CancellationToken::new(), "10.0.0.2:9000").await.unwrap_err();
        assert!(matches!(err, ProbeError::EmptyLadder));
    }
}
