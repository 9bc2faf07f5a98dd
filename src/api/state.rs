use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::flood::{LoadGenerator, TierSelector};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProbeConfig>,
    pub selector: Arc<TierSelector<LoadGenerator>>,
    /// Process-wide shutdown token; cancels in-flight floods and copies.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ProbeConfig, shutdown: CancellationToken) -> Result<Self> {
        let generator = LoadGenerator::new(&config)?;
        let selector = TierSelector::new(generator, config.flood.tiers.clone());
        Ok(Self {
            config: Arc::new(config),
            selector: Arc::new(selector),
            shutdown,
        })
    }
}
