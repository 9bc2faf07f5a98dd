//! TOML configuration for meshperf.
//!
//! One immutable [`ProbeConfig`] is built at startup (file, then CLI
//! overrides), validated, and shared by every component afterwards.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::flood::{default_tiers, Tier};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "MESHPERF_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/meshperf/meshperf.toml";

/// Well-known port every node serves `/perf` and `/dispatch` on.
pub const DEFAULT_PEER_PORT: u16 = 7007;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a meshperf process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProbeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded meshperf configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `MESHPERF_CONFIG` environment variable.
    /// 2. `/etc/meshperf/meshperf.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "MESHPERF_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject configurations the probe cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.network
            .bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("invalid bind address '{}'", self.network.bind_address))?;
        if self.network.peer_port == 0 {
            anyhow::bail!("peer port '0' out of range (0, 65535]");
        }
        if self.network.connect_timeout_ms == 0 {
            anyhow::bail!("connect timeout must be positive");
        }
        if self.flood.trial_timeout_ms == 0 {
            anyhow::bail!("trial timeout must be positive");
        }
        if self.flood.tier_timeout_ms == Some(0) {
            anyhow::bail!("tier timeout must be positive when set");
        }
        if self.flood.tiers.is_empty() {
            anyhow::bail!("at least one flood tier is required");
        }
        for (rung, tier) in self.flood.tiers.iter().enumerate() {
            if tier.payload_size == 0 || tier.threads == 0 {
                anyhow::bail!(
                    "flood tier {} must have a positive payload size and thread count",
                    rung
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface the probe server binds to.
    pub bind_address: String,
    /// Port for all peer-to-peer probe and dispatch traffic.
    pub peer_port: u16,
    /// TCP connect timeout for outbound requests.
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            peer_port: DEFAULT_PEER_PORT,
            connect_timeout_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, self.peer_port),
            _ => format!("{}:{}", self.bind_address, self.peer_port),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Flood
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    /// Deadline for a single trial request.
    pub trial_timeout_ms: u64,
    /// Optional deadline for a whole tier.
    pub tier_timeout_ms: Option<u64>,
    /// Ladder of tiers, strongest first.
    pub tiers: Vec<Tier>,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            trial_timeout_ms: 10_000,
            tier_timeout_ms: None,
            tiers: default_tiers(),
        }
    }
}

impl FloodConfig {
    pub fn trial_timeout(&self) -> Duration {
        Duration::from_millis(self.trial_timeout_ms)
    }

    pub fn tier_timeout(&self) -> Option<Duration> {
        self.tier_timeout_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
