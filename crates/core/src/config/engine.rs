//! Engine configuration with profile support.
//!
//! Provides the runtime parameters of the engine (poll cadence, alert
//! hysteresis, fetch limits, price staleness, routing tolerance) with
//! named profiles (default, conservative, relaxed) and TOML overrides.

use anyhow::Context;
use lendscope_chain::FetchConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::routing::RoutingConfig;

/// Main configuration structure containing all engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// Liquidation monitor cadence and alerting
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Adapter fan-out limits
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Price freshness requirements
    #[serde(default)]
    pub prices: PriceConfig,

    /// Routing tie-break tolerance
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Liquidation monitor parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Consecutive failed polls before an owner is reported degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after_failures: u32,

    /// HF margin by which an improvement must clear a better tier's lower
    /// edge before a recovery alert fires (0 alerts on any tier improvement)
    #[serde(default = "default_recovery_hysteresis")]
    pub recovery_hysteresis: f64,

    /// Owners refreshed concurrently per tick
    #[serde(default = "default_owner_concurrency")]
    pub owner_concurrency: usize,
}

fn default_poll_interval() -> u64 {
    30
}
fn default_degraded_after() -> u32 {
    3
}
fn default_recovery_hysteresis() -> f64 {
    0.0
}
fn default_owner_concurrency() -> usize {
    8
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            degraded_after_failures: default_degraded_after(),
            recovery_hysteresis: default_recovery_hysteresis(),
            owner_concurrency: default_owner_concurrency(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Price freshness requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceConfig {
    /// Quotes older than this are rejected as stale (seconds)
    #[serde(default = "default_max_staleness")]
    pub max_staleness_secs: u64,
}

fn default_max_staleness() -> u64 {
    3600
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            max_staleness_secs: default_max_staleness(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            monitor: MonitorConfig::default(),
            fetch: FetchConfig::default(),
            prices: PriceConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Parse configuration from TOML text. Missing fields take defaults.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Tighter polling, stricter prices, earlier degraded signal.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            monitor: MonitorConfig {
                poll_interval_secs: 15,
                degraded_after_failures: 2,
                recovery_hysteresis: 0.10,
                owner_concurrency: 8,
            },
            fetch: FetchConfig {
                max_concurrency: 4,
                adapter_timeout_ms: 5_000,
            },
            prices: PriceConfig {
                max_staleness_secs: 300,
            },
            routing: RoutingConfig::default(),
        }
    }

    /// Slow polling for large owner sets or rate-limited sources.
    pub fn relaxed() -> Self {
        Self {
            profile: "relaxed".to_string(),
            monitor: MonitorConfig {
                poll_interval_secs: 120,
                degraded_after_failures: 5,
                recovery_hysteresis: 0.02,
                owner_concurrency: 4,
            },
            fetch: FetchConfig {
                max_concurrency: 2,
                adapter_timeout_ms: 20_000,
            },
            prices: PriceConfig {
                max_staleness_secs: 7_200,
            },
            routing: RoutingConfig {
                apy_epsilon: 0.0005,
            },
        }
    }

    /// Resolve a profile by name.
    pub fn profile(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default" => Some(Self::default()),
            "conservative" | "strict" => Some(Self::conservative()),
            "relaxed" | "slow" => Some(Self::relaxed()),
            _ => None,
        }
    }

    /// Read `ENGINE_PROFILE`: a profile name, or a path to a TOML file.
    /// Unset means the default profile.
    pub fn from_env() -> anyhow::Result<Self> {
        let Ok(value) = std::env::var("ENGINE_PROFILE") else {
            return Ok(Self::default());
        };

        if let Some(config) = Self::profile(&value) {
            return Ok(config);
        }

        if value.ends_with(".toml") || Path::new(&value).exists() {
            return Self::from_file(&value);
        }

        anyhow::bail!("ENGINE_PROFILE={value} is neither a known profile nor a config file")
    }

    /// Reject parameter combinations the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.monitor.poll_interval_secs > 0,
            "monitor.poll_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.monitor.recovery_hysteresis.is_finite() && self.monitor.recovery_hysteresis >= 0.0,
            "monitor.recovery_hysteresis must be a non-negative number"
        );
        anyhow::ensure!(
            self.routing.apy_epsilon.is_finite() && self.routing.apy_epsilon >= 0.0,
            "routing.apy_epsilon must be a non-negative number"
        );
        anyhow::ensure!(
            self.fetch.adapter_timeout_ms > 0,
            "fetch.adapter_timeout_ms must be positive"
        );
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Engine configuration loaded");
        tracing::info!(
            poll_interval_secs = self.monitor.poll_interval_secs,
            degraded_after = self.monitor.degraded_after_failures,
            recovery_hysteresis = self.monitor.recovery_hysteresis,
            owner_concurrency = self.monitor.owner_concurrency,
            "Monitor settings"
        );
        tracing::info!(
            max_concurrency = self.fetch.max_concurrency,
            adapter_timeout_ms = self.fetch.adapter_timeout_ms,
            "Fetch settings"
        );
        tracing::info!(
            max_staleness_secs = self.prices.max_staleness_secs,
            apy_epsilon = self.routing.apy_epsilon,
            "Price and routing settings"
        );
    }
}
