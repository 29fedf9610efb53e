//! Configuration management for the swap watch-tower
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::events::ChainType;
use crate::tracker::{TrackerConfig, DEFAULT_QUEUE_CAPACITY};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tracker: TrackerSettings,
    pub watchtower: WatchTowerSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerSettings {
    #[serde(default)]
    pub restore: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            restore: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl From<&TrackerSettings> for TrackerConfig {
    fn from(settings: &TrackerSettings) -> Self {
        TrackerConfig {
            restore: settings.restore,
            queue_capacity: settings.queue_capacity,
        }
    }
}

/// Automated follow-up a watch-tower may submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Redeem,
    Refund,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Redeem => "redeem",
            Action::Refund => "refund",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchTowerSettings {
    pub actions: Vec<Action>,
    pub retry_count_on_failed_tx: u32,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_type: ChainType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Smallest redeem reward worth submitting for
    #[serde(default)]
    pub min_payoff: u64,
    #[serde(default)]
    pub lock_time_secs: u64,
    #[serde(default)]
    pub reward_for_redeem: u64,
    /// Recorded events replayed on restore
    pub backlog_file: Option<PathBuf>,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `WATCHTOWER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("WATCHTOWER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = HashSet::new();
        for (name, chain) in self.enabled_chains() {
            if !seen.insert(chain.chain_type) {
                anyhow::bail!(
                    "Chain {} reuses chain type {} already configured",
                    name,
                    chain.chain_type
                );
            }
        }

        if !self.watchtower.actions.is_empty() && self.watchtower.retry_count_on_failed_tx == 0 {
            anyhow::bail!("retry_count_on_failed_tx must be positive when actions are enabled");
        }

        if self.tracker.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be positive");
        }

        Ok(())
    }

    /// Get list of enabled chains, ordered by name
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        let mut chains: Vec<_> = self.chains.iter().filter(|(_, c)| c.enabled).collect();
        chains.sort_by(|a, b| a.0.cmp(b.0));
        chains
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    let result = re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    });

    Ok(result.into_owned())
}
