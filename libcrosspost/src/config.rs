//! Configuration management for Crosspost
//!
//! One explicit config struct covers every periodic component: intervals,
//! retry budget and lookahead windows are passed into the components at
//! startup rather than living in hidden module state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    /// Relays used by the Nostr adapter. Other adapters take everything they
    /// need from the account record.
    #[serde(default)]
    pub nostr: Option<NostrConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosspost/crosspost.db".to_string(),
        }
    }
}

/// How a post's aggregate status reacts to a failed target while siblings are
/// still in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Post stays in the mixed interim state until every non-cancelled target
    /// is terminal.
    WaitForAll,
    /// Any failed target fails the whole post immediately.
    FailFast,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self::WaitForAll
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_retries: i64,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Delay before retrying an authentication failure, long enough for the
    /// refresh monitor to run first.
    pub auth_retry_delay_secs: u64,
    pub adapter_timeout_secs: u64,
    /// Bound on concurrently executing dispatch units.
    pub workers: usize,
    pub aggregation: AggregationPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
            max_delay_secs: 3600,
            auth_retry_delay_secs: 900,
            adapter_timeout_secs: 15,
            workers: 8,
            aggregation: AggregationPolicy::WaitForAll,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval_secs: u64,
    pub lookahead_days: i64,
    /// Consecutive failures tolerated before an account is deactivated.
    pub max_consecutive_failures: i64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            lookahead_days: 7,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub interval_secs: u64,
    pub window_days: i64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 21_600,
            window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrConfig {
    pub relays: Vec<String>,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosspost").join("config.toml"))
}
