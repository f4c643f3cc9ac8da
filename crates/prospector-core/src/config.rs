//! Prospector configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ProspectorError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Task queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Max tasks running at once across the queue.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Base retry delay; attempt N waits base * 2^N.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Dispatcher idle fallback when no wakeup signal arrives.
    #[serde(default = "default_dispatch_idle_ms")]
    pub dispatch_idle_ms: u64,
}

fn default_max_concurrency() -> usize { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_dispatch_idle_ms() -> u64 { 250 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            base_delay_ms: default_base_delay_ms(),
            dispatch_idle_ms: default_dispatch_idle_ms(),
        }
    }
}

/// Ephemeral token authority tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Hard ceiling on any issued token's lifetime, regardless of request.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// TTL used when a caller does not override it.
    #[serde(default = "default_token_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Interval of the expired/revoked sweep.
    #[serde(default = "default_token_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_ttl_secs() -> u64 { 3600 }
fn default_token_ttl_secs() -> u64 { 300 }
fn default_token_sweep_secs() -> u64 { 60 }

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            max_ttl_secs: default_max_ttl_secs(),
            default_ttl_secs: default_token_ttl_secs(),
            sweep_interval_secs: default_token_sweep_secs(),
        }
    }
}

/// Result cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Interval of the expired-entry sweep.
    #[serde(default = "default_cache_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// How long resolved sub-region lists stay cached.
    #[serde(default = "default_subregion_ttl_secs")]
    pub subregion_ttl_secs: u64,
}

fn default_cache_sweep_secs() -> u64 { 300 }
fn default_subregion_ttl_secs() -> u64 { 86_400 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_cache_sweep_secs(),
            subregion_ttl_secs: default_subregion_ttl_secs(),
        }
    }
}

/// Scheduler / heartbeat tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Heartbeat tick interval (due-schedule scan).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Hard ceiling on fan-in waits.
    #[serde(default = "default_fan_in_timeout_secs")]
    pub fan_in_timeout_secs: u64,
    /// Command to spawn for `Worker`-kind schedules (isolated long-running work).
    #[serde(default)]
    pub worker_command: Option<String>,
}

fn default_heartbeat_secs() -> u64 { 60 }
fn default_fan_in_timeout_secs() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            fan_in_timeout_secs: default_fan_in_timeout_secs(),
            worker_command: None,
        }
    }
}

impl OrchestratorConfig {
    /// Load config from the default path (~/.prospector/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProspectorError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ProspectorError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProspectorError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Prospector home directory (~/.prospector).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".prospector")
    }

    fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue.max_concurrency, 3);
        assert_eq!(config.tokens.max_ttl_secs, 3600);
        assert_eq!(config.cache.subregion_ttl_secs, 86_400);
        assert_eq!(config.scheduler.heartbeat_secs, 60);
        assert_eq!(config.scheduler.fan_in_timeout_secs, 300);
    }

    #[test]
    fn test_partial_toml() {
        let config: OrchestratorConfig =
            toml::from_str("[queue]\nmax_concurrency = 8\n").unwrap();
        assert_eq!(config.queue.max_concurrency, 8);
        // Untouched sections keep their defaults
        assert_eq!(config.queue.base_delay_ms, 1000);
        assert_eq!(config.tokens.default_ttl_secs, 300);
    }
}
