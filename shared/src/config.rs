use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::{
    BASE_RETRY_DELAY_MS, COMPLETED_CACHE_SIZE, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_PROBE_TIMEOUT_MS, DEFAULT_REMOTE_TIMEOUT_MS, DEFAULT_SYNC_DEBOUNCE_MS,
    JITTER_MAX_MS, MAX_QUEUE_ENTRIES, MAX_REJECTED_ATTEMPTS, MAX_RETRY_ATTEMPTS,
    MAX_RETRY_DELAY_MS,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("malformed config: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub sync_debounce_ms: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            sync_debounce_ms: DEFAULT_SYNC_DEBOUNCE_MS,
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_entries: usize,
    /// Transient failures tolerated before an action is dead-lettered.
    pub max_attempts: u32,
    /// Remote rejections tolerated before an action is dead-lettered.
    pub max_rejected_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_jitter_ms: u64,
    pub completed_cache_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: MAX_QUEUE_ENTRIES,
            max_attempts: MAX_RETRY_ATTEMPTS,
            max_rejected_attempts: MAX_REJECTED_ATTEMPTS,
            base_backoff_ms: BASE_RETRY_DELAY_MS,
            max_backoff_ms: MAX_RETRY_DELAY_MS,
            max_jitter_ms: JITTER_MAX_MS,
            completed_cache_size: COMPLETED_CACHE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub connectivity: ConnectivityConfig,
    pub queue: QueueConfig,
    pub remote_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityConfig::default(),
            queue: QueueConfig::default(),
            remote_timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON document; missing fields fall back to defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connectivity;
        if c.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be > 0".into()));
        }
        if c.probe_interval_ms < 1000 {
            return Err(ConfigError::Invalid(
                "probe_interval_ms should be at least 1000ms".into(),
            ));
        }
        if c.probe_timeout_ms >= c.probe_interval_ms {
            return Err(ConfigError::Invalid(
                "probe_timeout_ms must be shorter than probe_interval_ms".into(),
            ));
        }

        let q = &self.queue;
        if q.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be > 0".into()));
        }
        if q.max_attempts == 0 || q.max_rejected_attempts == 0 {
            return Err(ConfigError::Invalid("attempt limits must be > 0".into()));
        }
        if q.max_backoff_ms < q.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if q.completed_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "completed_cache_size must be > 0".into(),
            ));
        }

        if self.remote_timeout_ms == 0 {
            return Err(ConfigError::Invalid("remote_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}
