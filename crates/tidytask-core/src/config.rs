use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TidyTaskError};

/// Urgency cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached entries before LRU eviction kicks in.
    pub max_size: usize,
    /// Seconds an entry stays valid after it was stored.
    pub ttl_secs: u64,
    /// Bucket width used to coarsen due timestamps into cache keys.
    /// One minute unless a caller needs finer granularity.
    pub key_granularity_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl_secs: 60,
            key_granularity_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Batched write coalescing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pending updates that trigger an inline flush.
    pub batch_size: usize,
    /// Debounce interval for the deferred flush, measured from the most
    /// recent enqueue.
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 500,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Refresh throttling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Delay before a scheduled refresh cycle fires.
    pub update_interval_ms: u64,
    /// Per-component ceiling on actual callback invocations.
    pub max_updates_per_second: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            max_updates_per_second: 30,
        }
    }
}

impl ThrottleConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Minimum gap between two real invocations of the same component.
    pub fn min_update_gap(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.max_updates_per_second.max(1) as f64)
    }
}

/// Memory monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Used-memory ratio above which the Warning level is reported.
    pub warning_threshold: f64,
    /// Used-memory ratio above which the Critical level is reported.
    pub critical_threshold: f64,
    /// Seconds between polling loop samples.
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.8,
            critical_threshold: 0.9,
            poll_interval_secs: 5,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Bundled configuration for the whole performance layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub throttle: ThrottleConfig,
    pub monitor: MonitorConfig,
}

impl PerfConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any missing section or field.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor.warning_threshold >= self.monitor.critical_threshold {
            return Err(TidyTaskError::InvalidOperation(format!(
                "warning_threshold ({}) must be below critical_threshold ({})",
                self.monitor.warning_threshold, self.monitor.critical_threshold
            )));
        }
        if self.batch.batch_size == 0 {
            return Err(TidyTaskError::InvalidOperation(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.throttle.max_updates_per_second == 0 {
            return Err(TidyTaskError::InvalidOperation(
                "max_updates_per_second must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
