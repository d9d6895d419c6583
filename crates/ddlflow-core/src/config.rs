//! Executor and checkpoint store configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Exponential backoff for retrying transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_attempts` times without waiting.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1,
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Configuration for the phased executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Work units of an async stage running at once.
    pub max_concurrent_units: usize,
    /// Work units each data operation is split into.
    pub shards_per_operation: usize,
    /// Per-unit deadline in milliseconds. None disables it.
    pub unit_timeout_ms: Option<u64>,
    /// Retries of a single work unit.
    pub unit_retry: RetryPolicy,
    /// Retries of a whole mutation transaction.
    pub stage_retry: RetryPolicy,
    /// Walk the plan and checkpoint it without touching storage.
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: 4,
            shards_per_operation: 16,
            unit_timeout_ms: None,
            unit_retry: RetryPolicy::default(),
            stage_retry: RetryPolicy::default(),
            dry_run: false,
        }
    }
}

impl ExecutorConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the number of concurrent work units.
    pub fn with_max_concurrent_units(mut self, n: usize) -> Self {
        self.max_concurrent_units = n;
        self
    }

    /// Set how many units each data operation is split into.
    pub fn with_shards_per_operation(mut self, n: usize) -> Self {
        self.shards_per_operation = n;
        self
    }

    /// Set the per-unit deadline.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the work unit retry policy.
    pub fn with_unit_retry(mut self, policy: RetryPolicy) -> Self {
        self.unit_retry = policy;
        self
    }

    /// Set the mutation transaction retry policy.
    pub fn with_stage_retry(mut self, policy: RetryPolicy) -> Self {
        self.stage_retry = policy;
        self
    }

    /// Enable or disable dry runs.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Per-unit deadline.
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_ms.map(Duration::from_millis)
    }
}

/// Configuration for the sled-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStoreConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Flush interval in milliseconds. None means flush on every write.
    pub flush_every_ms: Option<u64>,

    /// Temporary database (deleted on drop).
    pub temporary: bool,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ddlflow_data"),
            cache_capacity: 64 * 1024 * 1024, // 64MB
            flush_every_ms: None,
            temporary: false,
        }
    }
}

impl CheckpointStoreConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let mut config = sled::Config::new().cache_capacity(self.cache_capacity);

        if self.temporary {
            config = config.temporary(true);
        } else {
            config = config.path(&self.path);
        }

        if let Some(ms) = self.flush_every_ms {
            config = config.flush_every_ms(Some(ms));
        }

        config
    }
}
