//! Queue configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::retry::RetryPolicy;

/// Longest lease a config may ask for (100 years).
pub const MAX_LEASE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Database path for item persistence (None = in-memory).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Default lease duration in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Failures allowed before an item is permanently failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Days a completed item is kept before cleanup deletes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Number of concurrent workers in a pool.
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Prefix for worker identities (`<prefix>-<n>`).
    #[serde(default = "default_worker_prefix")]
    pub worker_prefix: String,

    /// Idle wait between empty claims, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Interval between retention runs in a pool, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Candidates fetched per claim round.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,
}

fn default_lease_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    7
}

fn default_workers() -> u32 {
    4
}

fn default_worker_prefix() -> String {
    "worker".to_string()
}

fn default_poll_interval() -> u64 {
    500
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_claim_batch() -> usize {
    16
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            lease_secs: default_lease_secs(),
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            workers: default_workers(),
            worker_prefix: default_worker_prefix(),
            poll_interval_ms: default_poll_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            claim_batch: default_claim_batch(),
        }
    }
}

impl QueueConfig {
    /// Check that the configuration can drive a queue.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.lease_secs == 0 {
            return Err(QueueError::InvalidConfig("lease_secs must be positive".to_string()));
        }
        if self.lease_secs > MAX_LEASE_SECS {
            return Err(QueueError::InvalidConfig(format!(
                "lease_secs must not exceed {}",
                MAX_LEASE_SECS
            )));
        }
        if self.workers == 0 {
            return Err(QueueError::InvalidConfig("workers must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(QueueError::InvalidConfig(
                "cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if self.claim_batch == 0 {
            return Err(QueueError::InvalidConfig("claim_batch must be positive".to_string()));
        }
        if self.worker_prefix.trim().is_empty() {
            return Err(QueueError::InvalidConfig("worker_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Default lease duration.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Idle wait between empty claims.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Interval between retention runs.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Retry policy derived from `max_retries`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}
