//! Runtime configuration for [`crate::RateLimiter`].

use crate::error::{ConfigError, RateLimitError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between usage snapshot writes.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
/// Default interval between approval expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
/// Default lifetime of an approval token.
pub const DEFAULT_APPROVAL_TTL_MS: u64 = 600_000;

/// Where state lives and how often background work runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    /// Directory holding both snapshot files.
    pub data_dir: PathBuf,
    /// File name of the bucket definitions snapshot.
    pub buckets_file: String,
    /// File name of the usage snapshot.
    pub bucket_data_file: String,
    /// Milliseconds between usage snapshot writes.
    pub flush_interval_ms: u64,
    /// Milliseconds between approval expiry sweeps.
    pub sweep_interval_ms: u64,
    /// Milliseconds an approval stays redeemable.
    pub approval_ttl_ms: u64,
    /// Expose durable, admin-managed buckets.
    pub advanced_buckets: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            buckets_file: "buckets.json".to_string(),
            bucket_data_file: "persisted-bucket-data.json".to_string(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            approval_ttl_ms: DEFAULT_APPROVAL_TTL_MS,
            advanced_buckets: false,
        }
    }
}

impl RateLimiterConfig {
    /// Defaults rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), ..Self::default() }
    }

    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, RateLimitError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| {
            RateLimitError::Persistence { path: path.to_path_buf(), source }
        })?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, provided) in [
            ("flush_interval_ms", self.flush_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("approval_ttl_ms", self.approval_ttl_ms),
        ] {
            if provided == 0 {
                return Err(ConfigError::ZeroDuration { field, provided });
            }
        }
        Ok(())
    }

    /// Full path of the definitions snapshot.
    pub fn buckets_path(&self) -> PathBuf {
        self.data_dir.join(&self.buckets_file)
    }

    /// Full path of the usage snapshot.
    pub fn bucket_data_path(&self) -> PathBuf {
        self.data_dir.join(&self.bucket_data_file)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
