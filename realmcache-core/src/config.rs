//! Configuration types

use crate::{CacheError, CacheResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of segments handed to one load window.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Default number of segments loaded in parallel within a window.
pub const DEFAULT_LOAD_CONCURRENCY: usize = 4;

/// Default lease lifetime for bootstrap leadership.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;

/// Retry configuration for transient segment failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed per window before the coordinator gives up.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Used by tests and local tooling.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = f64::from(self.backoff_multiplier).powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Bulk-load coordinator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Segments requested per load window.
    pub batch_size: usize,
    /// Segments of one window loaded in parallel.
    pub load_concurrency: usize,
    pub retry: RetryConfig,
    /// How long a bootstrap leadership lease stays valid.
    pub lease_ttl: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            load_concurrency: DEFAULT_LOAD_CONCURRENCY,
            retry: RetryConfig::default(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
        }
    }
}

impl BootstrapConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `REALMCACHE_BOOTSTRAP_BATCH_SIZE`: segments per window (default: 64)
    /// - `REALMCACHE_BOOTSTRAP_CONCURRENCY`: parallel segment loads (default: 4)
    /// - `REALMCACHE_BOOTSTRAP_MAX_RETRIES`: retries per window (default: 3)
    /// - `REALMCACHE_BOOTSTRAP_INITIAL_BACKOFF_MS`: first retry delay (default: 100)
    /// - `REALMCACHE_BOOTSTRAP_LEASE_TTL_SECS`: leadership lease lifetime (default: 300)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            batch_size: env_or("REALMCACHE_BOOTSTRAP_BATCH_SIZE", defaults.batch_size),
            load_concurrency: env_or("REALMCACHE_BOOTSTRAP_CONCURRENCY", defaults.load_concurrency),
            retry: RetryConfig {
                max_retries: env_or("REALMCACHE_BOOTSTRAP_MAX_RETRIES", defaults.retry.max_retries),
                initial_backoff: Duration::from_millis(env_or(
                    "REALMCACHE_BOOTSTRAP_INITIAL_BACKOFF_MS",
                    defaults.retry.initial_backoff.as_millis() as u64,
                )),
                ..defaults.retry
            },
            lease_ttl: Duration::from_secs(env_or(
                "REALMCACHE_BOOTSTRAP_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrency(mut self, load_concurrency: usize) -> Self {
        self.load_concurrency = load_concurrency;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(CacheError::Config) if invalid.
    pub fn validate(&self) -> CacheResult<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", self.batch_size, "batch_size must be greater than 0"));
        }

        if self.load_concurrency == 0 {
            return Err(invalid(
                "load_concurrency",
                self.load_concurrency,
                "load_concurrency must be greater than 0",
            ));
        }

        if self.lease_ttl.is_zero() {
            return Err(invalid(
                "lease_ttl",
                format!("{:?}", self.lease_ttl),
                "lease_ttl must be positive",
            ));
        }

        if self.retry.backoff_multiplier <= 0.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "backoff_multiplier must be positive",
            ));
        }

        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(invalid(
                "retry.max_backoff",
                format!("{:?}", self.retry.max_backoff),
                "max_backoff must not be below initial_backoff",
            ));
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> CacheError {
    CacheError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}
