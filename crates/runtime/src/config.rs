//! Bus configuration.
//!
//! Every section has sensible defaults; hosts override what they need with the
//! `with_*` setters or from environment variables via [`BusConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use courier_core::BusError;

pub const ENV_MAX_DELIVERY_ATTEMPTS: &str = "COURIER_MAX_DELIVERY_ATTEMPTS";
pub const ENV_ERROR_QUEUE: &str = "COURIER_ERROR_QUEUE";
pub const ENV_SECOND_LEVEL_RETRIES: &str = "COURIER_SECOND_LEVEL_RETRIES";
pub const ENV_WORKERS: &str = "COURIER_WORKERS";
pub const ENV_MAX_PARALLELISM: &str = "COURIER_MAX_PARALLELISM";
pub const ENV_MAX_LOCK_BUCKETS: &str = "COURIER_MAX_LOCK_BUCKETS";
pub const ENV_BACKOFF_MS: &str = "COURIER_BACKOFF_MS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}': {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for BusError {
    fn from(err: ConfigError) -> Self {
        BusError::Config(err.to_string())
    }
}

/// Retry step settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failed attempts after which a message is poison.
    pub max_delivery_attempts: u32,
    /// Where poison messages go.
    pub error_queue_address: String,
    /// Give handlers one more round with a failed-message envelope before giving up.
    pub second_level_retries_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            error_queue_address: "error".to_string(),
            second_level_retries_enabled: false,
        }
    }
}

impl RetryConfig {
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    pub fn with_error_queue(mut self, address: impl Into<String>) -> Self {
        self.error_queue_address = address.into();
        self
    }

    pub fn with_second_level_retries(mut self, enabled: bool) -> Self {
        self.second_level_retries_enabled = enabled;
        self
    }
}

/// Worker polling delays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// One entry per consecutive empty poll; the last entry repeats.
    pub idle_tiers: Vec<Duration>,
    /// Pause between polls while messages keep arriving.
    pub busy_wait: Duration,
    /// Pause after a receive/dispatch infrastructure failure.
    pub error_wait: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let mut idle_tiers = Vec::with_capacity(31);
        idle_tiers.extend(std::iter::repeat_n(Duration::from_millis(100), 10));
        idle_tiers.extend(std::iter::repeat_n(Duration::from_millis(200), 10));
        idle_tiers.extend(std::iter::repeat_n(Duration::from_millis(500), 10));
        idle_tiers.push(Duration::from_secs(1));

        Self {
            idle_tiers,
            busy_wait: Duration::from_millis(10),
            error_wait: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    pub fn with_idle_tiers(mut self, tiers: impl IntoIterator<Item = Duration>) -> Self {
        self.idle_tiers = tiers.into_iter().collect();
        self
    }

    pub fn with_busy_wait(mut self, wait: Duration) -> Self {
        self.busy_wait = wait;
        self
    }

    pub fn with_error_wait(mut self, wait: Duration) -> Self {
        self.error_wait = wait;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub number_of_workers: usize,
    /// In-flight dispatches across all workers of one bus.
    pub max_parallelism: usize,
    /// How long stopping a worker (or the bus) waits for in-flight work.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            number_of_workers: 1,
            max_parallelism: 5,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn with_workers(mut self, count: usize) -> Self {
        self.number_of_workers = count;
        self
    }

    pub fn with_max_parallelism(mut self, max: usize) -> Self {
        self.max_parallelism = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaLockConfig {
    /// Install the exclusive-saga-access step.
    pub enabled: bool,
    pub max_lock_buckets: usize,
}

impl Default for SagaLockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_lock_buckets: 1000,
        }
    }
}

impl SagaLockConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_lock_buckets(mut self, buckets: usize) -> Self {
        self.max_lock_buckets = buckets;
        self
    }
}

/// Housekeeping for the in-memory error tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTrackerConfig {
    /// Entries whose latest error is older than this are dropped by the sweep.
    pub stale_entry_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self {
            stale_entry_age: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Complete bus configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub retry: RetryConfig,
    pub backoff: BackoffConfig,
    pub workers: WorkerConfig,
    pub saga_locks: SagaLockConfig,
    pub error_tracker: ErrorTrackerConfig,
}

impl BusConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_saga_locks(mut self, saga_locks: SagaLockConfig) -> Self {
        self.saga_locks = saga_locks;
        self
    }

    pub fn with_error_tracker(mut self, error_tracker: ErrorTrackerConfig) -> Self {
        self.error_tracker = error_tracker;
        self
    }

    /// Defaults overridden by `COURIER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`BusConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_MAX_DELIVERY_ATTEMPTS) {
            config.retry.max_delivery_attempts = parse(ENV_MAX_DELIVERY_ATTEMPTS, &v)?;
        }
        if let Some(v) = lookup(ENV_ERROR_QUEUE) {
            config.retry.error_queue_address = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_SECOND_LEVEL_RETRIES) {
            config.retry.second_level_retries_enabled = parse_bool(ENV_SECOND_LEVEL_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_WORKERS) {
            config.workers.number_of_workers = parse(ENV_WORKERS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PARALLELISM) {
            config.workers.max_parallelism = parse(ENV_MAX_PARALLELISM, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_LOCK_BUCKETS) {
            config.saga_locks.max_lock_buckets = parse(ENV_MAX_LOCK_BUCKETS, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKOFF_MS) {
            config.backoff.idle_tiers = v
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(|part| parse::<u64>(ENV_BACKOFF_MS, part).map(Duration::from_millis))
                .collect::<Result<_, _>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid("max_delivery_attempts must be at least 1".into()));
        }
        if self.retry.error_queue_address.trim().is_empty() {
            return Err(ConfigError::Invalid("error_queue_address must not be empty".into()));
        }
        if self.backoff.idle_tiers.is_empty() {
            return Err(ConfigError::Invalid("backoff idle_tiers must not be empty".into()));
        }
        if self.workers.max_parallelism == 0 {
            return Err(ConfigError::Invalid("max_parallelism must be at least 1".into()));
        }
        if self.saga_locks.max_lock_buckets == 0 {
            return Err(ConfigError::Invalid("max_lock_buckets must be at least 1".into()));
        }
        if self.error_tracker.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("error tracker sweep_interval must be positive".into()));
        }
        Ok(())
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Parse {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
