//! Table-based locks for multi-process deployments.
//!
//! A [`LockTable`] only knows how to *try* to take a row and how to give it back.
//! [`PollingLock`] turns that into a blocking [`ExclusiveAccessLock`] by retrying with
//! a randomized delay, so competing processes do not retry in lockstep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::lock::{ExclusiveAccessLock, LockError};

/// A shared table of named locks with an owner per row.
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Take `key` for `owner`. `Ok(false)` means someone else holds it right now.
    async fn try_acquire(&self, key: &str, owner: &str) -> Result<bool, LockError>;

    /// Give `key` back. Rows held by another owner are left alone.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;
}

#[async_trait]
impl<T> LockTable for Arc<T>
where
    T: LockTable + ?Sized,
{
    async fn try_acquire(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        (**self).try_acquire(key, owner).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        (**self).release(key, owner).await
    }
}

/// Process-local [`LockTable`], mostly for tests and single-node setups.
#[derive(Debug, Default)]
pub struct InMemoryLockTable {
    rows: Mutex<HashMap<String, String>>,
}

impl InMemoryLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl LockTable for InMemoryLockTable {
    async fn try_acquire(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.contains_key(key) {
            return Ok(false);
        }
        rows.insert(key.to_string(), owner.to_string());
        Ok(true)
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        if rows.get(key).is_some_and(|o| o == owner) {
            rows.remove(key);
        }
        Ok(())
    }
}

/// Retry settings for [`PollingLock`].
#[derive(Debug, Clone)]
pub struct PollingLockConfig {
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Give up with [`LockError::Timeout`] after this long. `None` waits until cancelled.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PollingLockConfig {
    fn default() -> Self {
        Self {
            min_retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(100),
            acquire_timeout: None,
        }
    }
}

impl PollingLockConfig {
    pub fn with_retry_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_delay = min;
        self.max_retry_delay = max.max(min);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// [`ExclusiveAccessLock`] over any [`LockTable`].
pub struct PollingLock<T: LockTable> {
    table: T,
    owner: String,
    config: PollingLockConfig,
}

impl<T: LockTable> PollingLock<T> {
    /// `owner` identifies this process in the table; it must be unique per bus instance.
    pub fn new(table: T, owner: impl Into<String>) -> Self {
        Self {
            table,
            owner: owner.into(),
            config: PollingLockConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollingLockConfig) -> Self {
        self.config = config;
        self
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn key_for(bucket: usize) -> String {
        format!("saga-bucket-{bucket}")
    }

    fn retry_delay(&self) -> Duration {
        let min = self.config.min_retry_delay.as_millis() as u64;
        let max = (self.config.max_retry_delay.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[async_trait]
impl<T: LockTable> ExclusiveAccessLock for PollingLock<T> {
    async fn acquire(&self, bucket: usize, cancel: &CancellationToken) -> Result<(), LockError> {
        let key = Self::key_for(bucket);
        let deadline = self.config.acquire_timeout.map(|t| Instant::now() + t);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            attempts += 1;
            if self.table.try_acquire(&key, &self.owner).await? {
                trace!(bucket, attempts, "table lock acquired");
                return Ok(());
            }

            let mut delay = self.retry_delay();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    debug!(bucket, attempts, "gave up waiting for table lock");
                    return Err(LockError::Timeout(bucket));
                }
                delay = delay.min(deadline - now);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn release(&self, bucket: usize) -> Result<(), LockError> {
        self.table.release(&Self::key_for(bucket), &self.owner).await
    }
}
