//! Exclusive access locks keyed by bucket index.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use courier_core::BusError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock acquisition cancelled")]
    Cancelled,

    #[error("timed out acquiring lock bucket {0}")]
    Timeout(usize),

    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<LockError> for BusError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled => BusError::Cancelled,
            other => BusError::Lock(other.to_string()),
        }
    }
}

/// Mutual exclusion per bucket index.
///
/// `acquire` waits (without spinning) until the bucket is free, and returns
/// [`LockError::Cancelled`] promptly once `cancel` fires. Every successful `acquire`
/// must be paired with exactly one `release`.
#[async_trait]
pub trait ExclusiveAccessLock: Send + Sync {
    async fn acquire(&self, bucket: usize, cancel: &CancellationToken) -> Result<(), LockError>;

    async fn release(&self, bucket: usize) -> Result<(), LockError>;
}

/// In-process locks: one single-permit semaphore per bucket, allocated up front.
#[derive(Debug)]
pub struct SemaphoreBuckets {
    buckets: Box<[Semaphore]>,
}

impl SemaphoreBuckets {
    pub fn new(max_lock_buckets: usize) -> Self {
        Self {
            buckets: (0..max_lock_buckets.max(1)).map(|_| Semaphore::new(1)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Whether `bucket` is currently held.
    pub fn is_held(&self, bucket: usize) -> bool {
        self.buckets
            .get(bucket)
            .is_some_and(|sem| sem.available_permits() == 0)
    }

    /// Wake every waiter with an error and refuse further acquisitions. Used on shutdown.
    pub fn close(&self) {
        for sem in self.buckets.iter() {
            sem.close();
        }
    }

    fn bucket(&self, bucket: usize) -> Result<&Semaphore, LockError> {
        self.buckets.get(bucket).ok_or_else(|| {
            LockError::Backend(format!(
                "bucket {bucket} out of range (0..{})",
                self.buckets.len()
            ))
        })
    }
}

#[async_trait]
impl ExclusiveAccessLock for SemaphoreBuckets {
    async fn acquire(&self, bucket: usize, cancel: &CancellationToken) -> Result<(), LockError> {
        let sem = self.bucket(bucket)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            permit = sem.acquire() => {
                // Held until `release` hands the permit back.
                permit.map_err(|_| LockError::Cancelled)?.forget();
                trace!(bucket, "saga lock acquired");
                Ok(())
            }
        }
    }

    async fn release(&self, bucket: usize) -> Result<(), LockError> {
        let sem = self.bucket(bucket)?;
        if sem.available_permits() > 0 {
            return Err(LockError::Backend(format!("bucket {bucket} is not held")));
        }
        sem.add_permits(1);
        trace!(bucket, "saga lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn bucket_is_exclusive_until_released() {
        let locks = Arc::new(SemaphoreBuckets::new(4));
        let cancel = CancellationToken::new();

        locks.acquire(2, &cancel).await.unwrap();
        assert!(locks.is_held(2));

        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire(2, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Other buckets are independent.
        locks.acquire(3, &cancel).await.unwrap();

        locks.release(2).await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(locks.is_held(2));
    }

    #[tokio::test]
    async fn waiting_is_cancellable() {
        let locks = Arc::new(SemaphoreBuckets::new(1));
        let cancel = CancellationToken::new();
        locks.acquire(0, &cancel).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire(0, &cancel).await })
        };
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(LockError::Cancelled));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let locks = Arc::new(SemaphoreBuckets::new(1));
        let cancel = CancellationToken::new();
        locks.acquire(0, &cancel).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire(0, &cancel).await })
        };
        tokio::task::yield_now().await;
        locks.close();

        assert_eq!(waiter.await.unwrap(), Err(LockError::Cancelled));
    }

    #[tokio::test]
    async fn misuse_is_reported() {
        let locks = SemaphoreBuckets::new(2);
        assert!(matches!(locks.release(0).await, Err(LockError::Backend(_))));
        assert!(matches!(
            locks.acquire(9, &CancellationToken::new()).await,
            Err(LockError::Backend(_))
        ));
    }
}
