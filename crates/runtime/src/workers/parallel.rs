//! Bound on concurrently processed messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared semaphore gating in-flight dispatches across all workers of one bus.
#[derive(Debug, Clone)]
pub struct ParallelOperations {
    semaphore: Arc<Semaphore>,
    max: usize,
}

/// One in-flight dispatch. The slot frees up when this is dropped.
#[derive(Debug)]
pub struct ParallelOperation {
    _permit: OwnedSemaphorePermit,
}

impl ParallelOperations {
    pub fn new(max_parallelism: usize) -> Self {
        let max = max_parallelism.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Claim a slot if one is free.
    pub fn try_begin(&self) -> Option<ParallelOperation> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ParallelOperation { _permit: permit })
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn in_flight(&self) -> usize {
        self.max.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait until every slot is free again. Returns `false` if `timeout` expired first.
    pub async fn wait_for_all(&self, timeout: Duration) -> bool {
        let all = u32::try_from(self.max).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(timeout, self.semaphore.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_bounded_and_returned_on_drop() {
        let parallel = ParallelOperations::new(2);
        let a = parallel.try_begin().unwrap();
        let _b = parallel.try_begin().unwrap();
        assert!(parallel.try_begin().is_none());
        assert_eq!(parallel.in_flight(), 2);

        drop(a);
        assert_eq!(parallel.in_flight(), 1);
        assert!(parallel.try_begin().is_some());
    }

    #[tokio::test]
    async fn wait_for_all_observes_outstanding_work() {
        let parallel = ParallelOperations::new(3);
        let op = parallel.try_begin().unwrap();

        assert!(!parallel.wait_for_all(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(op);
        });
        assert!(parallel.wait_for_all(Duration::from_secs(5)).await);
        assert_eq!(parallel.in_flight(), 0);
    }
}
