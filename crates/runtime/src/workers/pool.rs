//! Resizable set of workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use super::worker::{Worker, WorkerContext};

/// The workers of one bus.
///
/// Resizing adds or removes one worker at a time under a lock, so concurrent calls
/// serialize and the count always converges to the last requested value.
pub struct Workers {
    context: Arc<WorkerContext>,
    name_prefix: String,
    shutdown_timeout: Duration,
    workers: Mutex<Vec<Worker>>,
    next_id: AtomicUsize,
}

impl Workers {
    pub fn new(context: Arc<WorkerContext>, name_prefix: impl Into<String>, shutdown_timeout: Duration) -> Self {
        Self {
            context,
            name_prefix: name_prefix.into(),
            shutdown_timeout,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    pub async fn count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn names(&self) -> Vec<String> {
        self.workers.lock().await.iter().map(|w| w.name().to_string()).collect()
    }

    pub async fn set_number_of_workers(&self, target: usize) {
        let mut workers = self.workers.lock().await;
        let before = workers.len();

        while workers.len() < target {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let name = format!("{} worker {}", self.name_prefix, id);
            workers.push(Worker::spawn(name, self.context.clone()));
        }

        while workers.len() > target {
            if let Some(worker) = workers.pop() {
                worker.stop(self.shutdown_timeout).await;
            }
        }

        if before != workers.len() {
            info!(bus = %self.name_prefix, from = before, to = workers.len(), "number of workers changed");
        }
    }

    /// Signal every worker first, then wait for each one.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.iter() {
            worker.signal_stop();
        }
        for worker in workers.drain(..) {
            worker.stop(self.shutdown_timeout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_messaging::{InMemNetwork, InMemTransport, Pipeline};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::BackoffConfig;
    use crate::workers::backoff::DefaultBackoffStrategy;
    use crate::workers::parallel::ParallelOperations;

    fn workers() -> Workers {
        let context = Arc::new(WorkerContext {
            transport: Arc::new(InMemTransport::new(InMemNetwork::new(), "input")),
            pipeline: Pipeline::new().build(),
            backoff: Arc::new(DefaultBackoffStrategy::new(&BackoffConfig::default())),
            parallel: ParallelOperations::new(2),
            shutdown: CancellationToken::new(),
        });
        Workers::new(context, "test", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn resizing_converges_to_the_target() {
        let workers = workers();

        workers.set_number_of_workers(3).await;
        assert_eq!(workers.count().await, 3);
        assert_eq!(
            workers.names().await,
            vec!["test worker 1", "test worker 2", "test worker 3"]
        );

        workers.set_number_of_workers(3).await;
        assert_eq!(workers.count().await, 3);

        workers.set_number_of_workers(1).await;
        assert_eq!(workers.names().await, vec!["test worker 1"]);

        workers.set_number_of_workers(2).await;
        assert_eq!(workers.names().await, vec!["test worker 1", "test worker 4"]);

        workers.stop_all().await;
        assert_eq!(workers.count().await, 0);
    }
}
