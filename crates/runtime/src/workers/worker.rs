//! A single polling loop.
//!
//! ```text
//! ┌─▶ yield ─▶ free slot? ──no──▶ wait ──────────────────────────┐
//! │               │yes                                            │
//! │               ▼                                               │
//! │            receive ──none──▶ wait_no_message ─────────────────┤
//! │               │  └──error──▶ wait_error ──────────────────────┤
//! │               ▼ message                                       │
//! │            reset backoff, spawn pipeline run (holds the slot) │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stopping cancels the worker's token: a pending wait or receive returns at once, and
//! the loop waits for its in-flight pipeline runs before exiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::TransportMessage;
use courier_messaging::{
    IncomingStep, IncomingStepContext, PipelineInvoker, TransactionContext, Transport,
};

use super::backoff::BackoffStrategy;
use super::parallel::{ParallelOperation, ParallelOperations};

/// Everything the workers of one bus share.
pub struct WorkerContext {
    pub transport: Arc<dyn Transport>,
    pub pipeline: PipelineInvoker<dyn IncomingStep>,
    pub backoff: Arc<dyn BackoffStrategy>,
    pub parallel: ParallelOperations,
    /// Bus-wide shutdown signal; cancelled on dispose.
    pub shutdown: CancellationToken,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct Worker {
    name: String,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl Worker {
    /// Start a worker on the current tokio runtime.
    pub fn spawn(name: impl Into<String>, context: Arc<WorkerContext>) -> Self {
        let name = name.into();
        let stop = context.shutdown.child_token();
        let join = tokio::spawn(run(name.clone(), context, stop.clone()));
        Self { name, stop, join }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop without waiting.
    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Stop and wait up to `timeout` for the current cycle to finish. Work still
    /// running after the timeout is aborted: dropping a pipeline run aborts its receive
    /// transaction, which hands the message back to the transport, and releases any
    /// saga locks it held.
    pub async fn stop(mut self, timeout: Duration) {
        self.stop.cancel();
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(worker = %self.name, error = %err, "worker task failed"),
            Err(_) => {
                warn!(worker = %self.name, timeout_ms = timeout.as_millis() as u64, "worker did not stop in time; aborting");
                self.join.abort();
            }
        }
    }
}

async fn run(name: String, context: Arc<WorkerContext>, stop: CancellationToken) {
    info!(worker = %name, "worker started");
    let mut in_flight = JoinSet::new();

    while !stop.is_cancelled() {
        // Let spawned continuations run before the next receive.
        tokio::task::yield_now().await;
        reap(&name, &mut in_flight);

        let Some(slot) = context.parallel.try_begin() else {
            context.backoff.wait(&stop).await;
            continue;
        };

        let transaction = TransactionContext::arc();
        match context.transport.receive(&transaction, &stop).await {
            Ok(Some(message)) => {
                context.backoff.reset();
                in_flight.spawn(process(context.clone(), message, transaction, slot));
            }
            Ok(None) => {
                drop(slot);
                // Nothing was enlisted; completing just ends the context.
                let _ = transaction.complete().await;
                context.backoff.wait_no_message(&stop).await;
            }
            Err(err) => {
                drop(slot);
                transaction.abort().await;
                if stop.is_cancelled() {
                    break;
                }
                warn!(worker = %name, error = %err.describe(), "error receiving message");
                context.backoff.wait_error(&stop).await;
            }
        }
    }

    debug!(worker = %name, pending = in_flight.len(), "worker draining");
    while let Some(result) = in_flight.join_next().await {
        if let Err(err) = result {
            error!(worker = %name, error = %err, "message processing task failed");
        }
    }
    info!(worker = %name, "worker stopped");
}

fn reap(name: &str, in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        if let Err(err) = result {
            error!(worker = %name, error = %err, "message processing task failed");
        }
    }
}

/// Run the incoming pipeline for one message and end its transaction.
///
/// The retry step normally commits or aborts by itself; whatever is still open here
/// is completed, and an error escaping the pipeline aborts.
async fn process(
    context: Arc<WorkerContext>,
    message: TransportMessage,
    transaction: Arc<TransactionContext>,
    slot: ParallelOperation,
) {
    let _abort_if_dropped = AbortOnDrop(transaction.clone());
    let mut step_context = IncomingStepContext::new(message, transaction.clone());

    let result = match context.pipeline.invoke(&mut step_context).await {
        Ok(()) => transaction.complete().await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        transaction.abort().await;
        if !context.shutdown.is_cancelled() {
            warn!(error = %err.describe(), "unhandled error in incoming pipeline");
            // Keep the slot while pausing so a broken dependency does not spin.
            context.backoff.wait_error(&context.shutdown).await;
        }
    }

    drop(slot);
}

/// Aborts a receive transaction that is dropped while still open.
///
/// A pipeline run only ends that way when its task is aborted, so the abort is spawned.
struct AbortOnDrop(Arc<TransactionContext>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.0.is_open() {
            return;
        }

        let transaction = self.0.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("pipeline run dropped with an open transaction; aborting");
                handle.spawn(async move { transaction.abort().await });
            }
            Err(_) => warn!("receive transaction dropped outside a runtime; message not returned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_core::Headers;
    use courier_messaging::{CancellationToken, InMemNetwork, InMemTransport};

    use super::*;

    #[tokio::test]
    async fn dropped_run_returns_its_message() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network.clone(), "orders");
        network
            .deliver("orders", TransportMessage::new(Headers::new(), b"{}".to_vec()))
            .unwrap();

        let transaction = TransactionContext::arc();
        let received = transport
            .receive(&transaction, &CancellationToken::new())
            .await
            .unwrap();
        assert!(received.is_some());
        assert_eq!(network.count("orders"), 0);

        drop(AbortOnDrop(transaction.clone()));
        for _ in 0..10 {
            if !transaction.is_open() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(transaction.is_aborted());
        assert_eq!(network.count("orders"), 1);
    }

    #[tokio::test]
    async fn ended_transactions_are_left_alone() {
        let transaction = TransactionContext::arc();
        transaction.commit().await.unwrap();

        drop(AbortOnDrop(transaction.clone()));
        tokio::task::yield_now().await;

        assert!(transaction.is_committed());
    }
}
