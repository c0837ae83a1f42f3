//! The retry step: outermost incoming step, owns the commit/abort decision.
//!
//! For every received message:
//!
//! 1. No usable message id: straight to the error queue, nothing tracked.
//! 2. Fewer failures than the limit: run the rest of the pipeline, commit, clean up.
//!    Any error (from handlers or from commit) is registered and the transaction is
//!    aborted so the transport redelivers.
//! 3. Limit reached, second level disabled: move to the error queue.
//! 4. Limit reached, second level enabled: dispatch again as a failed message, tracked
//!    under `<id>-2nd-level`, until that id reaches the limit too.
//!
//! The step never retries by itself; redelivery always comes from the transport.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use courier_core::{BusError, BusResult, MessageId, headers};
use courier_messaging::{ErrorHandler, IncomingStep, IncomingStepContext, Next, PipelineStep};

use super::error_tracker::ErrorTracker;

/// Transaction item set when the message must reach handlers as a failed message.
pub const DISPATCH_AS_FAILED_MESSAGE: &str = "dispatch-as-failed-message";

/// Value stored under [`DISPATCH_AS_FAILED_MESSAGE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondLevelDispatch {
    /// What went wrong during the first-level attempts.
    pub error_description: String,
}

pub struct RetryStep {
    error_tracker: Arc<dyn ErrorTracker>,
    error_handler: Arc<dyn ErrorHandler>,
    second_level_retries: bool,
}

impl RetryStep {
    pub const NAME: &'static str = "retry";

    pub fn new(
        error_tracker: Arc<dyn ErrorTracker>,
        error_handler: Arc<dyn ErrorHandler>,
        second_level_retries: bool,
    ) -> Self {
        Self {
            error_tracker,
            error_handler,
            second_level_retries,
        }
    }

    async fn dispatch(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
        tracking_id: &str,
        clean_up: &[&str],
    ) -> BusResult<()> {
        let transaction = context.transaction().clone();

        let outcome = match next.run(context).await {
            Ok(()) => transaction.commit().await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                for id in clean_up {
                    self.error_tracker.clean_up(id);
                }
            }
            Err(BusError::Cancelled) => {
                debug!(message_id = tracking_id, "dispatch interrupted by shutdown");
                transaction.abort().await;
            }
            Err(err) => {
                self.error_tracker.register_error(tracking_id, &err);
                warn!(
                    message_id = tracking_id,
                    attempt = self.error_tracker.error_count(tracking_id),
                    error = %err.describe(),
                    "message dispatch failed"
                );
                transaction.abort().await;
            }
        }

        Ok(())
    }

    /// Hand the message to the error handler and commit. Tracker entries are only
    /// removed once the move has committed.
    async fn move_to_error_queue(
        &self,
        context: &IncomingStepContext,
        error_description: &str,
        clean_up: &[&str],
    ) -> BusResult<()> {
        let transaction = context.transaction();

        let moved = match self
            .error_handler
            .handle_poison_message(context.transport_message().clone(), transaction, error_description)
            .await
        {
            Ok(()) => transaction.commit().await,
            Err(err) => Err(err),
        };

        match moved {
            Ok(()) => {
                for id in clean_up {
                    self.error_tracker.clean_up(id);
                }
                Ok(())
            }
            Err(err) => {
                error!(error = %err.describe(), "could not move poison message to error queue");
                transaction.abort().await;
                Err(err)
            }
        }
    }
}

impl PipelineStep for RetryStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl IncomingStep for RetryStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()> {
        let Some(message_id) = context.transport_message().message_id() else {
            let description = format!(
                "received message with empty or absent '{}' header; all messages must carry an id",
                headers::MESSAGE_ID
            );
            warn!("{description}");
            return self.move_to_error_queue(context, &description, &[]).await;
        };
        let id = message_id.as_str();

        if !self.error_tracker.has_failed_too_many_times(id) {
            return self.dispatch(context, next, id, &[id]).await;
        }

        let first_level = self.error_tracker.full_description(id).unwrap_or_default();

        if !self.second_level_retries {
            return self.move_to_error_queue(context, &first_level, &[id]).await;
        }

        let second_level_id: MessageId = message_id.second_level();
        let second_id = second_level_id.as_str();

        if self.error_tracker.has_failed_too_many_times(second_id) {
            let second_level = self.error_tracker.full_description(second_id).unwrap_or_default();
            let description = format!("{first_level}\n{second_level}");
            return self
                .move_to_error_queue(context, &description, &[id, second_id])
                .await;
        }

        debug!(message_id = id, "dispatching as failed message");
        context.transaction().set_item(
            DISPATCH_AS_FAILED_MESSAGE,
            SecondLevelDispatch {
                error_description: first_level,
            },
        );

        self.dispatch(context, next, second_id, &[id, second_id]).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::{Headers, TransportMessage};
    use courier_messaging::{Pipeline, PipelineInvoker, TransactionContext};

    use super::*;
    use crate::retry::error_tracker::InMemErrorTracker;

    #[derive(Default)]
    struct RecordingErrorHandler {
        moved: Mutex<Vec<(TransportMessage, String)>>,
    }

    #[async_trait]
    impl ErrorHandler for RecordingErrorHandler {
        async fn handle_poison_message(
            &self,
            message: TransportMessage,
            _transaction: &courier_messaging::TransactionContext,
            error_description: &str,
        ) -> BusResult<()> {
            self.moved.lock().unwrap().push((message, error_description.to_string()));
            Ok(())
        }
    }

    /// Terminal step standing in for the rest of the pipeline.
    struct Outcome {
        calls: Arc<AtomicUsize>,
        fail: bool,
        saw_failed_flag: Arc<Mutex<Vec<bool>>>,
    }

    impl PipelineStep for Outcome {
        fn name(&self) -> &'static str {
            "outcome"
        }
    }

    #[async_trait]
    impl IncomingStep for Outcome {
        async fn process(
            &self,
            context: &mut IncomingStepContext,
            _next: Next<'_, dyn IncomingStep>,
        ) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_failed_flag
                .lock()
                .unwrap()
                .push(context.transaction().has_item(DISPATCH_AS_FAILED_MESSAGE));
            if self.fail {
                Err(BusError::Handler(anyhow::anyhow!("handler failed")))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        tracker: Arc<InMemErrorTracker>,
        errors: Arc<RecordingErrorHandler>,
        calls: Arc<AtomicUsize>,
        flags: Arc<Mutex<Vec<bool>>>,
        pipeline: PipelineInvoker<dyn IncomingStep>,
    }

    fn fixture(max_attempts: u32, second_level: bool, fail: bool) -> Fixture {
        let tracker = Arc::new(InMemErrorTracker::new(max_attempts));
        let errors = Arc::new(RecordingErrorHandler::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let flags = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline
            .append(Arc::new(RetryStep::new(tracker.clone(), errors.clone(), second_level)))
            .append(Arc::new(Outcome {
                calls: calls.clone(),
                fail,
                saw_failed_flag: flags.clone(),
            }));

        Fixture {
            tracker,
            errors,
            calls,
            flags,
            pipeline: pipeline.build(),
        }
    }

    fn message(id: Option<&str>) -> TransportMessage {
        let msg = TransportMessage::new(Headers::new(), b"{}".to_vec());
        match id {
            Some(id) => msg.with_header(headers::MESSAGE_ID, id),
            None => msg,
        }
    }

    async fn deliver(f: &Fixture, msg: &TransportMessage) -> Arc<TransactionContext> {
        let tx = TransactionContext::arc();
        let mut ctx = IncomingStepContext::new(msg.clone(), tx.clone());
        f.pipeline.invoke(&mut ctx).await.unwrap();
        tx
    }

    #[tokio::test]
    async fn failures_abort_until_the_limit_then_move() {
        let f = fixture(3, false, true);
        let msg = message(Some("m-1"));

        for _ in 0..3 {
            let tx = deliver(&f, &msg).await;
            assert!(tx.is_aborted());
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.tracker.error_count("m-1"), 3);

        let tx = deliver(&f, &msg).await;
        assert!(tx.is_committed());
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);

        let moved = f.errors.moved.lock().unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].1.lines().count(), 3);
        assert_eq!(f.tracker.error_count("m-1"), 0);
    }

    #[tokio::test]
    async fn success_commits_and_cleans_up() {
        let f = fixture(5, false, false);
        f.tracker
            .register_error("m-1", &BusError::Handler(anyhow::anyhow!("earlier failure")));

        let tx = deliver(&f, &message(Some("m-1"))).await;

        assert!(tx.is_committed());
        assert_eq!(f.tracker.short_description("m-1"), None);
    }

    #[tokio::test]
    async fn missing_id_goes_to_error_queue_untracked() {
        let f = fixture(5, false, true);

        let tx = deliver(&f, &message(None)).await;
        let tx_blank = deliver(&f, &message(Some("   "))).await;

        assert!(tx.is_committed());
        assert!(tx_blank.is_committed());
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.errors.moved.lock().unwrap().len(), 2);
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn second_level_dispatch_is_flagged_and_tracked_separately() {
        let f = fixture(2, true, true);
        let msg = message(Some("m-1"));

        for _ in 0..4 {
            deliver(&f, &msg).await;
        }
        assert_eq!(*f.flags.lock().unwrap(), vec![false, false, true, true]);
        assert_eq!(f.tracker.error_count("m-1"), 2);
        assert_eq!(f.tracker.error_count("m-1-2nd-level"), 2);

        deliver(&f, &msg).await;
        let moved = f.errors.moved.lock().unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].1.lines().count(), 4);
        assert!(f.tracker.is_empty());
    }

    #[tokio::test]
    async fn failing_commit_counts_as_a_failure() {
        let f = fixture(5, false, false);
        let tx = TransactionContext::arc();
        tx.on_committed(|| async { Err(BusError::transport("broker gone")) });

        let mut ctx = IncomingStepContext::new(message(Some("m-1")), tx.clone());
        f.pipeline.invoke(&mut ctx).await.unwrap();

        assert!(tx.is_aborted());
        assert_eq!(f.tracker.error_count("m-1"), 1);
    }
}
