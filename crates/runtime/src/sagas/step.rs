//! Incoming step that serializes handling per saga instance.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use courier_core::{BusError, BusResult};
use courier_messaging::{IncomingStep, IncomingStepContext, Next, PipelineStep};

use super::lock::ExclusiveAccessLock;
use super::lock_key::lock_buckets;

/// Takes every saga lock a message needs before the handlers run.
///
/// - Messages without saga handlers pass straight through
/// - Buckets are acquired in ascending order, one at a time
/// - Every acquired bucket is released before the result goes back up the pipeline,
///   whether the handlers succeeded or not
/// - If the run is dropped midway (a worker cut off at its shutdown timeout), the
///   buckets it holds are released on a background task
///
/// Must run after handler activation and before dispatch.
pub struct ExclusiveSagaAccessStep {
    lock: Arc<dyn ExclusiveAccessLock>,
    max_lock_buckets: usize,
    cancel: CancellationToken,
}

impl ExclusiveSagaAccessStep {
    pub const NAME: &'static str = "exclusive-saga-access";

    pub fn new(
        lock: Arc<dyn ExclusiveAccessLock>,
        max_lock_buckets: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lock,
            max_lock_buckets: max_lock_buckets.max(1),
            cancel,
        }
    }

    fn buckets(&self, context: &IncomingStepContext) -> Vec<usize> {
        match (context.invokers(), context.message()) {
            (Some(invokers), Some(message)) => {
                lock_buckets(invokers, message.message(), self.max_lock_buckets)
            }
            _ => Vec::new(),
        }
    }
}

impl PipelineStep for ExclusiveSagaAccessStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl IncomingStep for ExclusiveSagaAccessStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()> {
        let buckets = self.buckets(context);
        if buckets.is_empty() {
            return next.run(context).await;
        }

        let mut held = HeldBuckets::new(self.lock.clone(), buckets.len());
        let mut result: BusResult<()> = Ok(());

        for bucket in &buckets {
            match self.lock.acquire(*bucket, &self.cancel).await {
                Ok(()) => held.buckets.push(*bucket),
                Err(err) => {
                    result = Err(BusError::from(err));
                    break;
                }
            }
        }

        if result.is_ok() {
            trace!(buckets = ?held.buckets, "saga locks held");
            result = next.run(context).await;
        }

        held.release_all().await;
        result
    }
}

/// Buckets acquired by one run.
///
/// Whatever is still held when the guard drops is released on a spawned task.
struct HeldBuckets {
    lock: Arc<dyn ExclusiveAccessLock>,
    buckets: Vec<usize>,
}

impl HeldBuckets {
    fn new(lock: Arc<dyn ExclusiveAccessLock>, capacity: usize) -> Self {
        Self {
            lock,
            buckets: Vec::with_capacity(capacity),
        }
    }

    async fn release_all(mut self) {
        while let Some(bucket) = self.buckets.pop() {
            release(self.lock.as_ref(), bucket).await;
        }
    }
}

impl Drop for HeldBuckets {
    fn drop(&mut self) {
        if self.buckets.is_empty() {
            return;
        }

        let buckets = std::mem::take(&mut self.buckets);
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(buckets = ?buckets, "saga run dropped while holding locks; releasing");
                handle.spawn(async move {
                    for bucket in buckets {
                        release(lock.as_ref(), bucket).await;
                    }
                });
            }
            Err(_) => warn!(buckets = ?buckets, "saga locks dropped outside a runtime; not released"),
        }
    }
}

async fn release(lock: &dyn ExclusiveAccessLock, bucket: usize) {
    if let Err(err) = lock.release(bucket).await {
        warn!(bucket, error = %err, "failed to release saga lock");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use courier_core::{Headers, LogicalMessage, Message, TransportMessage};
    use courier_messaging::{
        CorrelationProperty, HandlerInvoker, HandlerInvokers, Pipeline, SagaBinding,
        TransactionContext, handler_fn,
    };
    use serde_json::json;

    use super::*;
    use crate::sagas::lock::{LockError, SemaphoreBuckets};

    /// Wraps a real lock and records the order of operations.
    struct RecordingLock {
        inner: SemaphoreBuckets,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExclusiveAccessLock for RecordingLock {
        async fn acquire(&self, bucket: usize, cancel: &CancellationToken) -> Result<(), LockError> {
            self.inner.acquire(bucket, cancel).await?;
            self.log.lock().unwrap().push(format!("acquire {bucket}"));
            Ok(())
        }

        async fn release(&self, bucket: usize) -> Result<(), LockError> {
            self.log.lock().unwrap().push(format!("release {bucket}"));
            self.inner.release(bucket).await
        }
    }

    struct Terminal {
        fail: bool,
        log: Arc<RecordingLock>,
    }

    impl PipelineStep for Terminal {
        fn name(&self) -> &'static str {
            "dispatch"
        }
    }

    #[async_trait]
    impl IncomingStep for Terminal {
        async fn process(
            &self,
            _context: &mut IncomingStepContext,
            _next: Next<'_, dyn IncomingStep>,
        ) -> BusResult<()> {
            self.log.log.lock().unwrap().push("handle".to_string());
            if self.fail {
                Err(BusError::Handler(anyhow::anyhow!("handler failed")))
            } else {
                Ok(())
            }
        }
    }

    fn context(invokers: HandlerInvokers, body: serde_json::Value) -> IncomingStepContext {
        let mut ctx = IncomingStepContext::new(
            TransportMessage::new(Headers::new(), Vec::new()),
            TransactionContext::arc(),
        );
        ctx.set_message(LogicalMessage::Ordinary(Message::new("PaymentReceived", body)));
        ctx.set_invokers(invokers);
        ctx
    }

    fn saga_invokers() -> HandlerInvokers {
        let handler = Arc::new(handler_fn(|_m, _c| async { Ok(()) }));
        let binding = SagaBinding::new("sagas.Order")
            .correlate(CorrelationProperty::from_json_field("PaymentReceived", "a", "A"))
            .correlate(CorrelationProperty::from_json_field("PaymentReceived", "b", "B"))
            .correlate(CorrelationProperty::from_json_field("PaymentReceived", "c", "C"));
        HandlerInvokers::new(vec![HandlerInvoker::for_saga(handler, binding)])
    }

    async fn run(fail: bool, invokers: HandlerInvokers) -> (Vec<String>, BusResult<()>) {
        let lock = Arc::new(RecordingLock {
            inner: SemaphoreBuckets::new(1000),
            log: Mutex::new(Vec::new()),
        });
        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline
            .append(Arc::new(ExclusiveSagaAccessStep::new(
                lock.clone(),
                1000,
                CancellationToken::new(),
            )))
            .append(Arc::new(Terminal {
                fail,
                log: lock.clone(),
            }));

        let mut ctx = context(invokers, json!({ "a": "x-1", "b": "y-2", "c": "z-3" }));
        let result = pipeline.build().invoke(&mut ctx).await;
        let log = lock.log.lock().unwrap().clone();
        (log, result)
    }

    fn acquired_order(log: &[String]) -> Vec<usize> {
        log.iter()
            .filter_map(|line| line.strip_prefix("acquire "))
            .map(|b| b.parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn locks_are_taken_in_ascending_order_around_the_handler() {
        let (log, result) = run(false, saga_invokers()).await;
        result.unwrap();

        let order = acquired_order(&log);
        assert!(!order.is_empty());
        assert!(order.windows(2).all(|w| w[0] < w[1]));

        let handle_at = log.iter().position(|l| l == "handle").unwrap();
        assert!(log[..handle_at].iter().all(|l| l.starts_with("acquire")));
        assert!(log[handle_at + 1..].iter().all(|l| l.starts_with("release")));
        assert_eq!(log.len() - handle_at - 1, order.len());
    }

    #[tokio::test]
    async fn locks_are_released_when_the_handler_fails() {
        let (log, result) = run(true, saga_invokers()).await;
        assert!(result.is_err());

        let acquired = log.iter().filter(|l| l.starts_with("acquire")).count();
        let released = log.iter().filter(|l| l.starts_with("release")).count();
        assert!(acquired > 0);
        assert_eq!(acquired, released);
    }

    #[tokio::test]
    async fn non_saga_messages_take_no_locks() {
        let handler = Arc::new(handler_fn(|_m, _c| async { Ok(()) }));
        let (log, result) = run(false, HandlerInvokers::new(vec![HandlerInvoker::new(handler)])).await;
        result.unwrap();
        assert_eq!(log, vec!["handle"]);
    }

    /// Terminal step that never finishes, like a handler still running at shutdown.
    struct Stalled {
        locks: Arc<SemaphoreBuckets>,
        held_inside: Arc<Mutex<usize>>,
    }

    impl PipelineStep for Stalled {
        fn name(&self) -> &'static str {
            "dispatch"
        }
    }

    #[async_trait]
    impl IncomingStep for Stalled {
        async fn process(
            &self,
            _context: &mut IncomingStepContext,
            _next: Next<'_, dyn IncomingStep>,
        ) -> BusResult<()> {
            *self.held_inside.lock().unwrap() =
                (0..self.locks.len()).filter(|b| self.locks.is_held(*b)).count();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn locks_are_released_when_the_run_is_dropped() {
        let locks = Arc::new(SemaphoreBuckets::new(1000));
        let held_inside = Arc::new(Mutex::new(0));

        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline
            .append(Arc::new(ExclusiveSagaAccessStep::new(
                locks.clone(),
                1000,
                CancellationToken::new(),
            )))
            .append(Arc::new(Stalled {
                locks: locks.clone(),
                held_inside: held_inside.clone(),
            }));
        let pipeline = pipeline.build();

        let mut ctx = context(saga_invokers(), json!({ "a": "x-1", "b": "y-2", "c": "z-3" }));
        let cut_off =
            tokio::time::timeout(Duration::from_millis(20), pipeline.invoke(&mut ctx)).await;
        assert!(cut_off.is_err());
        assert!(*held_inside.lock().unwrap() > 0);

        let held = || (0..locks.len()).filter(|b| locks.is_held(*b)).count();
        for _ in 0..10 {
            if held() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(held(), 0);

        // The same saga instance can be handled again.
        let ctx_again = context(saga_invokers(), json!({ "a": "x-1", "b": "y-2", "c": "z-3" }));
        let buckets = lock_buckets(ctx_again.invokers().unwrap(), ctx_again.message().unwrap().message(), 1000);
        let cancel = CancellationToken::new();
        for bucket in buckets {
            tokio::time::timeout(Duration::from_secs(1), locks.acquire(bucket, &cancel))
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn cancelled_wait_fails_the_attempt() {
        let locks = Arc::new(SemaphoreBuckets::new(1));
        let cancel = CancellationToken::new();
        locks.acquire(0, &cancel).await.unwrap();

        let step = ExclusiveSagaAccessStep::new(locks.clone(), 1, cancel.clone());
        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline.append(Arc::new(step));

        cancel.cancel();
        let mut ctx = context(saga_invokers(), json!({ "a": "x-1" }));
        let result = pipeline.build().invoke(&mut ctx).await;

        assert!(matches!(result, Err(BusError::Cancelled)));
        assert!(locks.is_held(0));
    }
}
