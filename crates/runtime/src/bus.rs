//! The bus: wires transport, pipelines and workers together.
//!
//! ```text
//! BusBuilder ──start()──▶ Bus
//!                          ├─ outgoing: assign-headers → serialize → send
//!                          ├─ workers ─▶ incoming: retry → deserialize → activate-handlers
//!                          │                        → exclusive-saga-access → dispatch
//!                          └─ housekeeping: stale error-tracker sweep
//! ```
//!
//! ## Transactions
//!
//! `send`, `send_to`, `send_local` and `publish` run in a transaction of their own that
//! commits before they return. `reply` enlists in the transaction of the message being
//! handled, so the reply only leaves if that delivery commits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{BusError, BusResult, Message, headers};
use courier_messaging::{
    HandlerRegistry, IncomingStep, InMemorySubscriptionStorage, JsonSerializer, MessageContext,
    MessageHandler, OutgoingStep, OutgoingStepContext, Pipeline, PipelineInvoker, PipelineStep,
    SagaBinding, Serializer, SubscriptionStorage, TransactionContext, Transport,
};

use crate::config::{BusConfig, ErrorTrackerConfig};
use crate::retry::{ErrorTracker, InMemErrorTracker, PoisonQueueErrorHandler, RetryStep};
use crate::router::Router;
use crate::sagas::{ExclusiveAccessLock, ExclusiveSagaAccessStep, SemaphoreBuckets};
use crate::steps::{
    ActivateHandlersStep, AssignHeadersStep, DeserializeStep, DispatchStep, SendStep,
    SerializeStep,
};
use crate::workers::{BackoffStrategy, DefaultBackoffStrategy, ParallelOperations, WorkerContext, Workers};

/// Where a custom step goes relative to a named default step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPosition {
    Before(&'static str),
    After(&'static str),
}

fn place<S: ?Sized + PipelineStep>(
    pipeline: &mut Pipeline<S>,
    position: StepPosition,
    step: Arc<S>,
) -> BusResult<()> {
    match position {
        StepPosition::Before(anchor) => pipeline.insert_before(anchor, step).map(|_| ()),
        StepPosition::After(anchor) => pipeline.insert_after(anchor, step).map(|_| ()),
    }
}

/// Collects handlers and collaborators, then starts a [`Bus`].
pub struct BusBuilder {
    transport: Arc<dyn Transport>,
    config: BusConfig,
    registry: HandlerRegistry,
    router: Router,
    subscriptions: Arc<dyn SubscriptionStorage>,
    serializer: Arc<dyn Serializer>,
    error_tracker: Option<Arc<dyn ErrorTracker>>,
    lock: Option<Arc<dyn ExclusiveAccessLock>>,
    backoff: Option<Arc<dyn BackoffStrategy>>,
    incoming_steps: Vec<(StepPosition, Arc<dyn IncomingStep>)>,
    outgoing_steps: Vec<(StepPosition, Arc<dyn OutgoingStep>)>,
}

impl BusBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: BusConfig::default(),
            registry: HandlerRegistry::new(),
            router: Router::new(),
            subscriptions: Arc::new(InMemorySubscriptionStorage::new()),
            serializer: Arc::new(JsonSerializer),
            error_tracker: None,
            lock: None,
            backoff: None,
            incoming_steps: Vec::new(),
            outgoing_steps: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.registry.register(message_type, handler);
        self
    }

    /// Handler for second-level deliveries of `message_type`.
    pub fn with_failed_handler(
        mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.registry.register_failed(message_type, handler);
        self
    }

    pub fn with_saga_handler(
        mut self,
        message_type: impl Into<String>,
        saga: SagaBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        self.registry.register_saga(message_type, saga, handler);
        self
    }

    pub fn with_route(mut self, message_type: impl Into<String>, address: impl Into<String>) -> Self {
        self.router.map(message_type, address);
        self
    }

    pub fn with_subscription_storage(mut self, storage: Arc<dyn SubscriptionStorage>) -> Self {
        self.subscriptions = storage;
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Replace the per-bus in-memory tracker.
    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.error_tracker = Some(tracker);
        self
    }

    /// Replace the in-process semaphore buckets, e.g. with a [`crate::sagas::PollingLock`]
    /// over a shared lock table.
    pub fn with_exclusive_access_lock(mut self, lock: Arc<dyn ExclusiveAccessLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_backoff_strategy(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_incoming_step(mut self, position: StepPosition, step: Arc<dyn IncomingStep>) -> Self {
        self.incoming_steps.push((position, step));
        self
    }

    pub fn with_outgoing_step(mut self, position: StepPosition, step: Arc<dyn OutgoingStep>) -> Self {
        self.outgoing_steps.push((position, step));
        self
    }

    /// Validate the configuration, create queues, build pipelines and start workers.
    ///
    /// A send-only transport (no input queue) starts no workers.
    pub async fn start(self) -> BusResult<Bus> {
        let config = self.config;
        config.validate()?;

        let transport = self.transport;
        let address = transport.address().map(str::to_string);
        let name = address.clone().unwrap_or_else(|| "one-way client".to_string());

        if let Some(address) = &address {
            transport.create_queue(address).await?;
        }
        transport.create_queue(&config.retry.error_queue_address).await?;

        let shutdown = CancellationToken::new();
        let error_tracker = self
            .error_tracker
            .unwrap_or_else(|| Arc::new(InMemErrorTracker::new(config.retry.max_delivery_attempts)));
        let error_handler = Arc::new(PoisonQueueErrorHandler::new(
            transport.clone(),
            config.retry.error_queue_address.clone(),
        ));

        let mut incoming: Pipeline<dyn IncomingStep> = Pipeline::new();
        incoming
            .append(Arc::new(RetryStep::new(
                error_tracker.clone(),
                error_handler,
                config.retry.second_level_retries_enabled,
            )))
            .append(Arc::new(DeserializeStep::new(self.serializer.clone())))
            .append(Arc::new(ActivateHandlersStep::new(Arc::new(self.registry))));

        let mut own_buckets = None;
        if config.saga_locks.enabled {
            let max_buckets = config.saga_locks.max_lock_buckets;
            let lock: Arc<dyn ExclusiveAccessLock> = match self.lock {
                Some(lock) => lock,
                None => {
                    let buckets = Arc::new(SemaphoreBuckets::new(max_buckets));
                    own_buckets = Some(buckets.clone());
                    buckets
                }
            };
            incoming.append(Arc::new(ExclusiveSagaAccessStep::new(lock, max_buckets, shutdown.clone())));
        }
        incoming.append(Arc::new(DispatchStep));
        for (position, step) in self.incoming_steps {
            place(&mut incoming, position, step)?;
        }

        let mut outgoing: Pipeline<dyn OutgoingStep> = Pipeline::new();
        outgoing
            .append(Arc::new(AssignHeadersStep::new(address.clone())))
            .append(Arc::new(SerializeStep::new(self.serializer)))
            .append(Arc::new(SendStep::new(transport.clone())));
        for (position, step) in self.outgoing_steps {
            place(&mut outgoing, position, step)?;
        }

        debug!(bus = %name, incoming = ?incoming.names(), outgoing = ?outgoing.names(), "pipelines built");

        let backoff = self
            .backoff
            .unwrap_or_else(|| Arc::new(DefaultBackoffStrategy::new(&config.backoff)));
        let context = Arc::new(WorkerContext {
            transport: transport.clone(),
            pipeline: incoming.build(),
            backoff,
            parallel: ParallelOperations::new(config.workers.max_parallelism),
            shutdown: shutdown.clone(),
        });
        let workers = Workers::new(context, name.clone(), config.workers.shutdown_timeout);
        let initial_workers = if address.is_some() { config.workers.number_of_workers } else { 0 };
        workers.set_number_of_workers(initial_workers).await;

        let housekeeping = tokio::spawn(sweep_stale_errors(
            error_tracker.clone(),
            config.error_tracker.clone(),
            shutdown.clone(),
        ));

        info!(
            bus = %name,
            workers = initial_workers,
            max_parallelism = config.workers.max_parallelism,
            max_delivery_attempts = config.retry.max_delivery_attempts,
            "bus started"
        );

        Ok(Bus {
            inner: Arc::new(BusInner {
                name,
                address,
                config,
                transport,
                outgoing: outgoing.build(),
                router: self.router,
                subscriptions: self.subscriptions,
                error_tracker,
                workers,
                own_buckets,
                shutdown,
                housekeeping: std::sync::Mutex::new(Some(housekeeping)),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

async fn sweep_stale_errors(
    tracker: Arc<dyn ErrorTracker>,
    config: ErrorTrackerConfig,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = tracker.sweep_stale(config.stale_entry_age);
                if removed > 0 {
                    debug!(removed, "swept stale error tracker entries");
                }
            }
        }
    }
}

struct BusInner {
    name: String,
    address: Option<String>,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    outgoing: PipelineInvoker<dyn OutgoingStep>,
    router: Router,
    subscriptions: Arc<dyn SubscriptionStorage>,
    error_tracker: Arc<dyn ErrorTracker>,
    workers: Workers,
    own_buckets: Option<Arc<SemaphoreBuckets>>,
    shutdown: CancellationToken,
    housekeeping: std::sync::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// A running bus. Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

impl Bus {
    pub fn builder(transport: Arc<dyn Transport>) -> BusBuilder {
        BusBuilder::new(transport)
    }

    /// Input queue, or `None` for a one-way client.
    pub fn address(&self) -> Option<&str> {
        self.inner.address.as_deref()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn error_tracker(&self) -> &Arc<dyn ErrorTracker> {
        &self.inner.error_tracker
    }

    /// Send to the address routed for the message's type.
    pub async fn send(&self, message: Message) -> BusResult<()> {
        let destination = self.inner.router.route(message.message_type())?.to_string();
        self.send_to(destination, message).await
    }

    pub async fn send_to(&self, destination: impl Into<String>, message: Message) -> BusResult<()> {
        let message = message.with_header(headers::INTENT, headers::intent::POINT_TO_POINT);
        self.dispatch(message, vec![destination.into()], None).await
    }

    /// Send to this bus's own input queue.
    pub async fn send_local(&self, message: Message) -> BusResult<()> {
        let address = self.input_queue()?.to_string();
        self.send_to(address, message).await
    }

    /// Send to every subscriber of the message's type. No subscribers is not an error.
    pub async fn publish(&self, message: Message) -> BusResult<()> {
        let topic = message.message_type().to_string();
        let subscribers = self.inner.subscriptions.subscriber_addresses(&topic).await?;
        if subscribers.is_empty() {
            debug!(bus = %self.inner.name, topic = %topic, "published event has no subscribers");
            return Ok(());
        }

        let message = message.with_header(headers::INTENT, headers::intent::PUBLISH_SUBSCRIBE);
        self.dispatch(message, subscribers, None).await
    }

    /// Reply to the sender of the message being handled.
    pub async fn reply(&self, context: &MessageContext, message: Message) -> BusResult<()> {
        let destination = context
            .return_address()
            .ok_or(BusError::NoReturnAddress)?
            .to_string();

        let mut message = message.with_header(headers::INTENT, headers::intent::POINT_TO_POINT);
        if let Some(id) = context.message_id() {
            message = message.with_header(headers::IN_REPLY_TO, id.as_str());
        }
        if let Some(correlation_id) = context.headers().get(headers::CORRELATION_ID) {
            message = message.with_header(headers::CORRELATION_ID, correlation_id.as_str());
        }

        self.dispatch(message, vec![destination], Some(context.transaction().clone()))
            .await
    }

    pub async fn subscribe(&self, topic: &str) -> BusResult<()> {
        let address = self.input_queue()?;
        self.inner.subscriptions.register_subscriber(topic, address).await?;
        info!(bus = %self.inner.name, topic, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> BusResult<()> {
        let address = self.input_queue()?;
        self.inner.subscriptions.unregister_subscriber(topic, address).await?;
        info!(bus = %self.inner.name, topic, "unsubscribed");
        Ok(())
    }

    pub async fn set_number_of_workers(&self, count: usize) -> BusResult<()> {
        self.input_queue()?;
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        self.inner.workers.set_number_of_workers(count).await;
        Ok(())
    }

    pub async fn number_of_workers(&self) -> usize {
        self.inner.workers.count().await
    }

    /// Stop the bus: cancel every wait, stop the workers, wait for in-flight messages
    /// (bounded by the shutdown timeout) and stop housekeeping. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(bus = %self.inner.name, "disposing bus");

        self.inner.shutdown.cancel();
        self.inner.workers.stop_all().await;

        let parallel = &self.inner.workers.context().parallel;
        if !parallel.wait_for_all(self.inner.config.workers.shutdown_timeout).await {
            warn!(
                bus = %self.inner.name,
                in_flight = parallel.in_flight(),
                "messages still in flight after shutdown timeout"
            );
        }

        if let Some(buckets) = &self.inner.own_buckets {
            buckets.close();
        }

        let housekeeping = self
            .inner
            .housekeeping
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = housekeeping {
            let _ = task.await;
        }

        info!(bus = %self.inner.name, "bus disposed");
    }

    fn input_queue(&self) -> BusResult<&str> {
        self.address()
            .ok_or_else(|| BusError::config("a one-way client has no input queue"))
    }

    async fn dispatch(
        &self,
        message: Message,
        destinations: Vec<String>,
        transaction: Option<Arc<TransactionContext>>,
    ) -> BusResult<()> {
        if let Some(transaction) = transaction {
            return self.run_outgoing(message, destinations, transaction).await;
        }

        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(BusError::Cancelled);
        }

        let transaction = TransactionContext::arc();
        let result = match self.run_outgoing(message, destinations, transaction.clone()).await {
            Ok(()) => transaction.commit().await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            transaction.abort().await;
        }
        result
    }

    async fn run_outgoing(
        &self,
        message: Message,
        destinations: Vec<String>,
        transaction: Arc<TransactionContext>,
    ) -> BusResult<()> {
        let mut context = OutgoingStepContext::new(message, destinations, transaction);
        self.inner.outgoing.invoke(&mut context).await
    }
}
