//! Message handlers and the registry that resolves them per incoming message.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{Headers, LogicalMessage, MessageId, headers};

use crate::saga::SagaBinding;
use crate::transaction::TransactionContext;

/// Per-delivery context handed to handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    headers: Headers,
    transaction: Arc<TransactionContext>,
}

impl MessageContext {
    pub fn new(headers: Headers, transaction: Arc<TransactionContext>) -> Self {
        Self {
            headers,
            transaction,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.headers.get(headers::MESSAGE_ID).map(|id| MessageId::from(id.as_str()))
    }

    pub fn return_address(&self) -> Option<&str> {
        self.headers.get(headers::RETURN_ADDRESS).map(String::as_str)
    }

    /// The receive transaction; work enlisted here commits or aborts with the delivery.
    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }
}

/// Handles one logical message.
///
/// Handlers must be idempotent: delivery is at-least-once, and a failed attempt is
/// redelivered until the retry limit is reached.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &LogicalMessage, context: &MessageContext) -> anyhow::Result<()>;
}

/// Adapter that turns an async closure into a [`MessageHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler. The closure receives owned clones.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(LogicalMessage, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(LogicalMessage, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: &LogicalMessage, context: &MessageContext) -> anyhow::Result<()> {
        (self.f)(message.clone(), context.clone()).await
    }
}

/// A resolved handler for the current message.
#[derive(Clone)]
pub struct HandlerInvoker {
    handler: Arc<dyn MessageHandler>,
    saga: Option<Arc<SagaBinding>>,
}

impl core::fmt::Debug for HandlerInvoker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerInvoker")
            .field("saga", &self.saga.as_ref().map(|s| s.saga_data_type()))
            .finish_non_exhaustive()
    }
}

impl HandlerInvoker {
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            saga: None,
        }
    }

    pub fn for_saga(handler: Arc<dyn MessageHandler>, saga: SagaBinding) -> Self {
        Self {
            handler,
            saga: Some(Arc::new(saga)),
        }
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    /// Saga binding, when this handler operates on saga data.
    pub fn saga(&self) -> Option<&SagaBinding> {
        self.saga.as_deref()
    }

    pub fn is_saga(&self) -> bool {
        self.saga.is_some()
    }

    pub async fn invoke(&self, message: &LogicalMessage, context: &MessageContext) -> anyhow::Result<()> {
        self.handler.handle(message, context).await
    }
}

/// All handlers resolved for one incoming message, in registration order.
#[derive(Debug, Clone, Default)]
pub struct HandlerInvokers(Vec<HandlerInvoker>);

impl HandlerInvokers {
    pub fn new(invokers: Vec<HandlerInvoker>) -> Self {
        Self(invokers)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerInvoker> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Saga bindings of the saga handlers among these invokers.
    pub fn sagas(&self) -> impl Iterator<Item = &SagaBinding> {
        self.0.iter().filter_map(HandlerInvoker::saga)
    }
}

/// Whether a handler receives ordinary deliveries or second-level failed envelopes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryKind {
    Ordinary,
    Failed,
}

impl DeliveryKind {
    pub fn of(message: &LogicalMessage) -> Self {
        if message.is_failed() {
            DeliveryKind::Failed
        } else {
            DeliveryKind::Ordinary
        }
    }
}

/// Handler lookup keyed by message type and delivery kind.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    bindings: HashMap<(String, DeliveryKind), Vec<HandlerInvoker>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.push(message_type.into(), DeliveryKind::Ordinary, HandlerInvoker::new(handler));
    }

    /// Register a handler for second-level deliveries of `message_type`.
    pub fn register_failed(&mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.push(message_type.into(), DeliveryKind::Failed, HandlerInvoker::new(handler));
    }

    pub fn register_saga(
        &mut self,
        message_type: impl Into<String>,
        saga: SagaBinding,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.push(
            message_type.into(),
            DeliveryKind::Ordinary,
            HandlerInvoker::for_saga(handler, saga),
        );
    }

    fn push(&mut self, message_type: String, kind: DeliveryKind, invoker: HandlerInvoker) {
        self.bindings.entry((message_type, kind)).or_default().push(invoker);
    }

    /// Message types with at least one ordinary handler.
    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.bindings
            .keys()
            .filter(|(_, kind)| *kind == DeliveryKind::Ordinary)
            .map(|(t, _)| t.as_str())
    }

    pub fn invokers_for(&self, message: &LogicalMessage) -> HandlerInvokers {
        let key = (message.message().message_type().to_string(), DeliveryKind::of(message));
        HandlerInvokers::new(self.bindings.get(&key).cloned().unwrap_or_default())
    }
}
