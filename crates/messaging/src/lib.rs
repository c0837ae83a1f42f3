//! Messaging mechanics: transports, transactions, pipelines and handler bindings.
//!
//! Nothing in this crate decides *policy* (how often to retry, when a message is
//! poisonous, how to lock sagas). It only defines the seams the runtime plugs into,
//! plus in-memory implementations for tests and single-process use.

pub mod error_handler;
pub mod handler;
pub mod in_memory;
pub mod pipeline;
pub mod saga;
pub mod serializer;
pub mod subscriptions;
pub mod transaction;
pub mod transport;

pub use error_handler::ErrorHandler;
pub use handler::{
    DeliveryKind, HandlerInvoker, HandlerInvokers, HandlerRegistry, MessageContext,
    MessageHandler, handler_fn,
};
pub use in_memory::{InMemNetwork, InMemTransport};
pub use pipeline::{
    IncomingStep, IncomingStepContext, Next, OutgoingStep, OutgoingStepContext, Pipeline,
    PipelineInvoker, PipelineStep,
};
pub use saga::{CorrelationProperty, Saga, SagaBinding};
pub use serializer::{JsonSerializer, Serializer};
pub use subscriptions::{InMemorySubscriptionStorage, SubscriptionStorage};
pub use transaction::TransactionContext;
pub use transport::Transport;

pub use tokio_util::sync::CancellationToken;
