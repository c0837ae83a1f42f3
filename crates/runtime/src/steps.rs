//! Default pipeline steps around the retry and saga-locking steps.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::trace;

use courier_core::{BusError, BusResult, FailedMessage, LogicalMessage, MessageId, headers};
use courier_messaging::{
    HandlerRegistry, IncomingStep, IncomingStepContext, MessageContext, Next, OutgoingStep,
    OutgoingStepContext, PipelineStep, Serializer, Transport,
};

use crate::retry::{DISPATCH_AS_FAILED_MESSAGE, SecondLevelDispatch};

/// Turns the transport message into a logical message. Second-level deliveries are
/// wrapped in a [`FailedMessage`].
pub struct DeserializeStep {
    serializer: Arc<dyn Serializer>,
}

impl DeserializeStep {
    pub const NAME: &'static str = "deserialize";

    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

impl PipelineStep for DeserializeStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl IncomingStep for DeserializeStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()> {
        let message = self.serializer.deserialize(context.transport_message())?;

        let logical = match context
            .transaction()
            .item::<SecondLevelDispatch>(DISPATCH_AS_FAILED_MESSAGE)
        {
            Some(dispatch) => LogicalMessage::Failed(FailedMessage::new(message, dispatch.error_description)),
            None => LogicalMessage::Ordinary(message),
        };

        context.set_message(logical);
        next.run(context).await
    }
}

/// Resolves the handlers for the logical message.
pub struct ActivateHandlersStep {
    registry: Arc<HandlerRegistry>,
}

impl ActivateHandlersStep {
    pub const NAME: &'static str = "activate-handlers";

    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

impl PipelineStep for ActivateHandlersStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl IncomingStep for ActivateHandlersStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()> {
        let message = context
            .message()
            .ok_or_else(|| BusError::config("activate-handlers ran before deserialize"))?;
        let invokers = self.registry.invokers_for(message);
        context.set_invokers(invokers);
        next.run(context).await
    }
}

/// Calls every resolved handler in order. A message nobody handles is an error, and
/// a panicking handler counts as a failed attempt.
#[derive(Debug, Default)]
pub struct DispatchStep;

impl DispatchStep {
    pub const NAME: &'static str = "dispatch";
}

impl PipelineStep for DispatchStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[async_trait]
impl IncomingStep for DispatchStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()> {
        let (Some(message), Some(invokers)) = (context.message(), context.invokers()) else {
            return Err(BusError::config("dispatch ran before handler activation"));
        };

        if invokers.is_empty() {
            return Err(BusError::NoHandlers(message.message().message_type().to_string()));
        }

        let handler_context = MessageContext::new(
            context.transport_message().headers().clone(),
            context.transaction().clone(),
        );

        for invoker in invokers.iter() {
            trace!(message_type = message.message().message_type(), saga = invoker.is_saga(), "invoking handler");
            match AssertUnwindSafe(invoker.invoke(message, &handler_context))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(BusError::Handler(err)),
                Err(payload) => return Err(BusError::HandlerPanicked(panic_message(payload.as_ref()))),
            }
        }

        next.run(context).await
    }
}

/// Fills in id, correlation id, timestamp and sender headers the caller did not set.
pub struct AssignHeadersStep {
    sender_address: Option<String>,
}

impl AssignHeadersStep {
    pub const NAME: &'static str = "assign-headers";

    pub fn new(sender_address: Option<String>) -> Self {
        Self { sender_address }
    }
}

impl PipelineStep for AssignHeadersStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl OutgoingStep for AssignHeadersStep {
    async fn process(
        &self,
        context: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> BusResult<()> {
        let hdrs = context.message_mut().headers_mut();

        let id = hdrs
            .entry(headers::MESSAGE_ID.to_string())
            .or_insert_with(|| MessageId::new().to_string())
            .clone();
        // A conversation starts with its first message.
        hdrs.entry(headers::CORRELATION_ID.to_string()).or_insert(id);
        hdrs.entry(headers::SENT_TIME.to_string())
            .or_insert_with(|| Utc::now().to_rfc3339());

        if let Some(sender) = &self.sender_address {
            hdrs.entry(headers::SENDER_ADDRESS.to_string())
                .or_insert_with(|| sender.clone());
            hdrs.entry(headers::RETURN_ADDRESS.to_string())
                .or_insert_with(|| sender.clone());
        }

        next.run(context).await
    }
}

pub struct SerializeStep {
    serializer: Arc<dyn Serializer>,
}

impl SerializeStep {
    pub const NAME: &'static str = "serialize";

    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

impl PipelineStep for SerializeStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl OutgoingStep for SerializeStep {
    async fn process(
        &self,
        context: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> BusResult<()> {
        let transport_message = self.serializer.serialize(context.message())?;
        context.set_transport_message(transport_message);
        next.run(context).await
    }
}

/// Enlists one send per destination in the outgoing transaction.
pub struct SendStep {
    transport: Arc<dyn Transport>,
}

impl SendStep {
    pub const NAME: &'static str = "send";

    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl PipelineStep for SendStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }
}

#[async_trait]
impl OutgoingStep for SendStep {
    async fn process(
        &self,
        context: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> BusResult<()> {
        let message = context
            .transport_message()
            .ok_or_else(|| BusError::config("send ran before serialize"))?;

        for destination in context.destinations() {
            self.transport
                .send(destination, message.clone(), context.transaction())
                .await?;
        }

        next.run(context).await
    }
}
