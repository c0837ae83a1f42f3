//! Incoming and outgoing message pipelines.
//!
//! A pipeline is an ordered list of named steps. Each step receives the step context
//! and a [`Next`] continuation for the rest of the list; it decides whether (and
//! when) to run it. Steps are composed by explicit insertion relative to an anchor
//! step, never by subclassing.
//!
//! ```text
//! incoming: retry → deserialize → activate-handlers → exclusive-saga-access → dispatch
//! outgoing: assign-headers → serialize → send
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{BusError, BusResult, LogicalMessage, Message, TransportMessage};

use crate::handler::HandlerInvokers;
use crate::transaction::TransactionContext;

/// Common surface of every step: a stable name used as an insertion anchor.
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;
}

/// State flowing through the incoming pipeline for one received message.
#[derive(Debug)]
pub struct IncomingStepContext {
    transport_message: TransportMessage,
    transaction: Arc<TransactionContext>,
    message: Option<LogicalMessage>,
    invokers: Option<HandlerInvokers>,
}

impl IncomingStepContext {
    pub fn new(transport_message: TransportMessage, transaction: Arc<TransactionContext>) -> Self {
        Self {
            transport_message,
            transaction,
            message: None,
            invokers: None,
        }
    }

    pub fn transport_message(&self) -> &TransportMessage {
        &self.transport_message
    }

    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }

    /// The deserialized message. Set by the deserialize step.
    pub fn message(&self) -> Option<&LogicalMessage> {
        self.message.as_ref()
    }

    pub fn set_message(&mut self, message: LogicalMessage) {
        self.message = Some(message);
    }

    /// Handlers resolved for this message. Set by the activate-handlers step.
    pub fn invokers(&self) -> Option<&HandlerInvokers> {
        self.invokers.as_ref()
    }

    pub fn set_invokers(&mut self, invokers: HandlerInvokers) {
        self.invokers = Some(invokers);
    }
}

/// State flowing through the outgoing pipeline for one send/publish.
#[derive(Debug)]
pub struct OutgoingStepContext {
    message: Message,
    destinations: Vec<String>,
    transport_message: Option<TransportMessage>,
    transaction: Arc<TransactionContext>,
}

impl OutgoingStepContext {
    pub fn new(message: Message, destinations: Vec<String>, transaction: Arc<TransactionContext>) -> Self {
        Self {
            message,
            destinations,
            transport_message: None,
            transaction,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// The serialized message. Set by the serialize step.
    pub fn transport_message(&self) -> Option<&TransportMessage> {
        self.transport_message.as_ref()
    }

    pub fn set_transport_message(&mut self, message: TransportMessage) {
        self.transport_message = Some(message);
    }

    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }
}

/// Continuation for the remainder of a pipeline.
pub struct Next<'a, S: ?Sized> {
    steps: &'a [Arc<S>],
}

impl<'a, S: ?Sized> Next<'a, S> {
    pub fn new(steps: &'a [Arc<S>]) -> Self {
        Self { steps }
    }

    /// Number of steps left to run.
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

impl Next<'_, dyn IncomingStep> {
    pub async fn run(self, context: &mut IncomingStepContext) -> BusResult<()> {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(context, Next::new(rest)).await,
            None => Ok(()),
        }
    }
}

impl Next<'_, dyn OutgoingStep> {
    pub async fn run(self, context: &mut OutgoingStepContext) -> BusResult<()> {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(context, Next::new(rest)).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
pub trait IncomingStep: PipelineStep {
    async fn process(
        &self,
        context: &mut IncomingStepContext,
        next: Next<'_, dyn IncomingStep>,
    ) -> BusResult<()>;
}

#[async_trait]
pub trait OutgoingStep: PipelineStep {
    async fn process(
        &self,
        context: &mut OutgoingStepContext,
        next: Next<'_, dyn OutgoingStep>,
    ) -> BusResult<()>;
}

/// Mutable, ordered list of named steps.
pub struct Pipeline<S: ?Sized + PipelineStep> {
    steps: Vec<Arc<S>>,
}

impl<S: ?Sized + PipelineStep> Pipeline<S> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn append(&mut self, step: Arc<S>) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn insert_before(&mut self, anchor: &str, step: Arc<S>) -> BusResult<&mut Self> {
        let idx = self.position(anchor)?;
        self.steps.insert(idx, step);
        Ok(self)
    }

    pub fn insert_after(&mut self, anchor: &str, step: Arc<S>) -> BusResult<&mut Self> {
        let idx = self.position(anchor)?;
        self.steps.insert(idx + 1, step);
        Ok(self)
    }

    /// Remove every step with the given name. Returns whether any was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.name() != name);
        self.steps.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    fn position(&self, anchor: &str) -> BusResult<usize> {
        self.steps
            .iter()
            .position(|s| s.name() == anchor)
            .ok_or_else(|| BusError::config(format!("pipeline has no step named '{anchor}'")))
    }

    /// Freeze the step list for invocation.
    pub fn build(self) -> PipelineInvoker<S> {
        PipelineInvoker {
            steps: self.steps.into(),
        }
    }
}

impl<S: ?Sized + PipelineStep> Default for Pipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable, cheaply cloneable step list.
pub struct PipelineInvoker<S: ?Sized> {
    steps: Arc<[Arc<S>]>,
}

impl<S: ?Sized> Clone for PipelineInvoker<S> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
        }
    }
}

impl PipelineInvoker<dyn IncomingStep> {
    pub async fn invoke(&self, context: &mut IncomingStepContext) -> BusResult<()> {
        Next::new(&self.steps).run(context).await
    }
}

impl PipelineInvoker<dyn OutgoingStep> {
    pub async fn invoke(&self, context: &mut OutgoingStepContext) -> BusResult<()> {
        Next::new(&self.steps).run(context).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use courier_core::Headers;

    use super::*;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    impl PipelineStep for Recording {
        fn name(&self) -> &'static str {
            self.name
        }
    }

    #[async_trait]
    impl IncomingStep for Recording {
        async fn process(
            &self,
            context: &mut IncomingStepContext,
            next: Next<'_, dyn IncomingStep>,
        ) -> BusResult<()> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            if !self.short_circuit {
                next.run(context).await?;
            }
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            Ok(())
        }
    }

    fn step(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn IncomingStep> {
        Arc::new(Recording {
            name,
            log: log.clone(),
            short_circuit: false,
        })
    }

    fn context() -> IncomingStepContext {
        IncomingStepContext::new(TransportMessage::new(Headers::new(), vec![]), TransactionContext::arc())
    }

    #[test]
    fn insertion_is_relative_to_anchor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline.append(step("retry", &log)).append(step("dispatch", &log));

        pipeline.insert_before("dispatch", step("locks", &log)).unwrap();
        pipeline.insert_after("retry", step("deserialize", &log)).unwrap();

        assert_eq!(pipeline.names(), vec!["retry", "deserialize", "locks", "dispatch"]);
        assert!(pipeline.insert_before("missing", step("x", &log)).is_err());

        assert!(pipeline.remove("locks"));
        assert!(!pipeline.contains("locks"));
    }

    #[tokio::test]
    async fn steps_wrap_each_other_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline.append(step("a", &log)).append(step("b", &log));

        pipeline.build().invoke(&mut context()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn a_step_can_stop_the_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline: Pipeline<dyn IncomingStep> = Pipeline::new();
        pipeline
            .append(Arc::new(Recording {
                name: "gate",
                log: log.clone(),
                short_circuit: true,
            }))
            .append(step("after", &log));

        pipeline.build().invoke(&mut context()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["enter gate", "exit gate"]);
    }
}
