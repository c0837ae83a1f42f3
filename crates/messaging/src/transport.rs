//! Transport abstraction (mechanics only).
//!
//! A transport moves [`TransportMessage`]s between named queues. It is the only
//! component that talks to a broker; everything else in the runtime goes through
//! this trait.
//!
//! ## Delivery contract
//!
//! - `send` must not deliver immediately. It enlists the delivery in the given
//!   [`TransactionContext`] so the message leaves only if the unit of work commits.
//! - `receive` hands out one message and enlists its acknowledgement in the context:
//!   commit removes it for good, abort makes it visible again (redelivery).
//! - `receive` returning `Ok(None)` means "nothing right now", never an error.
//!
//! This gives **at-least-once** delivery. Handlers must tolerate duplicates.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_core::{BusResult, TransportMessage};

use crate::transaction::TransactionContext;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Input queue of this endpoint, or `None` for a send-only client.
    fn address(&self) -> Option<&str>;

    /// Create a queue if it does not exist (idempotent).
    async fn create_queue(&self, address: &str) -> BusResult<()>;

    /// Enlist a send of `message` to `destination` in the transaction.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        transaction: &TransactionContext,
    ) -> BusResult<()>;

    /// Take the next message from the input queue, if any.
    ///
    /// Implementations that block on the broker must return promptly once
    /// `cancel` fires.
    async fn receive(
        &self,
        transaction: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn address(&self) -> Option<&str> {
        (**self).address()
    }

    async fn create_queue(&self, address: &str) -> BusResult<()> {
        (**self).create_queue(address).await
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        transaction: &TransactionContext,
    ) -> BusResult<()> {
        (**self).send(destination, message, transaction).await
    }

    async fn receive(
        &self,
        transaction: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>> {
        (**self).receive(transaction, cancel).await
    }
}
