//! In-memory transport for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use courier_core::{BusError, BusResult, TransportMessage};

use crate::transaction::TransactionContext;
use crate::transport::Transport;

/// A set of named FIFO queues shared by any number of [`InMemTransport`]s.
///
/// - No IO
/// - Cloning shares the same queues
/// - A message taken by `receive` is pushed back to the front of its queue when the
///   receiving transaction aborts
#[derive(Debug, Clone, Default)]
pub struct InMemNetwork {
    queues: Arc<Mutex<HashMap<String, VecDeque<TransportMessage>>>>,
}

impl InMemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, VecDeque<TransportMessage>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_queue(&self, address: &str) {
        self.queues().entry(address.to_string()).or_default();
    }

    pub fn has_queue(&self, address: &str) -> bool {
        self.queues().contains_key(address)
    }

    /// Append a message to a queue. The queue must exist.
    pub fn deliver(&self, address: &str, message: TransportMessage) -> BusResult<()> {
        let mut queues = self.queues();
        let queue = queues
            .get_mut(address)
            .ok_or_else(|| BusError::transport(format!("destination queue '{address}' does not exist")))?;
        queue.push_back(message);
        Ok(())
    }

    /// Take the message at the head of a queue.
    pub fn take_next(&self, address: &str) -> Option<TransportMessage> {
        self.queues().get_mut(address)?.pop_front()
    }

    /// Put a message back at the head of a queue.
    pub fn requeue(&self, address: &str, message: TransportMessage) {
        self.queues()
            .entry(address.to_string())
            .or_default()
            .push_front(message);
    }

    /// Number of messages waiting in a queue (zero for unknown queues).
    pub fn count(&self, address: &str) -> usize {
        self.queues().get(address).map_or(0, VecDeque::len)
    }

    /// Snapshot of a queue's contents, head first.
    pub fn messages(&self, address: &str) -> Vec<TransportMessage> {
        self.queues()
            .get(address)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Transport bound to one input queue of an [`InMemNetwork`].
#[derive(Debug, Clone)]
pub struct InMemTransport {
    network: InMemNetwork,
    address: Option<String>,
}

impl InMemTransport {
    /// Transport that receives from `address` (the queue is created immediately).
    pub fn new(network: InMemNetwork, address: impl Into<String>) -> Self {
        let address = address.into();
        network.create_queue(&address);
        Self {
            network,
            address: Some(address),
        }
    }

    /// Send-only transport with no input queue.
    pub fn one_way_client(network: InMemNetwork) -> Self {
        Self {
            network,
            address: None,
        }
    }

    pub fn network(&self) -> &InMemNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemTransport {
    fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    async fn create_queue(&self, address: &str) -> BusResult<()> {
        self.network.create_queue(address);
        Ok(())
    }

    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        transaction: &TransactionContext,
    ) -> BusResult<()> {
        let network = self.network.clone();
        let destination = destination.to_string();
        transaction.on_committed(move || async move { network.deliver(&destination, message) });
        Ok(())
    }

    async fn receive(
        &self,
        transaction: &TransactionContext,
        cancel: &CancellationToken,
    ) -> BusResult<Option<TransportMessage>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let address = self
            .address
            .as_deref()
            .ok_or_else(|| BusError::transport("one-way client transport cannot receive"))?;

        let Some(message) = self.network.take_next(address) else {
            return Ok(None);
        };

        trace!(queue = address, message_id = ?message.message_id(), "received message");

        let network = self.network.clone();
        let address = address.to_string();
        let requeued = message.clone();
        transaction.on_aborted(move || async move {
            network.requeue(&address, requeued);
        });

        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{Headers, headers};

    use super::*;

    fn msg(id: &str) -> TransportMessage {
        TransportMessage::new(Headers::new(), b"{}".to_vec()).with_header(headers::MESSAGE_ID, id)
    }

    #[tokio::test]
    async fn send_is_delivered_only_on_commit() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network.clone(), "input");
        network.create_queue("orders");

        let tx = TransactionContext::new();
        transport.send("orders", msg("m-1"), &tx).await.unwrap();
        assert_eq!(network.count("orders"), 0);

        tx.commit().await.unwrap();
        assert_eq!(network.count("orders"), 1);
    }

    #[tokio::test]
    async fn aborted_send_is_discarded() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network.clone(), "input");
        network.create_queue("orders");

        let tx = TransactionContext::new();
        transport.send("orders", msg("m-1"), &tx).await.unwrap();
        tx.abort().await;

        assert_eq!(network.count("orders"), 0);
    }

    #[tokio::test]
    async fn aborted_receive_makes_message_visible_again() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network.clone(), "input");
        network.deliver("input", msg("m-1")).unwrap();
        network.deliver("input", msg("m-2")).unwrap();

        let cancel = CancellationToken::new();
        let tx = TransactionContext::new();
        let received = transport.receive(&tx, &cancel).await.unwrap().unwrap();
        assert_eq!(received.header(headers::MESSAGE_ID), Some("m-1"));
        assert_eq!(network.count("input"), 1);

        tx.abort().await;

        let ids: Vec<_> = network
            .messages("input")
            .iter()
            .map(|m| m.header(headers::MESSAGE_ID).unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
    }

    #[tokio::test]
    async fn committed_receive_removes_message() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::new(network.clone(), "input");
        network.deliver("input", msg("m-1")).unwrap();

        let tx = TransactionContext::new();
        let cancel = CancellationToken::new();
        assert!(transport.receive(&tx, &cancel).await.unwrap().is_some());
        tx.commit().await.unwrap();

        assert_eq!(network.count("input"), 0);
        assert!(transport.receive(&TransactionContext::new(), &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivery_to_unknown_queue_fails_commit() {
        let network = InMemNetwork::new();
        let transport = InMemTransport::one_way_client(network.clone());

        let tx = TransactionContext::new();
        transport.send("nowhere", msg("m-1"), &tx).await.unwrap();
        assert!(tx.commit().await.is_err());
    }
}
