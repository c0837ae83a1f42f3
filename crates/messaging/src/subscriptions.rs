//! Topic subscriptions used by `publish`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use courier_core::BusResult;

/// Storage of `topic → subscriber input queues`.
#[async_trait]
pub trait SubscriptionStorage: Send + Sync {
    async fn subscriber_addresses(&self, topic: &str) -> BusResult<Vec<String>>;

    async fn register_subscriber(&self, topic: &str, address: &str) -> BusResult<()>;

    async fn unregister_subscriber(&self, topic: &str, address: &str) -> BusResult<()>;
}

/// Process-wide subscription storage. Clones share the same registrations, so one
/// instance can act as centralized storage for several in-process buses.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionStorage {
    topics: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl InMemorySubscriptionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStorage for InMemorySubscriptionStorage {
    async fn subscriber_addresses(&self, topic: &str) -> BusResult<Vec<String>> {
        let topics = self.topics.read().await;
        Ok(topics
            .get(topic)
            .map(|subs| subs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn register_subscriber(&self, topic: &str, address: &str) -> BusResult<()> {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(address.to_string());
        Ok(())
    }

    async fn unregister_subscriber(&self, topic: &str, address: &str) -> BusResult<()> {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(address);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }
}
