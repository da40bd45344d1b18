//! Message broker abstraction.
//!
//! Components talk to each other only through named topics. A topic is
//! consumed by consumer groups: every group receives every message published
//! after it subscribed (fan-out across groups), while members of the same
//! group compete for messages (each message goes to exactly one member).
//!
//! Delivery is at-least-once. Consumers must tolerate duplicates.
//!
//! [`InMemoryBroker`] implements these semantics in process and is what the
//! CLI node and the test-suite run against.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Default number of buffered messages per consumer group.
pub const DEFAULT_GROUP_CAPACITY: usize = 1024;

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: u32 = 8;

/// Broker error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker (or the subscription) has been shut down.
    #[error("Broker closed")]
    Closed,

    /// Payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

/// A message as delivered to a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Broker-assigned message id
    pub id: String,
    /// Topic the message was published to
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// Partition derived from the key
    pub partition: u32,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Publish timestamp
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Publish/subscribe channel with consumer groups.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Broker name, for logs.
    fn name(&self) -> &str;

    /// Publish a payload to a topic.
    ///
    /// Returns once the broker has accepted the message. Fails with
    /// [`BrokerError::Unavailable`] when the broker cannot take it.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError>;

    /// Join a consumer group on a topic.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BrokerError>;
}

/// Shared broker handle.
pub type SharedBroker = Arc<dyn MessageBroker>;

/// Encode a value and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn MessageBroker,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<(), BrokerError> {
    let payload = serde_json::to_value(value)?;
    broker.publish(topic, key, payload).await
}

/// Membership of one consumer in a consumer group.
///
/// Cloning a subscription adds another competing member to the same group.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    group: String,
    rx: async_channel::Receiver<Envelope>,
}

impl Subscription {
    /// Create a subscription over a group queue.
    pub fn new(
        topic: impl Into<String>,
        group: impl Into<String>,
        rx: async_channel::Receiver<Envelope>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            rx,
        }
    }

    /// Topic this subscription reads.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the broker has been closed and the group queue is
    /// drained.
    pub async fn recv(&self) -> Option<Envelope> {
        self.rx.recv().await.ok()
    }

    /// Receive a message without waiting.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Number of messages waiting in the group queue.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

struct GroupQueue {
    tx: async_channel::Sender<Envelope>,
    rx: async_channel::Receiver<Envelope>,
}

/// In-process broker.
///
/// Messages published to a topic with no consumer group are dropped, so
/// consumers must subscribe before producers start publishing.
pub struct InMemoryBroker {
    name: String,
    partitions: u32,
    group_capacity: usize,
    topics: RwLock<HashMap<String, HashMap<String, GroupQueue>>>,
    available: AtomicBool,
    published: AtomicU64,
}

impl InMemoryBroker {
    /// Create a broker with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_GROUP_CAPACITY)
    }

    /// Create a broker buffering up to `group_capacity` messages per group.
    pub fn with_capacity(group_capacity: usize) -> Self {
        Self {
            name: "memory".to_string(),
            partitions: DEFAULT_PARTITIONS,
            group_capacity: group_capacity.max(1),
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Simulate the broker going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the broker currently accepts operations.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Total number of accepted publishes.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Close every group queue. Pending messages can still be drained.
    pub fn close(&self) {
        let topics = self.topics.read();
        for groups in topics.values() {
            for queue in groups.values() {
                queue.tx.close();
            }
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as u32
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<(), BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable(format!(
                "{} broker rejected publish to '{}'",
                self.name, topic
            )));
        }

        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            key: key.to_string(),
            partition: self.partition_for(key),
            payload,
            published_at: Utc::now(),
        };

        // Senders are cloned out so the lock is not held across awaits
        let senders: Vec<(String, async_channel::Sender<Envelope>)> = self
            .topics
            .read()
            .get(topic)
            .map(|groups| {
                groups
                    .iter()
                    .map(|(group, queue)| (group.clone(), queue.tx.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if senders.is_empty() {
            tracing::debug!(topic, key, "No consumer group on topic, message dropped");
        }

        for (group, tx) in senders {
            if tx.send(envelope.clone()).await.is_err() {
                tracing::warn!(topic, group = %group, "Consumer group queue closed");
            }
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BrokerError> {
        if !self.is_available() {
            return Err(BrokerError::Unavailable(format!(
                "{} broker rejected subscription to '{}'",
                self.name, topic
            )));
        }

        let mut topics = self.topics.write();
        let groups = topics.entry(topic.to_string()).or_default();
        let queue = groups.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = async_channel::bounded(self.group_capacity);
            GroupQueue { tx, rx }
        });
        if queue.tx.is_closed() {
            return Err(BrokerError::Closed);
        }

        tracing::debug!(topic, group, "Consumer joined group");
        Ok(Subscription::new(topic, group, queue.rx.clone()))
    }
}
