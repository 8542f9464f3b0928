//! # Herald Broker
//!
//! Event broker client for Herald services.
//!
//! This crate provides the connection lifecycle, retrying sends and
//! partition-ordered consumers that the event pipeline is built on:
//! - **InMemoryBroker** - Process-local partitioned broker for development and tests
//! - **Kafka** - Apache Kafka via `rdkafka`
//! - **ResilientBroker** - Retry/timeout layer over any backend
//!
//! ## Features
//!
//! - `kafka` - Apache Kafka support
//! - `full` - All backends
//!
//! ## Example
//!
//! ```rust,ignore
//! use herald_broker::{Acknowledgement, BrokerClient, BrokerMessage, FnHandler, InMemoryBroker};
//!
//! let broker = InMemoryBroker::new();
//! broker.connect().await?;
//!
//! let handler = FnHandler(|message: BrokerMessage| async move {
//!     println!("offset {}: {} bytes", message.offset, message.value.len());
//!     Ok(Acknowledgement::Ack)
//! });
//!
//! let subscription = broker.subscribe("user-events", "notifications", Arc::new(handler)).await?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub mod config;
pub mod error;
pub mod memory;
pub mod resilient;
pub mod retry;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use config::*;
pub use error::*;
pub use memory::InMemoryBroker;
pub use resilient::ResilientBroker;
pub use retry::RetryPolicy;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;

/// A record delivered by the broker.
///
/// Partition and offset are assigned by the broker; offsets increase
/// monotonically within a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Topic the record was read from
    pub topic: String,
    /// Partition the record was read from
    pub partition: i32,
    /// Position within the partition
    pub offset: i64,
    /// Partitioning key
    pub key: Option<String>,
    /// Raw payload
    pub value: Vec<u8>,
    /// Broker (or producer) timestamp
    pub timestamp: DateTime<Utc>,
    /// Record headers
    pub headers: HashMap<String, String>,
}

impl BrokerMessage {
    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Get the payload as a UTF-8 string
    pub fn value_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{} ({} bytes)",
            self.topic,
            self.partition,
            self.offset,
            self.value.len()
        )
    }
}

/// A record to be sent to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Partitioning key; records with the same key land on the same partition
    pub key: Option<String>,
    /// Raw payload
    pub value: Vec<u8>,
    /// Record headers
    pub headers: HashMap<String, String>,
    /// Producer timestamp
    pub timestamp: DateTime<Utc>,
}

impl OutgoingMessage {
    /// Create a new message with the given payload
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message from a JSON-serializable value
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BrokerError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        Ok(Self::new(payload).with_header("content_type", "application/json"))
    }

    /// Set the partitioning key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Where a sent record was stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub partition: i32,
    pub offset: i64,
}

/// Handler decision for a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processed; commit the offset
    Ack,
    /// Not processed; leave uncommitted and redeliver after the redelivery delay
    Nack,
}

/// Trait for handling delivered messages.
///
/// An `Err` is treated as [`Acknowledgement::Nack`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a delivered message
    async fn handle(&self, message: &BrokerMessage) -> Result<Acknowledgement, BrokerError>;
}

/// Function-based message handler
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Acknowledgement, BrokerError>> + Send,
{
    async fn handle(&self, message: &BrokerMessage) -> Result<Acknowledgement, BrokerError> {
        (self.0)(message.clone()).await
    }
}

/// Resolve a handler result into the acknowledgement the consumer loop acts on.
pub(crate) async fn dispatch(
    handler: &dyn MessageHandler,
    message: &BrokerMessage,
) -> Acknowledgement {
    match handler.handle(message).await {
        Ok(ack) => ack,
        Err(e) => {
            tracing::error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Message handler error"
            );
            Acknowledgement::Nack
        }
    }
}

/// Claim on a (topic, group) pair.
///
/// The handle and every consumer task share one lease; the pair becomes
/// free again only when the last of them is gone.
pub(crate) struct GroupLease {
    groups: Arc<DashSet<(String, String)>>,
    key: (String, String),
}

impl GroupLease {
    pub(crate) fn acquire(
        groups: &Arc<DashSet<(String, String)>>,
        topic: &str,
        group: &str,
    ) -> Result<Arc<Self>, BrokerError> {
        let key = (topic.to_string(), group.to_string());
        if !groups.insert(key.clone()) {
            return Err(BrokerError::AlreadySubscribed {
                topic: topic.to_string(),
                group: group.to_string(),
            });
        }
        Ok(Arc::new(Self {
            groups: groups.clone(),
            key,
        }))
    }
}

impl Drop for GroupLease {
    fn drop(&mut self) {
        self.groups.remove(&self.key);
        debug!(topic = %self.key.0, group = %self.key.1, "Consumer group released");
    }
}

/// Stop signal for a consumer task: either its subscription or the whole
/// broker is shutting down.
pub(crate) struct Stop {
    subscription: watch::Receiver<bool>,
    broker: watch::Receiver<bool>,
}

impl Stop {
    pub(crate) fn new(subscription: watch::Receiver<bool>, broker: watch::Receiver<bool>) -> Self {
        Self {
            subscription,
            broker,
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.subscription.borrow() || *self.broker.borrow()
    }

    /// Resolves once a stop is requested or either sender is gone.
    pub(crate) async fn wait(&mut self) {
        loop {
            tokio::select! {
                changed = self.subscription.changed() => {
                    if changed.is_err() || *self.subscription.borrow() {
                        return;
                    }
                }
                changed = self.broker.changed() => {
                    if changed.is_err() || *self.broker.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Sleep for `delay`; returns `true` if a stop arrived first.
    pub(crate) async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.wait() => true,
        }
    }
}

/// Handle for a running (topic, group) consumer.
///
/// Dropping the handle signals the consumer to stop without waiting;
/// the pair stays claimed until the in-flight message has finished.
/// [`Subscription::unsubscribe`] waits for that.
pub struct Subscription {
    lease: Arc<GroupLease>,
    active: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(lease: Arc<GroupLease>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            lease,
            active: Arc::new(AtomicBool::new(true)),
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Receiver that flips to `true` when the subscription stops
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Lease shared with a consumer task
    pub(crate) fn lease(&self) -> Arc<GroupLease> {
        self.lease.clone()
    }

    pub(crate) fn push_worker(&mut self, worker: JoinHandle<()>) {
        self.workers.push(worker);
    }

    /// Get the topic name
    pub fn topic(&self) -> &str {
        &self.lease.key.0
    }

    /// Get the consumer group
    pub fn group(&self) -> &str {
        &self.lease.key.1
    }

    /// Check if the subscription is active
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the consumer and wait for in-flight messages to finish.
    pub async fn unsubscribe(mut self) -> Result<(), BrokerError> {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);

        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await
                && e.is_panic()
            {
                tracing::error!(
                    topic = %self.topic(),
                    group = %self.group(),
                    "Consumer task panicked"
                );
            }
        }

        debug!(topic = %self.topic(), group = %self.group(), "Unsubscribed");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic())
            .field("group", &self.group())
            .field("active", &self.is_active())
            .field("workers", &self.workers.len())
            .finish()
    }
}

/// Core trait for broker clients.
///
/// Clients are shared process-wide behind an `Arc`; every method takes
/// `&self`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Establish the connection
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), BrokerError>;

    /// Send a record to a topic
    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError>;

    /// Start one logical consumer for (topic, group).
    ///
    /// Records are delivered in order within a partition; different
    /// partitions may be delivered concurrently.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError>;

    /// Check if connected to the broker
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<B: BrokerClient + ?Sized> BrokerClient for Arc<B> {
    async fn connect(&self) -> Result<(), BrokerError> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        (**self).disconnect().await
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError> {
        (**self).send(topic, message).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        (**self).subscribe(topic, group, handler).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{BrokerConfig, Credentials, TlsConfig};
    pub use crate::error::BrokerError;
    pub use crate::memory::InMemoryBroker;
    pub use crate::resilient::ResilientBroker;
    pub use crate::retry::RetryPolicy;
    pub use crate::{
        Acknowledgement, BrokerClient, BrokerMessage, FnHandler, MessageHandler, OutgoingMessage,
        RecordMetadata, Subscription,
    };

    #[cfg(feature = "kafka")]
    pub use crate::kafka::KafkaBroker;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_json() {
        let msg = OutgoingMessage::json(&serde_json::json!({"id": "evt-1"}))
            .unwrap()
            .with_key("user-1");

        assert_eq!(msg.key.as_deref(), Some("user-1"));
        assert_eq!(msg.headers.get("content_type").map(String::as_str), Some("application/json"));
        assert_eq!(msg.value, br#"{"id":"evt-1"}"#);
    }

    #[test]
    fn test_broker_message_display() {
        let msg = BrokerMessage {
            topic: "user-events".into(),
            partition: 2,
            offset: 41,
            key: None,
            value: vec![0; 10],
            timestamp: Utc::now(),
            headers: HashMap::new(),
        };

        assert_eq!(msg.to_string(), "user-events[2]@41 (10 bytes)");
        assert_eq!(msg.header("event_id"), None);
    }

    #[tokio::test]
    async fn test_fn_handler_error_becomes_nack() {
        let handler = FnHandler(|_msg: BrokerMessage| async {
            Err::<Acknowledgement, _>(BrokerError::Other("boom".into()))
        });
        let msg = BrokerMessage {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: None,
            value: Vec::new(),
            timestamp: Utc::now(),
            headers: HashMap::new(),
        };

        assert_eq!(dispatch(&handler, &msg).await, Acknowledgement::Nack);
    }

    #[test]
    fn test_group_lease_released_with_last_holder() {
        let groups = Arc::new(DashSet::new());
        let lease = GroupLease::acquire(&groups, "t", "g").unwrap();
        let held_by_task = lease.clone();

        assert!(matches!(
            GroupLease::acquire(&groups, "t", "g"),
            Err(BrokerError::AlreadySubscribed { .. })
        ));

        drop(lease);
        assert!(groups.contains(&("t".to_string(), "g".to_string())));

        drop(held_by_task);
        assert!(groups.is_empty());
        assert!(GroupLease::acquire(&groups, "t", "g").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let (subscription, subscription_rx) = watch::channel(false);
        let (_broker, broker_rx) = watch::channel(false);
        let mut stop = Stop::new(subscription_rx, broker_rx);

        assert!(!stop.sleep(Duration::from_millis(10)).await);

        let sleeping = tokio::spawn(async move { stop.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        subscription.send_replace(true);

        assert!(sleeping.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_set_when_broker_closes() {
        let (_subscription, subscription_rx) = watch::channel(false);
        let (broker, broker_rx) = watch::channel(false);
        let mut stop = Stop::new(subscription_rx, broker_rx);
        assert!(!stop.is_set());

        broker.send_replace(true);
        assert!(stop.is_set());
        assert!(stop.sleep(Duration::from_secs(3600)).await);
    }
}
