//! Consuming integration events: decode, route, deduplicate, acknowledge.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use herald_broker::{
    Acknowledgement, BrokerClient, BrokerError, BrokerMessage, MessageHandler, OutgoingMessage,
    Subscription,
};
use tracing::{debug, error, info, warn};

use crate::{
    DedupLedger, DedupRecord, EventError, EventRouter, EventStats, EventTracker, HEADER_EVENT_ID,
    HEADER_EVENT_TYPE, IntegrationEvent, Result,
};

/// Header naming the topic a dead-lettered message was read from.
pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";

/// Header carrying why a message was dead-lettered.
pub const HEADER_DEAD_LETTER_REASON: &str = "dead_letter_reason";

/// Event type counted for payloads that carry none.
const UNKNOWN_EVENT_TYPE: &str = "unknown";

/// What happens to a message whose handler keeps failing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeadLetterPolicy {
    /// Leave it unacknowledged forever; the broker keeps redelivering.
    #[default]
    Unbounded,
    /// After `max_deliveries` failed deliveries forward the raw message to
    /// `<topic><suffix>` and acknowledge it. Malformed payloads are
    /// forwarded on first sight.
    Topic { max_deliveries: u32, suffix: String },
}

impl DeadLetterPolicy {
    /// Forward to `<topic>.dlq` after `max_deliveries` failures.
    pub fn topic(max_deliveries: u32) -> Self {
        Self::Topic {
            max_deliveries: max_deliveries.max(1),
            suffix: ".dlq".to_string(),
        }
    }

    /// Dead-letter topic for `topic`, if the policy has one.
    pub fn dead_letter_topic(&self, topic: &str) -> Option<String> {
        match self {
            DeadLetterPolicy::Unbounded => None,
            DeadLetterPolicy::Topic { suffix, .. } => Some(format!("{topic}{suffix}")),
        }
    }
}

/// How a delivered message was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The handler ran and the dedup record was written.
    Handled { handler: String },
    /// The (message, handler) pair was already recorded; the handler was skipped.
    Duplicate { handler: String },
    /// No handler for the event type.
    Unrouted { event_type: String },
    /// The payload was not an event.
    Invalid { reason: String },
    /// Forwarded to a dead-letter topic.
    DeadLettered { topic: String },
    /// The handler, the ledger or the dead-letter send failed.
    Failed { reason: String },
}

impl Dispatch {
    /// Acknowledgement the consumer loop acts on.
    pub fn acknowledgement(&self) -> Acknowledgement {
        match self {
            Dispatch::Failed { .. } => Acknowledgement::Nack,
            _ => Acknowledgement::Ack,
        }
    }

    /// Whether the outcome counts as a success or a failure in
    /// [`EventStats`]; `None` for events no handler is registered for.
    pub fn succeeded(&self) -> Option<bool> {
        match self {
            Dispatch::Handled { .. } | Dispatch::Duplicate { .. } => Some(true),
            Dispatch::Invalid { .. } | Dispatch::DeadLettered { .. } | Dispatch::Failed { .. } => {
                Some(false)
            }
            Dispatch::Unrouted { .. } => None,
        }
    }
}

struct ListenerInner {
    broker: Arc<dyn BrokerClient>,
    router: EventRouter,
    ledger: Arc<dyn DedupLedger>,
    dead_letter: DeadLetterPolicy,
    // Failed deliveries per (topic, message id), cleared on success.
    deliveries: DashMap<(String, String), u32>,
    stats: Arc<EventTracker>,
}

/// Broker [`MessageHandler`] that routes integration events to their
/// handlers at most once per (message id, handler name).
///
/// The ledger is checked before the handler runs and written after it
/// succeeds; only then is the message acknowledged. A handler error leaves
/// the message unacknowledged so the broker redelivers it.
#[derive(Clone)]
pub struct EventListener {
    inner: Arc<ListenerInner>,
}

impl EventListener {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        router: EventRouter,
        ledger: Arc<dyn DedupLedger>,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                broker,
                router,
                ledger,
                dead_letter: DeadLetterPolicy::default(),
                deliveries: DashMap::new(),
                stats: Arc::new(EventTracker::new()),
            }),
        }
    }

    /// Set the dead-letter policy.
    pub fn with_dead_letter(self, policy: DeadLetterPolicy) -> Self {
        self.rebuild(|inner| inner.dead_letter = policy)
    }

    /// Count into a tracker shared with other listeners of the service.
    pub fn with_tracker(self, tracker: Arc<EventTracker>) -> Self {
        self.rebuild(|inner| inner.stats = tracker)
    }

    fn rebuild(self, update: impl FnOnce(&mut ListenerInner)) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => ListenerInner {
                broker: shared.broker.clone(),
                router: shared.router.clone(),
                ledger: shared.ledger.clone(),
                dead_letter: shared.dead_letter.clone(),
                deliveries: DashMap::new(),
                stats: shared.stats.clone(),
            },
        };
        update(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub fn dead_letter_policy(&self) -> &DeadLetterPolicy {
        &self.inner.dead_letter
    }

    /// Counters of this listener's deliveries.
    pub fn tracker(&self) -> &Arc<EventTracker> {
        &self.inner.stats
    }

    /// Tracked (topic, event type) counters, ordered by event type.
    pub fn stats(&self) -> Vec<EventStats> {
        self.inner.stats.snapshot()
    }

    /// Start consuming `topic` as consumer group `group`.
    pub async fn listen(&self, topic: &str, group: &str) -> Result<Subscription> {
        let subscription = self
            .inner
            .broker
            .subscribe(topic, group, Arc::new(self.clone()))
            .await?;
        for event_type in self.inner.router.event_types() {
            self.inner.stats.initialize(topic, event_type);
        }
        info!(
            topic,
            group,
            event_types = ?self.inner.router.event_types(),
            "Integration event listener started"
        );
        Ok(subscription)
    }

    /// Resolve one delivered message and count the outcome.
    pub async fn dispatch(&self, message: &BrokerMessage) -> Dispatch {
        let (event_type, dispatch) = match IntegrationEvent::from_slice(&message.value) {
            Ok(event) => {
                let dispatch = self.deliver(message, &event).await;
                (event.event_type().to_string(), dispatch)
            }
            Err(e) => {
                let event_type = message.header(HEADER_EVENT_TYPE).unwrap_or(UNKNOWN_EVENT_TYPE);
                (event_type.to_string(), self.reject(message, e).await)
            }
        };

        if let Some(success) = dispatch.succeeded() {
            self.inner.stats.record(&message.topic, &event_type, success);
        }
        dispatch
    }

    async fn deliver(&self, message: &BrokerMessage, event: &IntegrationEvent) -> Dispatch {
        let handler = match self.inner.router.resolve(event.event_type()) {
            Ok(handler) => handler.clone(),
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    event_id = event.id(),
                    error = %e,
                    "Skipping integration event"
                );
                return Dispatch::Unrouted {
                    event_type: event.event_type().to_string(),
                };
            }
        };

        let message_id = event.id();
        let handler_name = handler.name().to_string();

        match self.inner.ledger.contains(message_id, &handler_name).await {
            Ok(true) => {
                debug!(
                    topic = %message.topic,
                    event_id = message_id,
                    handler = %handler_name,
                    "Duplicate integration event, skipping"
                );
                return Dispatch::Duplicate { handler: handler_name };
            }
            Ok(false) => {}
            Err(e) => {
                error!(
                    event_id = message_id,
                    handler = %handler_name,
                    error = %e,
                    "Dedup lookup failed"
                );
                return Dispatch::Failed { reason: e.to_string() };
            }
        }

        if let Err(e) = handler.handle(event, message_id).await {
            error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                event_id = message_id,
                event_type = event.event_type(),
                correlation_id = ?event.correlation_id(),
                handler = %handler_name,
                error = %e,
                "Integration event handler failed"
            );
            return self.on_handler_failure(message, message_id, e.to_string()).await;
        }

        self.inner
            .deliveries
            .remove(&(message.topic.clone(), message_id.to_string()));

        match self
            .inner
            .ledger
            .record(DedupRecord::new(message_id, handler_name.as_str()))
            .await
        {
            Ok(inserted) => {
                if !inserted {
                    debug!(
                        event_id = message_id,
                        handler = %handler_name,
                        "Dedup record already present"
                    );
                }
                debug!(
                    topic = %message.topic,
                    event_id = message_id,
                    event_type = event.event_type(),
                    handler = %handler_name,
                    "Integration event handled"
                );
                Dispatch::Handled { handler: handler_name }
            }
            Err(e) => {
                error!(
                    event_id = message_id,
                    handler = %handler_name,
                    error = %e,
                    "Dedup record write failed after handler success; message will be redelivered"
                );
                Dispatch::Failed { reason: e.to_string() }
            }
        }
    }

    /// Number of failed deliveries counted for a message.
    pub fn failed_deliveries(&self, topic: &str, message_id: &str) -> u32 {
        self.inner
            .deliveries
            .get(&(topic.to_string(), message_id.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    async fn reject(&self, message: &BrokerMessage, err: EventError) -> Dispatch {
        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            event_id = message.header(HEADER_EVENT_ID).unwrap_or("unknown"),
            error = %err,
            "Dropping malformed integration event"
        );

        let reason = err.to_string();
        match self.inner.dead_letter.dead_letter_topic(&message.topic) {
            Some(topic) => self.forward(message, &topic, &reason).await,
            None => Dispatch::Invalid { reason },
        }
    }

    async fn on_handler_failure(
        &self,
        message: &BrokerMessage,
        message_id: &str,
        reason: String,
    ) -> Dispatch {
        let DeadLetterPolicy::Topic { max_deliveries, .. } = &self.inner.dead_letter else {
            return Dispatch::Failed { reason };
        };

        let key = (message.topic.clone(), message_id.to_string());
        let failures = {
            let mut count = self.inner.deliveries.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if failures < *max_deliveries {
            return Dispatch::Failed { reason };
        }

        let Some(topic) = self.inner.dead_letter.dead_letter_topic(&message.topic) else {
            return Dispatch::Failed { reason };
        };
        let dispatch = self.forward(message, &topic, &reason).await;
        if matches!(dispatch, Dispatch::DeadLettered { .. }) {
            self.inner.deliveries.remove(&key);
        }
        dispatch
    }

    async fn forward(&self, message: &BrokerMessage, topic: &str, reason: &str) -> Dispatch {
        let mut outgoing = OutgoingMessage::new(message.value.clone());
        for (name, value) in &message.headers {
            outgoing = outgoing.with_header(name.as_str(), value.as_str());
        }
        outgoing = outgoing
            .with_header(HEADER_ORIGINAL_TOPIC, message.topic.as_str())
            .with_header(HEADER_DEAD_LETTER_REASON, reason);
        if let Some(key) = &message.key {
            outgoing = outgoing.with_key(key.as_str());
        }

        match self.inner.broker.send(topic, outgoing).await {
            Ok(_) => {
                warn!(
                    from = %message.topic,
                    to = topic,
                    offset = message.offset,
                    reason,
                    "Message dead-lettered"
                );
                Dispatch::DeadLettered {
                    topic: topic.to_string(),
                }
            }
            Err(e) => {
                error!(to = topic, error = %e, "Dead-letter send failed");
                Dispatch::Failed { reason: e.to_string() }
            }
        }
    }
}

#[async_trait]
impl MessageHandler for EventListener {
    async fn handle(
        &self,
        message: &BrokerMessage,
    ) -> std::result::Result<Acknowledgement, BrokerError> {
        Ok(self.dispatch(message).await.acknowledgement())
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("router", &self.inner.router)
            .field("dead_letter", &self.inner.dead_letter)
            .finish()
    }
}
