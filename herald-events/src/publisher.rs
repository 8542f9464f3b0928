//! Publishing integration events after local writes commit.

use std::fmt;
use std::sync::Arc;

use herald_broker::{BrokerClient, OutgoingMessage, RecordMetadata};
use herald_transaction::{ScopedBoxFuture, TransactionContext};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    EventError, HEADER_CORRELATION_ID, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_SOURCE,
    IntegrationEvent, Result,
};

/// An event waiting for its unit of work to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEvent {
    pub topic: String,
    pub key: Option<String>,
    pub event: IntegrationEvent,
}

/// The local writes and staged events of one use case.
///
/// Handed to the closure given to [`EventPublisher::execute`].
pub struct UnitOfWork {
    context: TransactionContext,
    staged: Vec<StagedEvent>,
    source: String,
}

impl UnitOfWork {
    fn new(source: &str) -> Self {
        Self {
            context: TransactionContext::new(),
            staged: Vec::new(),
            source: source.to_string(),
        }
    }

    /// Participants taking part in this unit.
    pub fn transaction(&mut self) -> &mut TransactionContext {
        &mut self.context
    }

    /// Build an event stamped with the publishing service.
    pub fn event(&self, event_type: impl Into<String>, payload: Value) -> IntegrationEvent {
        IntegrationEvent::new(event_type, payload, self.source.as_str())
    }

    /// Stage `event` for `topic`, keyed by its id.
    pub fn stage(&mut self, topic: impl Into<String>, event: IntegrationEvent) {
        self.staged.push(StagedEvent {
            topic: topic.into(),
            key: None,
            event,
        });
    }

    /// Stage `event` for `topic` under an explicit partitioning key.
    pub fn stage_keyed(
        &mut self,
        topic: impl Into<String>,
        key: impl Into<String>,
        event: IntegrationEvent,
    ) {
        self.staged.push(StagedEvent {
            topic: topic.into(),
            key: Some(key.into()),
            event,
        });
    }

    /// Events staged so far, in staging order.
    pub fn staged(&self) -> &[StagedEvent] {
        &self.staged
    }
}

/// Sends integration events through a shared broker client.
///
/// [`EventPublisher::execute`] is the publish-after-commit path: events
/// staged inside the unit are only sent once every participant committed,
/// and a failed send never undoes the local writes.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn BrokerClient>,
    source: String,
}

impl EventPublisher {
    /// Create a publisher that stamps events with `source`.
    pub fn new(broker: Arc<dyn BrokerClient>, source: impl Into<String>) -> Self {
        Self {
            broker,
            source: source.into(),
        }
    }

    /// Name of the producing service.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Build an event stamped with this publisher's source.
    pub fn event(&self, event_type: impl Into<String>, payload: Value) -> IntegrationEvent {
        IntegrationEvent::new(event_type, payload, self.source.as_str())
    }

    /// Send `event` to `topic`, keyed by the event id.
    pub async fn publish(&self, topic: &str, event: &IntegrationEvent) -> Result<RecordMetadata> {
        self.send(topic, None, event).await
    }

    /// Send `event` to `topic` keyed by `key`, typically the aggregate id, so
    /// every event of one entity lands on the same partition.
    pub async fn publish_keyed(
        &self,
        topic: &str,
        key: &str,
        event: &IntegrationEvent,
    ) -> Result<RecordMetadata> {
        self.send(topic, Some(key), event).await
    }

    /// Run a use case as one unit of work.
    ///
    /// `f` performs its writes through [`UnitOfWork::transaction`] and stages
    /// events. When it succeeds the participants are committed and disposed,
    /// then the staged events are sent in staging order. When `f` or the
    /// commit fails everything is rolled back and nothing is sent.
    ///
    /// A send failure after the commit is reported as
    /// [`EventError::EventDeliveryFailed`]; the events after the failed one
    /// are not attempted and their ids are listed in the error.
    ///
    /// ```rust,ignore
    /// let user_id = publisher
    ///     .execute(|uow| {
    ///         async move {
    ///             uow.transaction()
    ///                 .get_or_register(DOCUMENT_KEY, || DocumentParticipant::begin(&store))
    ///                 .await?
    ///                 .session_mut()
    ///                 .insert("users", "u-1", json!({"name": "Ada"}))?;
    ///
    ///             let event = uow.event("UserCreated", json!({"userId": "u-1"}));
    ///             uow.stage_keyed("user-events", "u-1", event);
    ///             Ok::<_, EventError>("u-1")
    ///         }
    ///         .scope_boxed()
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<'a, F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut UnitOfWork) -> ScopedBoxFuture<'a, 'c, std::result::Result<T, E>>
            + 'a,
        E: From<EventError> + fmt::Display,
    {
        let mut unit = UnitOfWork::new(&self.source);

        let outcome = match f(&mut unit).await {
            Ok(value) => match unit.context.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    error!(error = %e, "Unit of work commit failed, rolling back");
                    if let Err(e) = unit.context.rollback().await {
                        warn!(error = %e, "Rollback after failed commit also failed");
                    }
                    Err(E::from(EventError::TransactionFailed(e)))
                }
            },
            Err(e) => {
                debug!(
                    error = %e,
                    staged = unit.staged.len(),
                    "Use case failed, discarding staged events"
                );
                if let Err(e) = unit.context.rollback().await {
                    warn!(error = %e, "Rollback after failed use case also failed");
                }
                Err(e)
            }
        };

        if let Err(e) = unit.context.dispose().await {
            warn!(error = %e, "Failed to release transaction sessions");
        }

        let value = outcome?;
        self.flush(unit.staged).await.map_err(E::from)?;
        Ok(value)
    }

    async fn flush(&self, staged: Vec<StagedEvent>) -> Result<()> {
        let mut pending = staged.into_iter();
        while let Some(next) = pending.next() {
            match self.send(&next.topic, next.key.as_deref(), &next.event).await {
                Ok(_) => {}
                Err(EventError::EventDeliveryFailed { event_id, topic, source, .. }) => {
                    let unsent: Vec<String> = pending.map(|s| s.event.id().to_string()).collect();
                    error!(
                        event_id = %event_id,
                        topic = %topic,
                        unsent = unsent.len(),
                        error = %source,
                        "Event delivery failed after commit; local state kept"
                    );
                    return Err(EventError::EventDeliveryFailed {
                        event_id,
                        topic,
                        unsent,
                        source,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        event: &IntegrationEvent,
    ) -> Result<RecordMetadata> {
        let mut message = OutgoingMessage::new(event.to_json()?)
            .with_key(key.unwrap_or(event.id()))
            .with_header(HEADER_EVENT_ID, event.id())
            .with_header(HEADER_EVENT_TYPE, event.event_type())
            .with_header(HEADER_SOURCE, event.source());
        if let Some(correlation_id) = event.correlation_id() {
            message = message.with_header(HEADER_CORRELATION_ID, correlation_id);
        }

        match self.broker.send(topic, message).await {
            Ok(metadata) => {
                debug!(
                    topic,
                    event_id = event.id(),
                    event_type = event.event_type(),
                    correlation_id = ?event.correlation_id(),
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "Integration event published"
                );
                Ok(metadata)
            }
            Err(source) => Err(EventError::EventDeliveryFailed {
                event_id: event.id().to_string(),
                topic: topic.to_string(),
                unsent: Vec::new(),
                source,
            }),
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("source", &self.source)
            .field("connected", &self.broker.is_connected())
            .finish()
    }
}
