//! Error types for publishing and consuming integration events.

use herald_broker::BrokerError;
use herald_transaction::TransactionError;
use thiserror::Error;

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Event pipeline errors.
#[derive(Error, Debug)]
pub enum EventError {
    /// The message could not be decoded into an event. Never retried.
    #[error("Invalid event payload: {0}")]
    InvalidEventPayload(String),

    /// No handler is registered for the event type.
    #[error("No handler registered for event type '{event_type}'")]
    UnregisteredEventType { event_type: String },

    /// A second handler was registered for an event type.
    #[error("Event type '{event_type}' is already handled by '{existing}'")]
    DuplicateHandler { event_type: String, existing: String },

    /// The local writes of a unit of work did not commit.
    #[error("Transaction failed: {0}")]
    TransactionFailed(#[from] TransactionError),

    /// The local writes committed but an event could not be sent.
    ///
    /// `unsent` holds the ids of the staged events that followed the failed
    /// one and were not attempted.
    #[error("Event '{event_id}' could not be delivered to '{topic}': {source}")]
    EventDeliveryFailed {
        event_id: String,
        topic: String,
        unsent: Vec<String>,
        #[source]
        source: BrokerError,
    },

    /// Broker operation outside of event delivery (connect, subscribe).
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Dedup ledger failure.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl EventError {
    /// Check if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EventError::EventDeliveryFailed { source, .. } | EventError::Broker(source) => {
                source.is_transient() || matches!(source, BrokerError::Unavailable { .. })
            }
            EventError::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Failure reported by an integration event handler.
///
/// Any handler error leaves the message unacknowledged so the broker
/// redelivers it.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler could not complete.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The event payload did not match what the handler expects.
    #[error("Unexpected payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler's own unit of work failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The handler's own publish failed.
    #[error(transparent)]
    Event(#[from] Box<EventError>),
}

impl HandlerError {
    /// Create a generic handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<EventError> for HandlerError {
    fn from(e: EventError) -> Self {
        Self::Event(Box::new(e))
    }
}

/// Dedup ledger errors.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The backing store could not be reached.
    #[error("Ledger store unavailable: {0}")]
    Unavailable(String),

    /// A stored record could not be encoded or decoded.
    #[error("Ledger serialization error: {0}")]
    Serialization(String),

    /// Any other store failure.
    #[error("Ledger error: {0}")]
    Other(String),
}

impl LedgerError {
    /// Check if the error may clear on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }
}
