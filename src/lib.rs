// Herald - integration events for Rust services
//
// Commit local state across several stores, publish the matching event only
// after the commit, and consume events exactly once on top of an
// at-least-once broker.

// Re-export core functionality
pub use herald_broker::*;
pub use herald_events::{
    DeadLetterPolicy, DedupLedger, DedupRecord, Dispatch, EventError, EventListener,
    EventPublisher, EventRouter, EventRouterBuilder, EventStats, EventTracker, FnEventHandler,
    HEADER_CORRELATION_ID, HEADER_DEAD_LETTER_REASON, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_ORIGINAL_TOPIC, HEADER_SOURCE, HandlerError, InMemoryDedupLedger, InMemoryOutbox,
    IntegrationEvent, IntegrationEventHandler, LedgerError, METADATA_CAUSATION_ID,
    METADATA_CORRELATION_ID, OUTBOX_KEY, OutboxParticipant, OutboxRecord, OutboxRelay,
    OutboxStore, RelayReport, StagedEvent, StatsSummary, UnitOfWork,
};
pub use herald_transaction::{
    ContextState, DOCUMENT_KEY, DocumentClient, DocumentParticipant, DocumentSession,
    InMemoryDocumentSession, InMemoryDocumentStore, InMemoryKeyValueStore, InMemoryPipeline,
    KEY_VALUE_KEY, KeyValueParticipant, KeyValuePipeline, ParticipantState, ScopedBoxFuture,
    ScopedFutureExt, TransactionContext, TransactionError, TransactionParticipant,
};

// Re-export member crates
pub use herald_broker;
pub use herald_events;
pub use herald_transaction;

#[cfg(feature = "config")]
pub use herald_config;

#[cfg(feature = "log")]
pub use herald_log;

#[cfg(feature = "redis")]
pub use herald_redis;

// Prelude for common imports
pub mod prelude {
    pub use herald_broker::prelude::*;
    pub use herald_events::prelude::*;

    #[cfg(feature = "redis")]
    pub use herald_redis::prelude::*;
}
