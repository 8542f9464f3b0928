//! # Herald Events
//!
//! Integration events between services, on top of `herald-broker` and
//! `herald-transaction`.
//!
//! ## Features
//!
//! - **Publish after commit** - [`EventPublisher::execute`] runs a use case
//!   as a unit of work and only sends its staged events once every
//!   participant committed
//! - **Routing** - [`EventRouter`] maps each event type to exactly one
//!   [`IntegrationEventHandler`], fixed at startup
//! - **Idempotent consumption** - [`EventListener`] consults a
//!   [`DedupLedger`] before running a handler and records the message after
//!   it succeeds
//! - **Dead letters** - optional [`DeadLetterPolicy`] for messages that keep
//!   failing
//! - **Outbox** - [`OutboxParticipant`] and [`OutboxRelay`] for events that
//!   must survive a crash between commit and send
//! - **Stats** - [`EventTracker`] counts successes and failures per
//!   (topic, event type)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use herald_events::prelude::*;
//!
//! let broker: Arc<dyn BrokerClient> = Arc::new(InMemoryBroker::new());
//! broker.connect().await?;
//!
//! // Producer
//! let publisher = EventPublisher::new(broker.clone(), "users");
//! publisher
//!     .execute(|uow| {
//!         async move {
//!             let event = uow.event("UserCreated", json!({"userId": "u-1"}));
//!             uow.stage_keyed("user-events", "u-1", event);
//!             Ok::<_, EventError>(())
//!         }
//!         .scope_boxed()
//!     })
//!     .await?;
//!
//! // Consumer
//! let router = EventRouter::builder()
//!     .register("UserCreated", WelcomeEmailHandler::new(mailer))?
//!     .build();
//! let ledger = Arc::new(InMemoryDedupLedger::new());
//! let listener = EventListener::new(broker.clone(), router, ledger);
//! let subscription = listener.listen("user-events", "notifications").await?;
//! ```

pub mod error;
pub mod event;
pub mod ledger;
pub mod listener;
pub mod outbox;
pub mod publisher;
pub mod router;
pub mod stats;

pub use error::{EventError, HandlerError, LedgerError, Result};
pub use event::{
    HEADER_CORRELATION_ID, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_SOURCE, IntegrationEvent,
    METADATA_CAUSATION_ID, METADATA_CORRELATION_ID,
};
pub use ledger::{DedupLedger, DedupRecord, InMemoryDedupLedger};
pub use listener::{
    DeadLetterPolicy, Dispatch, EventListener, HEADER_DEAD_LETTER_REASON, HEADER_ORIGINAL_TOPIC,
};
pub use outbox::{
    InMemoryOutbox, OUTBOX_KEY, OutboxParticipant, OutboxRecord, OutboxRelay, OutboxStore,
    RelayReport,
};
pub use publisher::{EventPublisher, StagedEvent, UnitOfWork};
pub use router::{EventRouter, EventRouterBuilder, FnEventHandler, IntegrationEventHandler};
pub use stats::{EventStats, EventTracker, StatsSummary};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{EventError, HandlerError, LedgerError};
    pub use crate::event::IntegrationEvent;
    pub use crate::ledger::{DedupLedger, DedupRecord, InMemoryDedupLedger};
    pub use crate::listener::{DeadLetterPolicy, EventListener};
    pub use crate::outbox::{InMemoryOutbox, OutboxParticipant, OutboxRelay};
    pub use crate::publisher::{EventPublisher, UnitOfWork};
    pub use crate::router::{EventRouter, FnEventHandler, IntegrationEventHandler};
    pub use crate::stats::{EventStats, EventTracker};
    pub use herald_broker::prelude::*;
    pub use herald_transaction::prelude::*;
}
