//! # Herald Transaction
//!
//! Uniform commit/rollback/dispose over heterogeneous store sessions, so a
//! use case can coordinate a document store, a key-value store and an event
//! publish as one logical unit.
//!
//! ## Features
//!
//! - **Participants** - [`DocumentParticipant`] over a [`DocumentSession`],
//!   [`KeyValueParticipant`] over a [`KeyValuePipeline`]
//! - **Context** - [`TransactionContext`] keyed registry with scoped
//!   acquisition ([`TransactionContext::run`])
//! - **In-memory stores** - for development and tests
//!
//! There is no two-phase commit. Participants commit in registration order
//! and anything left active after a failure is rolled back.
//!
//! ## Example
//!
//! ```rust,ignore
//! use herald_transaction::*;
//!
//! let store = InMemoryDocumentStore::new();
//! let kv = InMemoryKeyValueStore::new();
//!
//! TransactionContext::run(|ctx| {
//!     async move {
//!         ctx.get_or_register("document", || DocumentParticipant::begin(&store))
//!             .await?
//!             .session_mut()
//!             .insert("users", "u-1", serde_json::json!({"name": "Ada"}))?;
//!
//!         ctx.get_or_register("key-value", || async {
//!             Ok(KeyValueParticipant::new(kv.pipeline()))
//!         })
//!         .await?
//!         .pipeline_mut()
//!         .set("user:u-1:name", "Ada");
//!
//!         Ok::<_, TransactionError>(())
//!     }
//!     .scope_boxed()
//! })
//! .await?;
//! ```

pub mod context;
pub mod document;
pub mod error;
pub mod keyvalue;
pub mod memory;
pub mod participant;

pub use context::{ContextState, TransactionContext};
pub use document::{DocumentClient, DocumentParticipant, DocumentSession};
pub use error::{Result, TransactionError};
pub use keyvalue::{KeyValueParticipant, KeyValuePipeline};
pub use memory::{
    InMemoryDocumentSession, InMemoryDocumentStore, InMemoryKeyValueStore, InMemoryPipeline,
};
pub use participant::{ParticipantState, TransactionParticipant};
pub use scoped_futures::{ScopedBoxFuture, ScopedFutureExt};

/// Participant key used for the document store.
pub const DOCUMENT_KEY: &str = "document";

/// Participant key used for the key-value store.
pub const KEY_VALUE_KEY: &str = "key-value";

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::{ContextState, TransactionContext};
    pub use crate::document::{DocumentClient, DocumentParticipant, DocumentSession};
    pub use crate::error::TransactionError;
    pub use crate::keyvalue::{KeyValueParticipant, KeyValuePipeline};
    pub use crate::participant::{ParticipantState, TransactionParticipant};
    pub use crate::{DOCUMENT_KEY, KEY_VALUE_KEY};
    pub use scoped_futures::ScopedFutureExt;
}
