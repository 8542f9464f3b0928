//! # Herald Redis
//!
//! Redis backing for Herald services.
//!
//! ## Features
//!
//! - **Connection Pooling**: `bb8` pool shared by the whole service
//! - **Pipelines**: [`RedisPipeline`] queues commands and applies them in one
//!   `MULTI`/`EXEC` block, so it can take part in a unit of work as a
//!   [`herald_transaction::KeyValueParticipant`]
//! - **Dedup Ledger**: [`RedisDedupLedger`] implements
//!   [`herald_events::DedupLedger`] with `SET NX` and an optional TTL
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use herald_redis::{RedisConfig, RedisService};
//! use herald_transaction::{KeyValueParticipant, KEY_VALUE_KEY};
//!
//! let redis = RedisService::new(RedisConfig::from_env()?).await?;
//!
//! // Consumer side
//! let listener = EventListener::new(broker, router, Arc::new(redis.dedup_ledger()));
//!
//! // Inside a unit of work
//! uow.transaction()
//!     .get_or_register(KEY_VALUE_KEY, || async { Ok(KeyValueParticipant::new(redis.pipeline())) })
//!     .await?
//!     .pipeline_mut()
//!     .set("user:u-1:name", "Ada");
//! ```
//!
//! ## Environment Variables
//!
//! `REDIS_URL`, `REDIS_POOL_SIZE`, `REDIS_DATABASE`, `REDIS_USERNAME`,
//! `REDIS_PASSWORD`, `REDIS_TLS`, `REDIS_KEY_PREFIX`,
//! `REDIS_CONNECTION_TIMEOUT_MS`, `REDIS_COMMAND_TIMEOUT_MS`,
//! `REDIS_DEDUP_TTL_SECS`.

mod config;
mod error;
mod ledger;
mod pipeline;
mod pool;
mod service;

pub use config::RedisConfig;
pub use error::{RedisError, Result};
pub use ledger::RedisDedupLedger;
pub use pipeline::RedisPipeline;
pub use pool::{RedisConnection, RedisPool, RedisPoolBuilder};
pub use service::{PoolStats, RedisService};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::RedisConfig;
    pub use crate::error::{RedisError, Result as RedisResult};
    pub use crate::ledger::RedisDedupLedger;
    pub use crate::pipeline::RedisPipeline;
    pub use crate::service::RedisService;
}
