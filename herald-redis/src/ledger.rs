//! Dedup ledger on Redis.

use std::time::Duration;

use async_trait::async_trait;
use herald_events::{DedupLedger, DedupRecord, LedgerError};
use tracing::debug;

use crate::{RedisError, RedisPool, Result};

/// Stores one key per (message id, handler name), written with `SET NX` so
/// concurrent consumers of the same message insert it exactly once.
///
/// Keys look like `<prefix>:dedup:<handler>:<message id>` and hold the JSON
/// [`DedupRecord`].
#[derive(Clone)]
pub struct RedisDedupLedger {
    pool: RedisPool,
    prefix: String,
    ttl: Option<Duration>,
    command_timeout: Duration,
}

impl RedisDedupLedger {
    pub fn new(pool: RedisPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            ttl: None,
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Expire records after `ttl`. Redelivery after expiry runs the handler again.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Key holding the record for the pair.
    pub fn key(&self, message_id: &str, handler_name: &str) -> String {
        if self.prefix.is_empty() {
            format!("dedup:{handler_name}:{message_id}")
        } else {
            format!("{}:dedup:{handler_name}:{message_id}", self.prefix)
        }
    }

    /// Stored record for the pair, if any.
    pub async fn get(&self, message_id: &str, handler_name: &str) -> Result<Option<DedupRecord>> {
        let key = self.key(message_id, handler_name);
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("GET");
        let query = cmd.arg(&key).query_async(&mut *conn);
        let raw: Option<String> = tokio::time::timeout(self.command_timeout, query).await??;
        raw.map(|json| serde_json::from_str(&json).map_err(RedisError::from))
            .transpose()
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let mut cmd = redis::cmd("EXISTS");
        let query = cmd.arg(key).query_async(&mut *conn);
        let exists: bool = tokio::time::timeout(self.command_timeout, query).await??;
        Ok(exists)
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = self.ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }

        let mut conn = self.pool.get().await?;
        // `SET NX` replies OK when it wrote and nil when the key existed.
        let reply: Option<String> =
            tokio::time::timeout(self.command_timeout, cmd.query_async(&mut *conn)).await??;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl DedupLedger for RedisDedupLedger {
    async fn contains(
        &self,
        message_id: &str,
        handler_name: &str,
    ) -> std::result::Result<bool, LedgerError> {
        Ok(self.exists(&self.key(message_id, handler_name)).await?)
    }

    async fn record(&self, record: DedupRecord) -> std::result::Result<bool, LedgerError> {
        let key = self.key(&record.message_id, &record.handler_name);
        let value = serde_json::to_string(&record).map_err(RedisError::from)?;
        let inserted = self.set_if_absent(&key, &value).await?;
        debug!(key = %key, inserted, "Dedup record written");
        Ok(inserted)
    }
}

impl std::fmt::Debug for RedisDedupLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDedupLedger")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}
