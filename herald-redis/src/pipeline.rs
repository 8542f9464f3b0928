//! Atomic command pipeline used as a key-value transaction participant.

use std::time::Duration;

use async_trait::async_trait;
use herald_transaction::{KeyValuePipeline, TransactionError};
use tracing::debug;

use crate::RedisPool;

/// Commands queued locally and sent as one `MULTI`/`EXEC` block.
///
/// Nothing reaches the server before [`KeyValuePipeline::exec`]; discarding
/// only clears the local queue.
pub struct RedisPipeline {
    pool: RedisPool,
    pipe: redis::Pipeline,
    queued: usize,
    command_timeout: Duration,
    closed: bool,
}

impl RedisPipeline {
    pub fn new(pool: RedisPool, command_timeout: Duration) -> Self {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self {
            pool,
            pipe,
            queued: 0,
            command_timeout,
            closed: false,
        }
    }

    /// Queue a `SET`.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Self {
        self.pipe.cmd("SET").arg(key.as_ref()).arg(value.as_ref()).ignore();
        self.queued += 1;
        self
    }

    /// Queue a `SET` with an expiry in seconds.
    pub fn set_ex(
        &mut self,
        key: impl AsRef<str>,
        value: impl AsRef<str>,
        ttl: Duration,
    ) -> &mut Self {
        self.pipe
            .cmd("SET")
            .arg(key.as_ref())
            .arg(value.as_ref())
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .ignore();
        self.queued += 1;
        self
    }

    /// Queue a `DEL`.
    pub fn del(&mut self, key: impl AsRef<str>) -> &mut Self {
        self.pipe.cmd("DEL").arg(key.as_ref()).ignore();
        self.queued += 1;
        self
    }

    /// Queue an `INCRBY`.
    pub fn incr(&mut self, key: impl AsRef<str>, delta: i64) -> &mut Self {
        self.pipe.cmd("INCRBY").arg(key.as_ref()).arg(delta).ignore();
        self.queued += 1;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> herald_transaction::Result<()> {
        if self.closed {
            Err(TransactionError::SessionEnded)
        } else {
            Ok(())
        }
    }

    fn reset(&mut self) {
        self.pipe.clear();
        self.queued = 0;
    }
}

#[async_trait]
impl KeyValuePipeline for RedisPipeline {
    fn queued(&self) -> usize {
        self.queued
    }

    async fn exec(&mut self) -> herald_transaction::Result<()> {
        self.ensure_open()?;
        let commands = self.queued;

        {
            let mut conn = self.pool.get().await.map_err(crate::RedisError::from)?;
            let query = self.pipe.query_async(&mut *conn);
            let _: () = tokio::time::timeout(self.command_timeout, query)
                .await
                .map_err(crate::RedisError::from)?
                .map_err(crate::RedisError::from)?;
        }

        self.reset();
        debug!(commands, "Redis pipeline executed");
        Ok(())
    }

    async fn discard(&mut self) -> herald_transaction::Result<()> {
        self.ensure_open()?;
        self.reset();
        Ok(())
    }

    async fn quit(&mut self) -> herald_transaction::Result<()> {
        self.ensure_open()?;
        self.reset();
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RedisConfig, RedisPoolBuilder};

    fn pipeline() -> RedisPipeline {
        let config = RedisConfig::default();
        let pool = RedisPoolBuilder::new(config.clone()).build_lazy().unwrap();
        RedisPipeline::new(pool, config.command_timeout)
    }

    #[tokio::test]
    async fn test_commands_are_counted() {
        let mut pipe = pipeline();
        pipe.set("user:u-1:name", "Ada")
            .set_ex("session:s-1", "u-1", Duration::from_secs(60))
            .del("user:u-0:name")
            .incr("users:count", 1);

        assert_eq!(pipe.queued(), 4);
    }

    #[tokio::test]
    async fn test_discard_clears_queue_without_server() {
        let mut pipe = pipeline();
        pipe.set("k", "v");

        pipe.discard().await.unwrap();
        assert_eq!(pipe.queued(), 0);
    }

    #[tokio::test]
    async fn test_quit_closes_pipeline() {
        let mut pipe = pipeline();
        pipe.set("k", "v");

        pipe.quit().await.unwrap();
        assert!(pipe.is_closed());
        assert_eq!(pipe.queued(), 0);
        assert!(matches!(pipe.quit().await, Err(TransactionError::SessionEnded)));
        assert!(matches!(pipe.exec().await, Err(TransactionError::SessionEnded)));
    }
}
