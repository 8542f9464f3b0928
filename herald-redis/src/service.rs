//! Shared Redis handle for a Herald service.

use crate::{
    RedisConfig, RedisDedupLedger, RedisError, RedisPipeline, RedisPool, RedisPoolBuilder, Result,
};

/// Owns the connection pool and hands out pipelines and the dedup ledger.
///
/// Created once at startup and shared; pipelines are per unit of work.
#[derive(Clone)]
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Connect and verify the server answers.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = RedisPoolBuilder::new(config.clone()).build().await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// A fresh atomic pipeline for one unit of work.
    pub fn pipeline(&self) -> RedisPipeline {
        RedisPipeline::new(self.pool.clone(), self.config.command_timeout)
    }

    /// Dedup ledger using this service's key prefix and record TTL.
    pub fn dedup_ledger(&self) -> RedisDedupLedger {
        RedisDedupLedger::new(self.pool.clone(), self.config.key_prefix.as_str())
            .with_ttl(self.config.dedup_ttl)
            .with_command_timeout(self.config.command_timeout)
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

impl std::fmt::Debug for RedisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisService")
            .field("url", &self.config.url)
            .field("pool", &self.pool_stats())
            .finish()
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ledger_inherits_config() {
        let config = RedisConfig::default()
            .with_key_prefix("users")
            .with_dedup_ttl(Duration::from_secs(60));
        let pool = RedisPoolBuilder::new(config.clone()).build_lazy().unwrap();
        let service = RedisService::from_pool(config, pool);

        let ledger = service.dedup_ledger();
        assert_eq!(ledger.key("evt-1", "audit"), "users:dedup:audit:evt-1");
        assert!(format!("{ledger:?}").contains("60s"));
    }
}
