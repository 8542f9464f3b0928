//! Redis connection pool.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use tracing::info;

use crate::{RedisConfig, RedisError, Result};

/// Type alias for the connection pool.
pub type RedisPool = Pool<RedisConnectionManager>;

/// A pooled Redis connection.
pub type RedisConnection<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Builder for creating Redis connection pools.
pub struct RedisPoolBuilder {
    config: RedisConfig,
}

impl RedisPoolBuilder {
    /// Create a new pool builder.
    pub fn new(config: RedisConfig) -> Self {
        Self { config }
    }

    fn manager(&self) -> Result<RedisConnectionManager> {
        RedisConnectionManager::new(self.config.connection_url())
            .map_err(|e| RedisError::Connection(e.to_string()))
    }

    fn builder(&self) -> bb8::Builder<RedisConnectionManager> {
        Pool::builder()
            .max_size(self.config.pool_size)
            .min_idle(self.config.min_idle)
            .connection_timeout(self.config.connection_timeout)
    }

    /// Build the pool and check the server answers `PING`.
    pub async fn build(self) -> Result<RedisPool> {
        let pool = self
            .builder()
            .build(self.manager()?)
            .await
            .map_err(|e| RedisError::Pool(e.to_string()))?;

        // Scope the check connection so it is back in the pool before returning.
        {
            let mut conn = pool.get().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut *conn)
                .await
                .map_err(|e| RedisError::Connection(e.to_string()))?;
        }

        info!(
            pool_size = self.config.pool_size,
            url = %self.config.url,
            "Redis connection pool created"
        );

        Ok(pool)
    }

    /// Build the pool without opening any connection.
    pub fn build_lazy(self) -> Result<RedisPool> {
        Ok(self.builder().build_unchecked(self.manager()?))
    }
}
