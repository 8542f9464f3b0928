//! Retry and timeout layer over any [`BrokerClient`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    BrokerClient, BrokerConfig, BrokerError, MessageHandler, OutgoingMessage, RecordMetadata,
    RetryPolicy, Subscription,
};

/// Wraps a backend so that `send` retries transient failures and every
/// attempt is bounded by the request timeout.
///
/// `connect` is bounded by the connection timeout and retried with the same
/// policy. `subscribe` and `disconnect` pass straight through.
pub struct ResilientBroker<B> {
    inner: B,
    retry: RetryPolicy,
    request_timeout: Duration,
    connection_timeout: Duration,
}

impl<B: BrokerClient> ResilientBroker<B> {
    /// Wrap `inner` using the retry policy and timeouts from `config`
    pub fn new(inner: B, config: &BrokerConfig) -> Self {
        Self {
            inner,
            retry: config.retry.clone(),
            request_timeout: config.request_timeout,
            connection_timeout: config.connection_timeout,
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the per-attempt request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the wrapped backend
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Wrap into a shareable trait object
    pub fn into_shared(self) -> Arc<dyn BrokerClient>
    where
        B: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<B: BrokerClient> BrokerClient for ResilientBroker<B> {
    async fn connect(&self) -> Result<(), BrokerError> {
        let timeout = self.connection_timeout;
        self.retry
            .run("connect", || async move {
                tokio::time::timeout(timeout, self.inner.connect())
                    .await
                    .map_err(|_| BrokerError::Timeout(format!("connect exceeded {timeout:?}")))?
            })
            .await?;
        info!("Broker connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.disconnect().await
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError> {
        let timeout = self.request_timeout;
        let result = self
            .retry
            .run("send", || {
                let message = message.clone();
                async move {
                    tokio::time::timeout(timeout, self.inner.send(topic, message))
                        .await
                        .map_err(|_| {
                            BrokerError::Timeout(format!("send to '{topic}' exceeded {timeout:?}"))
                        })?
                }
            })
            .await;

        if let Err(ref e) = result {
            warn!(topic, error = %e, "Send failed");
        }
        result
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BrokerError> {
        self.inner.subscribe(topic, group, handler).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}
