//! Exponential backoff for transient broker failures.
//!
//! ## Example
//!
//! ```rust,ignore
//! use herald_broker::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(Duration::from_millis(300), 5).with_factor(2.0);
//!
//! let metadata = policy
//!     .run("send", || async { producer.send(topic, message.clone()).await })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::BrokerError;

/// Retry policy for broker operations.
///
/// `retries` is the total number of attempts, including the first one. The
/// wait before attempt `k + 1` is `initial_delay * factor^(k - 1)`, randomized
/// by up to `multiplier` of itself in either direction and capped at
/// `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum number of attempts
    pub retries: u32,
    /// Exponential growth factor
    pub factor: f64,
    /// Jitter as a fraction of the computed delay (0.0 disables jitter)
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(300),
            retries: 5,
            factor: 2.0,
            multiplier: 0.2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given initial delay and attempt count.
    pub fn new(initial_delay: Duration, retries: u32) -> Self {
        Self {
            initial_delay,
            retries,
            ..Default::default()
        }
    }

    /// Set the exponential growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter fraction.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Disable jitter.
    pub fn without_jitter(self) -> Self {
        self.with_multiplier(0.0)
    }

    /// Effective attempt count. A policy never makes fewer than one attempt.
    pub fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Check the policy for values that would make backoff meaningless.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(BrokerError::Configuration(format!(
                "retry factor must be >= 1.0, got {}",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.multiplier) {
            return Err(BrokerError::Configuration(format!(
                "retry multiplier must be within [0.0, 1.0), got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay before attempt `failed + 1`, without jitter.
    ///
    /// `failed` is the number of attempts that have already failed (1-based).
    pub fn base_delay(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(max_millis) as u64)
    }

    /// Delay before attempt `failed + 1`, with jitter applied.
    pub fn delay_for(&self, failed: u32) -> Duration {
        let base = self.base_delay(failed);
        if self.multiplier <= 0.0 || base.is_zero() {
            return base;
        }

        let spread = rand::rng().random_range(-self.multiplier..=self.multiplier);
        let millis = base.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64).min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    ///
    /// Non-transient errors are returned unchanged after the attempt that
    /// produced them. Exhausting the budget yields
    /// [`BrokerError::Unavailable`] carrying the last error.
    pub async fn run<F, Fut, T>(&self, operation: &str, mut f: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Final retry attempt failed"
                    );
                    return Err(BrokerError::Unavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Transient failure, waiting before retry"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
