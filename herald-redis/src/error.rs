//! Redis error types.

use herald_config::ConfigError;
use herald_events::LedgerError;
use herald_transaction::TransactionError;
use thiserror::Error;

/// Result type for Redis operations.
pub type Result<T> = std::result::Result<T, RedisError>;

/// Redis errors.
#[derive(Debug, Error)]
pub enum RedisError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Pool error.
    #[error("Pool error: {0}")]
    Pool(String),

    /// Command error.
    #[error("Command error: {0}")]
    Command(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout | Self::Pool(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(e) => e.is_connection_refusal() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

impl<E> From<bb8::RunError<E>> for RedisError
where
    E: std::error::Error + 'static,
{
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => Self::Timeout,
            bb8::RunError::User(e) => Self::Pool(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for RedisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for RedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<RedisError> for TransactionError {
    fn from(err: RedisError) -> Self {
        TransactionError::store(err.to_string())
    }
}

impl From<RedisError> for LedgerError {
    fn from(err: RedisError) -> Self {
        match err {
            RedisError::Serialization(message) => LedgerError::Serialization(message),
            e if e.is_retryable() => LedgerError::Unavailable(e.to_string()),
            e => LedgerError::Other(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RedisError::Timeout.is_retryable());
        assert!(RedisError::Connection("refused".into()).is_retryable());
        assert!(RedisError::Connection("refused".into()).is_connection_error());
        assert!(!RedisError::Command("WRONGTYPE".into()).is_retryable());
        assert!(!RedisError::Serialization("bad".into()).is_connection_error());
    }

    #[test]
    fn test_ledger_error_mapping() {
        assert!(matches!(LedgerError::from(RedisError::Timeout), LedgerError::Unavailable(_)));
        assert!(matches!(
            LedgerError::from(RedisError::Serialization("eof".into())),
            LedgerError::Serialization(_)
        ));
        assert!(matches!(
            LedgerError::from(RedisError::Command("NOPERM".into())),
            LedgerError::Other(_)
        ));
    }

    #[test]
    fn test_transaction_error_mapping() {
        let err = TransactionError::from(RedisError::Command("EXECABORT".into()));
        assert!(matches!(err, TransactionError::Store(ref m) if m.contains("EXECABORT")));
    }
}
