//! Transaction error types.

use thiserror::Error;

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Transaction errors.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The underlying store rejected an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// A registered participant failed.
    #[error("Participant '{key}' failed: {source}")]
    Participant {
        key: String,
        #[source]
        source: Box<TransactionError>,
    },

    /// Commit attempted after the context was rolled back.
    #[error("Cannot commit a transaction that has already been rolled back")]
    AlreadyRolledBack,

    /// Participant registered after the context reached a terminal state.
    #[error("Transaction context is already {0}")]
    Closed(&'static str),

    /// A participant exists under the key but has a different type.
    #[error("Participant '{key}' is not a {expected}")]
    ParticipantType { key: String, expected: &'static str },

    /// The session was already released.
    #[error("Session already ended")]
    SessionEnded,
}

impl TransactionError {
    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Wrap an error with the key of the participant that produced it.
    pub fn participant(key: impl Into<String>, source: TransactionError) -> Self {
        Self::Participant {
            key: key.into(),
            source: Box::new(source),
        }
    }
}
