//! Error types for broker operations

use thiserror::Error;

/// Errors that can occur during broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Failed to reach the broker
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connection dropped by the peer mid-request
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// Broker, leader or partition temporarily unavailable
    #[error("Broker not available: {0}")]
    NotAvailable(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Every attempt allowed by the retry policy failed with a transient error
    #[error("Broker unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Box<BrokerError>,
    },

    /// Operation requires a connected client
    #[error("Broker client is not connected")]
    NotConnected,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Failed to subscribe to a topic
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// A consumer for this (topic, group) pair is already running
    #[error("Already subscribed to '{topic}' as group '{group}'")]
    AlreadySubscribed { topic: String, group: String },

    /// Message was rejected by the broker
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// Failed to serialize a message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// Whether the failure may succeed on a later attempt.
    ///
    /// Only these errors are retried by the send path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_)
                | BrokerError::ConnectionReset(_)
                | BrokerError::NotAvailable(_)
                | BrokerError::Timeout(_)
        )
    }

    /// Number of attempts made, when the error is the result of exhausted retries.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            BrokerError::Unavailable { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<herald_config::ConfigError> for BrokerError {
    fn from(err: herald_config::ConfigError) -> Self {
        BrokerError::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BrokerError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        BrokerError::Timeout(err.to_string())
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BrokerError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::{KafkaError, RDKafkaErrorCode};

        match err.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::OperationTimedOut,
            ) => BrokerError::Timeout(err.to_string()),
            Some(RDKafkaErrorCode::BrokerTransportFailure) => {
                BrokerError::ConnectionReset(err.to_string())
            }
            Some(
                RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                | RDKafkaErrorCode::NetworkException,
            ) => BrokerError::NotAvailable(err.to_string()),
            Some(
                RDKafkaErrorCode::Authentication
                | RDKafkaErrorCode::SaslAuthenticationFailed
                | RDKafkaErrorCode::TopicAuthorizationFailed,
            ) => BrokerError::Authentication(err.to_string()),
            _ => match err {
                KafkaError::ClientCreation(_) => BrokerError::Connection(err.to_string()),
                KafkaError::MessageProduction(_) => BrokerError::Publish(err.to_string()),
                KafkaError::Subscription(_) | KafkaError::MessageConsumption(_) => {
                    BrokerError::Subscribe(err.to_string())
                }
                _ => BrokerError::Other(err.to_string()),
            },
        }
    }
}
