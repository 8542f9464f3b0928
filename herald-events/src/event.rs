//! The integration event envelope.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{EventError, Result};

/// Header carrying the event id.
pub const HEADER_EVENT_ID: &str = "event_id";

/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event_type";

/// Header carrying the producing service.
pub const HEADER_SOURCE: &str = "source";

/// Header carrying the correlation id, when the event has one.
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// Metadata key shared by every event of one business flow.
pub const METADATA_CORRELATION_ID: &str = "correlation_id";

/// Metadata key naming the event this one was raised in reaction to.
pub const METADATA_CAUSATION_ID: &str = "causation_id";

/// An event announced by one service for others to react to.
///
/// The id is stable across redelivery: the same logical event always
/// carries the same id, which is what consumers deduplicate on. Events are
/// immutable once built; fields are read through accessors.
///
/// On the wire the event is JSON:
///
/// ```json
/// {
///   "id": "evt-1",
///   "type": "UserCreated",
///   "payload": {},
///   "occurredAt": "2024-01-01T00:00:00Z",
///   "source": "users",
///   "metadata": {"correlation_id": "req-42"}
/// }
/// ```
///
/// `metadata` carries free-form trace context; it is always written and
/// defaults to empty when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    occurred_at: DateTime<Utc>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl IntegrationEvent {
    /// Create an event with a fresh id, occurring now.
    pub fn new(event_type: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            occurred_at: Utc::now(),
            source: source.into(),
            metadata: HashMap::new(),
        }
    }

    /// Create an event from a serializable payload.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
        source: impl Into<String>,
    ) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| EventError::InvalidEventPayload(e.to_string()))?;
        Ok(Self::new(event_type, payload, source))
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the occurrence time.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Add a metadata entry, replacing any previous value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Continue the trace of `cause`.
    ///
    /// Copies its metadata, records its id as the causation id and keeps its
    /// correlation id, starting one from its id if it had none.
    pub fn caused_by(mut self, cause: &IntegrationEvent) -> Self {
        for (key, value) in &cause.metadata {
            self.metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }
        let correlation_id = cause.correlation_id().unwrap_or(cause.id()).to_string();
        self.metadata.insert(METADATA_CORRELATION_ID.to_string(), correlation_id);
        self.metadata.insert(METADATA_CAUSATION_ID.to_string(), cause.id.clone());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata_value(METADATA_CORRELATION_ID)
    }

    /// Decode the payload into a handler's own type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Encode as wire JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EventError::InvalidEventPayload(e.to_string()))
    }

    /// Decode wire JSON.
    ///
    /// Fails with [`EventError::InvalidEventPayload`] when the bytes are not
    /// an event or the id or type is blank.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let event: Self = serde_json::from_slice(bytes)
            .map_err(|e| EventError::InvalidEventPayload(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EventError::InvalidEventPayload("id is required".into()));
        }
        if self.event_type.trim().is_empty() {
            return Err(EventError::InvalidEventPayload("type is required".into()));
        }
        Ok(())
    }
}
