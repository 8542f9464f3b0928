//! Dedup ledger: which (message, handler) pairs have already been processed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::LedgerError;

/// Proof that a handler ran to completion for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
    pub handler_name: String,
}

impl DedupRecord {
    /// Record processing of `message_id` by `handler_name`, now.
    pub fn new(message_id: impl Into<String>, handler_name: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            processed_at: Utc::now(),
            handler_name: handler_name.into(),
        }
    }
}

/// Keyed insert-if-absent store of [`DedupRecord`]s.
///
/// Implementations must make `record` atomic per (message id, handler name):
/// of two concurrent calls for the same pair exactly one reports `true`.
#[async_trait]
pub trait DedupLedger: Send + Sync {
    /// Whether the pair has been recorded.
    async fn contains(&self, message_id: &str, handler_name: &str) -> Result<bool, LedgerError>;

    /// Insert the record unless the pair exists. Returns whether it was inserted.
    async fn record(&self, record: DedupRecord) -> Result<bool, LedgerError>;
}

#[async_trait]
impl<L: DedupLedger + ?Sized> DedupLedger for Arc<L> {
    async fn contains(&self, message_id: &str, handler_name: &str) -> Result<bool, LedgerError> {
        (**self).contains(message_id, handler_name).await
    }

    async fn record(&self, record: DedupRecord) -> Result<bool, LedgerError> {
        (**self).record(record).await
    }
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryDedupLedger {
    records: DashMap<(String, String), DedupRecord>,
}

impl InMemoryDedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record for the pair, if any.
    pub fn get(&self, message_id: &str, handler_name: &str) -> Option<DedupRecord> {
        self.records
            .get(&(message_id.to_string(), handler_name.to_string()))
            .map(|r| r.value().clone())
    }

    /// Every record for a message, across handlers.
    pub fn records_for(&self, message_id: &str) -> Vec<DedupRecord> {
        self.records
            .iter()
            .filter(|r| r.key().0 == message_id)
            .map(|r| r.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DedupLedger for InMemoryDedupLedger {
    async fn contains(&self, message_id: &str, handler_name: &str) -> Result<bool, LedgerError> {
        Ok(self
            .records
            .contains_key(&(message_id.to_string(), handler_name.to_string())))
    }

    async fn record(&self, record: DedupRecord) -> Result<bool, LedgerError> {
        let key = (record.message_id.clone(), record.handler_name.clone());
        match self.records.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }
}
