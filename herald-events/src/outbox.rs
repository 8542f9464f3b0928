//! Transactional outbox.
//!
//! Instead of sending after the commit, a use case writes its events as
//! [`OutboxRecord`]s through an [`OutboxParticipant`] registered in the same
//! [`TransactionContext`]. An [`OutboxRelay`] later publishes unprocessed
//! records, so an event whose local writes committed is eventually sent even
//! if the process dies right after the commit.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_transaction::{
    ParticipantState, TransactionContext, TransactionError, TransactionParticipant,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{EventPublisher, IntegrationEvent};

/// Participant key used for the outbox.
pub const OUTBOX_KEY: &str = "outbox";

/// Default number of failed publish attempts before a record is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An event waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxRecord {
    pub id: String,
    pub topic: String,
    /// Partitioning key; the event id when absent.
    pub key: Option<String>,
    pub event: IntegrationEvent,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
}

impl OutboxRecord {
    pub fn new(topic: impl Into<String>, event: IntegrationEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            key: None,
            event,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// Whether the relay should still try to publish this record.
    pub fn can_retry(&self) -> bool {
        !self.is_processed() && self.retry_count < self.max_retries
    }
}

/// Storage behind the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Persist records written by a committed unit of work.
    async fn save(&self, records: Vec<OutboxRecord>) -> Result<(), TransactionError>;

    /// Oldest records that can still be published, at most `limit`.
    async fn find_unprocessed(&self, limit: usize) -> Result<Vec<OutboxRecord>, TransactionError>;

    async fn mark_processed(&self, id: &str) -> Result<(), TransactionError>;

    /// Count one more failed attempt. Returns the new count.
    async fn increment_retry(&self, id: &str) -> Result<u32, TransactionError>;

    /// Remove records processed before `older_than`. Returns how many were removed.
    async fn delete_processed(&self, older_than: DateTime<Utc>) -> Result<usize, TransactionError>;
}

/// Process-local outbox store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    records: Arc<RwLock<Vec<OutboxRecord>>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, in insertion order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<OutboxRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut OutboxRecord) -> T,
    ) -> Result<T, TransactionError> {
        let mut records = self.records.write();
        records
            .iter_mut()
            .find(|r| r.id == id)
            .map(f)
            .ok_or_else(|| TransactionError::store(format!("outbox record '{id}' not found")))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn save(&self, records: Vec<OutboxRecord>) -> Result<(), TransactionError> {
        self.records.write().extend(records);
        Ok(())
    }

    async fn find_unprocessed(&self, limit: usize) -> Result<Vec<OutboxRecord>, TransactionError> {
        let mut pending: Vec<OutboxRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.can_retry())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_processed(&self, id: &str) -> Result<(), TransactionError> {
        self.update(id, |r| r.processed_at = Some(Utc::now()))
    }

    async fn increment_retry(&self, id: &str) -> Result<u32, TransactionError> {
        self.update(id, |r| {
            r.retry_count = (r.retry_count + 1).min(r.max_retries);
            r.retry_count
        })
    }

    async fn delete_processed(&self, older_than: DateTime<Utc>) -> Result<usize, TransactionError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.processed_at.is_none_or(|at| at >= older_than));
        Ok(before - records.len())
    }
}

/// Buffers outbox records for one unit of work and saves them on commit.
pub struct OutboxParticipant<S: OutboxStore> {
    store: Arc<S>,
    pending: Vec<OutboxRecord>,
    state: ParticipantState,
    disposed: bool,
}

impl<S: OutboxStore> OutboxParticipant<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: Vec::new(),
            state: ParticipantState::Active,
            disposed: false,
        }
    }

    /// The outbox participant of `ctx`, registering one under [`OUTBOX_KEY`]
    /// when absent.
    pub async fn enlist<'c>(
        ctx: &'c mut TransactionContext,
        store: &Arc<S>,
    ) -> Result<&'c mut Self, TransactionError> {
        let store = store.clone();
        ctx.get_or_register(OUTBOX_KEY, || async move { Ok(Self::new(store)) })
            .await
    }

    /// Queue `event` for `topic`.
    pub fn add(&mut self, topic: impl Into<String>, event: IntegrationEvent) -> &mut Self {
        self.push(OutboxRecord::new(topic, event))
    }

    /// Queue a prepared record.
    pub fn push(&mut self, record: OutboxRecord) -> &mut Self {
        self.pending.push(record);
        self
    }

    pub fn pending(&self) -> &[OutboxRecord] {
        &self.pending
    }
}

#[async_trait]
impl<S: OutboxStore> TransactionParticipant for OutboxParticipant<S> {
    fn name(&self) -> &str {
        "outbox"
    }

    fn state(&self) -> ParticipantState {
        self.state
    }

    fn is_disposed(&self) -> bool {
        self.disposed
    }

    async fn commit(&mut self) -> Result<(), TransactionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.pending);
        let count = records.len();
        if let Err(e) = self.store.save(records.clone()).await {
            self.pending = records;
            return Err(e);
        }
        self.state = ParticipantState::Committed;
        debug!(records = count, "Outbox records saved");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TransactionError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.pending.clear();
        self.state = ParticipantState::Aborted;
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), TransactionError> {
        self.disposed = true;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Result of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Records sent and marked processed.
    pub published: usize,
    /// Records that failed and will be retried.
    pub retried: usize,
    /// Records that failed for the last time.
    pub abandoned: usize,
}

/// Publishes outbox records through an [`EventPublisher`].
pub struct OutboxRelay<S: OutboxStore> {
    store: Arc<S>,
    publisher: EventPublisher,
    batch_size: usize,
    interval: Duration,
}

impl<S: OutboxStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            batch_size: 10,
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Publish up to `limit` unprocessed records, oldest first.
    ///
    /// A record that fails to publish has its retry count incremented; once
    /// the count reaches the record's `max_retries` it is no longer picked up.
    pub async fn process_batch(&self, limit: usize) -> Result<RelayReport, TransactionError> {
        let records = self.store.find_unprocessed(limit).await?;
        let mut report = RelayReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        debug!(records = records.len(), "Processing outbox records");

        for record in records {
            let sent = match &record.key {
                Some(key) => self.publisher.publish_keyed(&record.topic, key, &record.event).await,
                None => self.publisher.publish(&record.topic, &record.event).await,
            };

            match sent {
                Ok(_) => {
                    self.store.mark_processed(&record.id).await?;
                    report.published += 1;
                }
                Err(e) => {
                    let attempts = self.store.increment_retry(&record.id).await?;
                    if attempts < record.max_retries {
                        warn!(
                            record_id = %record.id,
                            event_id = record.event.id(),
                            attempts,
                            max_retries = record.max_retries,
                            error = %e,
                            "Outbox publish failed, will retry"
                        );
                        report.retried += 1;
                    } else {
                        error!(
                            record_id = %record.id,
                            event_id = record.event.id(),
                            attempts,
                            error = %e,
                            "Outbox publish failed, giving up"
                        );
                        report.abandoned += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Remove records processed more than `older_than` ago.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, TransactionError> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| TransactionError::store(format!("invalid retention: {e}")))?;
        let removed = self.store.delete_processed(Utc::now() - age).await?;
        debug!(removed, "Cleaned up processed outbox records");
        Ok(removed)
    }

    /// Process batches every interval until `shutdown` turns `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Outbox relay started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_batch(self.batch_size).await {
                        error!(error = %e, "Outbox relay pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_broker::{BrokerClient, BrokerError, InMemoryBroker};
    use serde_json::json;

    async fn relay() -> (Arc<InMemoryBroker>, Arc<InMemoryOutbox>, OutboxRelay<InMemoryOutbox>) {
        let broker = Arc::new(InMemoryBroker::new().with_partitions(1));
        broker.connect().await.unwrap();
        let store = Arc::new(InMemoryOutbox::new());
        let relay = OutboxRelay::new(store.clone(), EventPublisher::new(broker.clone(), "users"));
        (broker, store, relay)
    }

    fn record(id: &str) -> OutboxRecord {
        let event = IntegrationEvent::new("UserCreated", json!({}), "users").with_id(id);
        OutboxRecord::new("user-events", event)
    }

    #[tokio::test]
    async fn test_participant_saves_on_commit_only() {
        let store = Arc::new(InMemoryOutbox::new());

        let mut committed = OutboxParticipant::new(store.clone());
        committed.push(record("evt-1"));
        committed.commit().await.unwrap();
        committed.commit().await.unwrap();
        assert_eq!(store.len(), 1);

        let mut aborted = OutboxParticipant::new(store.clone());
        aborted.push(record("evt-2"));
        aborted.rollback().await.unwrap();
        aborted.commit().await.unwrap();
        assert_eq!(aborted.state(), ParticipantState::Aborted);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_enlist_reuses_participant() {
        let store = Arc::new(InMemoryOutbox::new());
        let mut ctx = TransactionContext::new();

        OutboxParticipant::enlist(&mut ctx, &store)
            .await
            .unwrap()
            .add("user-events", IntegrationEvent::new("UserCreated", json!({}), "users"));
        OutboxParticipant::enlist(&mut ctx, &store)
            .await
            .unwrap()
            .add("user-events", IntegrationEvent::new("UserRenamed", json!({}), "users"));

        assert_eq!(ctx.len(), 1);
        ctx.commit().await.unwrap();
        ctx.dispose().await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_process_batch_publishes_and_marks() {
        let (broker, store, relay) = relay().await;
        store.save(vec![record("evt-1"), record("evt-2").with_key("u-2")]).await.unwrap();

        let report = relay.process_batch(10).await.unwrap();
        assert_eq!(report.published, 2);
        assert!(store.records().iter().all(OutboxRecord::is_processed));

        let messages = broker.messages("user-events").await;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.key.as_deref() == Some("u-2")));

        assert_eq!(relay.process_batch(10).await.unwrap(), RelayReport::default());
    }

    #[tokio::test]
    async fn test_process_batch_respects_limit() {
        let (_broker, store, relay) = relay().await;
        store
            .save((0..5).map(|n| record(&format!("evt-{n}"))).collect())
            .await
            .unwrap();

        assert_eq!(relay.process_batch(2).await.unwrap().published, 2);
        assert_eq!(store.find_unprocessed(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_record_is_abandoned_after_max_retries() {
        let (broker, store, relay) = relay().await;
        let rec = record("evt-1").with_max_retries(2);
        let id = rec.id.clone();
        store.save(vec![rec]).await.unwrap();

        broker
            .fail_next_sends([
                BrokerError::Rejected("quota".into()),
                BrokerError::Rejected("quota".into()),
            ])
            .await;

        let first = relay.process_batch(10).await.unwrap();
        assert_eq!(first.retried, 1);
        let second = relay.process_batch(10).await.unwrap();
        assert_eq!(second.abandoned, 1);

        let stored = store.get(&id).unwrap();
        assert_eq!(stored.retry_count, 2);
        assert!(!stored.is_processed());
        assert_eq!(relay.process_batch(10).await.unwrap(), RelayReport::default());
        assert!(broker.messages("user-events").await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_processed_records() {
        let (_broker, store, relay) = relay().await;
        let mut old = record("evt-old");
        old.processed_at = Some(Utc::now() - chrono::Duration::days(8));
        let mut recent = record("evt-recent");
        recent.processed_at = Some(Utc::now());
        let pending = record("evt-pending");
        store.save(vec![old, recent, pending]).await.unwrap();

        let removed = relay.cleanup(Duration::from_secs(7 * 24 * 60 * 60)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let (broker, store, relay) = relay().await;
        store.save(vec![record("evt-1")]).await.unwrap();
        let (stop, shutdown) = watch::channel(false);

        let relay = Arc::new(relay.with_interval(Duration::from_millis(100)));
        let task = tokio::spawn({
            let relay = relay.clone();
            async move { relay.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        stop.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(broker.messages("user-events").await.len(), 1);
    }
}
