//! Integration tests for herald-events

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use herald_broker::{
    BrokerClient, BrokerError, InMemoryBroker, MessageHandler, OutgoingMessage, RecordMetadata,
    Subscription,
};
use herald_events::{
    EventError, EventListener, EventPublisher, EventRouter, FnEventHandler, HandlerError,
    InMemoryDedupLedger, InMemoryOutbox, IntegrationEvent, OutboxParticipant, OutboxRecord,
    OutboxRelay,
};
use herald_transaction::{
    DOCUMENT_KEY, DocumentParticipant, InMemoryDocumentSession, InMemoryDocumentStore,
    ScopedFutureExt,
};
use parking_lot::Mutex;
use serde_json::json;

type MemoryDocument = DocumentParticipant<InMemoryDocumentSession>;

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Broker that notes, at every send, whether user u-1 is already visible in
/// the document store.
struct SendObserver {
    inner: InMemoryBroker,
    documents: InMemoryDocumentStore,
    visible_at_send: Mutex<Vec<bool>>,
}

#[async_trait]
impl BrokerClient for SendObserver {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.disconnect().await
    }

    async fn send(
        &self,
        topic: &str,
        message: OutgoingMessage,
    ) -> Result<RecordMetadata, BrokerError> {
        self.visible_at_send
            .lock()
            .push(self.documents.get("users", "u-1").is_some());
        self.inner.send(topic, message).await
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

#[tokio::test]
async fn test_event_is_sent_only_after_commit() {
    let documents = InMemoryDocumentStore::new();
    let observer = Arc::new(SendObserver {
        inner: InMemoryBroker::new(),
        documents: documents.clone(),
        visible_at_send: Mutex::new(Vec::new()),
    });
    observer.connect().await.unwrap();
    let publisher = EventPublisher::new(observer.clone(), "users");

    publisher
        .execute(|uow| {
            let documents = &documents;
            async move {
                uow.transaction()
                    .get_or_register::<MemoryDocument, _, _>(DOCUMENT_KEY, || {
                        DocumentParticipant::begin(documents)
                    })
                    .await?
                    .session_mut()
                    .insert("users", "u-1", json!({"name": "Ada"}))?;

                let event = uow.event("UserCreated", json!({"userId": "u-1"}));
                uow.stage_keyed("user-events", "u-1", event);
                Ok::<_, EventError>(())
            }
            .scope_boxed()
        })
        .await
        .unwrap();

    assert_eq!(*observer.visible_at_send.lock(), vec![true]);
    assert_eq!(documents.open_sessions(), 0);
}

#[tokio::test]
async fn test_commit_failure_sends_nothing() {
    let documents = InMemoryDocumentStore::new();
    documents.fail_next_commit("write conflict");
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");

    let result = publisher
        .execute(|uow| {
            let documents = &documents;
            async move {
                uow.transaction()
                    .get_or_register::<MemoryDocument, _, _>(DOCUMENT_KEY, || {
                        DocumentParticipant::begin(documents)
                    })
                    .await?
                    .session_mut()
                    .insert("users", "u-1", json!({"name": "Ada"}))?;
                let event = uow.event("UserCreated", json!({}));
                uow.stage("user-events", event);
                Ok::<_, EventError>(())
            }
            .scope_boxed()
        })
        .await;

    assert!(matches!(result, Err(EventError::TransactionFailed(_))));
    assert!(broker.messages("user-events").await.is_empty());
    assert_eq!(documents.count("users"), 0);
    assert_eq!(documents.open_sessions(), 0);
}

#[tokio::test]
async fn test_redelivered_event_is_handled_once_end_to_end() {
    let broker = Arc::new(InMemoryBroker::new().with_partitions(3));
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let router = EventRouter::builder()
        .register(
            "UserCreated",
            FnEventHandler::new("welcome-email", move |_event: IntegrationEvent, _id: String| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), HandlerError>(()) }
            }),
        )
        .unwrap()
        .build();
    let ledger = Arc::new(InMemoryDedupLedger::new());
    let listener = EventListener::new(broker.clone(), router, ledger.clone());
    let subscription = listener.listen("user-events", "notifications").await.unwrap();

    // The same logical event sent twice, as a producer retry would.
    let publisher = EventPublisher::new(broker.clone(), "users");
    let event = publisher.event("UserCreated", json!({"userId": "u-1"})).with_id("evt-1");
    publisher.publish("user-events", &event).await.unwrap();
    publisher.publish("user-events", &event).await.unwrap();

    let partition = broker.messages("user-events").await[0].partition;
    wait_until(|| broker.committed_offset("user-events", "notifications", partition) == Some(2))
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.len(), 1);
    assert!(ledger.get("evt-1", "welcome-email").is_some());

    subscription.unsubscribe().await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_is_redelivered_until_it_succeeds() {
    let broker = Arc::new(
        InMemoryBroker::new()
            .with_partitions(1)
            .with_redelivery_delay(Duration::from_millis(5)),
    );
    broker.connect().await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let router = EventRouter::builder()
        .register(
            "UserCreated",
            FnEventHandler::new("welcome-email", move |_event: IntegrationEvent, _id: String| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(HandlerError::failed("smtp down"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap()
        .build();
    let ledger = Arc::new(InMemoryDedupLedger::new());
    let listener = EventListener::new(broker.clone(), router, ledger.clone());
    let _subscription = listener.listen("user-events", "notifications").await.unwrap();

    let publisher = EventPublisher::new(broker.clone(), "users");
    publisher
        .publish("user-events", &publisher.event("UserCreated", json!({})))
        .await
        .unwrap();

    wait_until(|| broker.committed_offset("user-events", "notifications", 0) == Some(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn test_outbox_records_commit_with_local_writes() {
    let documents = InMemoryDocumentStore::new();
    let outbox = Arc::new(InMemoryOutbox::new());
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");

    publisher
        .execute(|uow| {
            let (documents, outbox) = (&documents, &outbox);
            async move {
                uow.transaction()
                    .get_or_register::<MemoryDocument, _, _>(DOCUMENT_KEY, || {
                        DocumentParticipant::begin(documents)
                    })
                    .await?
                    .session_mut()
                    .insert("users", "u-1", json!({"name": "Ada"}))?;

                let event = uow.event("UserCreated", json!({"userId": "u-1"}));
                OutboxParticipant::enlist(uow.transaction(), outbox)
                    .await?
                    .push(OutboxRecord::new("user-events", event).with_key("u-1"));
                Ok::<_, EventError>(())
            }
            .scope_boxed()
        })
        .await
        .unwrap();

    // Nothing is sent directly; the relay does it.
    assert!(broker.messages("user-events").await.is_empty());
    assert_eq!(outbox.len(), 1);

    let relay = OutboxRelay::new(outbox.clone(), publisher);
    let report = relay.process_batch(10).await.unwrap();
    assert_eq!(report.published, 1);

    let messages = broker.messages("user-events").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key.as_deref(), Some("u-1"));
}

#[tokio::test]
async fn test_outbox_discarded_when_use_case_fails() {
    let outbox = Arc::new(InMemoryOutbox::new());
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");

    let result: Result<(), EventError> = publisher
        .execute(|uow| {
            let outbox = &outbox;
            async move {
                let event = uow.event("UserCreated", json!({}));
                OutboxParticipant::enlist(uow.transaction(), outbox)
                    .await?
                    .add("user-events", event);
                Err(EventError::InvalidEventPayload("validation failed".into()))
            }
            .scope_boxed()
        })
        .await;

    assert!(result.is_err());
    assert!(outbox.is_empty());
}
