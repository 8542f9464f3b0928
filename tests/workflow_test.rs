//! Integration tests for common Herald workflows.
//!
//! These tests drive a producer and a consumer through the facade crate the
//! way a service would wire them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use herald::{
    BrokerClient, BrokerConfig, BrokerError, ContextState, DOCUMENT_KEY, DeadLetterPolicy, Dispatch,
    DocumentParticipant, EventError, EventListener, EventPublisher, EventRouter, FnEventHandler,
    HandlerError, InMemoryBroker, InMemoryDedupLedger, InMemoryDocumentSession,
    InMemoryDocumentStore, InMemoryKeyValueStore, InMemoryPipeline, IntegrationEvent,
    KEY_VALUE_KEY, KeyValueParticipant, ResilientBroker, RetryPolicy, ScopedFutureExt,
    TransactionContext, TransactionParticipant,
};
use herald::{
    HEADER_CORRELATION_ID, HEADER_DEAD_LETTER_REASON, HEADER_EVENT_ID, HEADER_EVENT_TYPE,
    HEADER_ORIGINAL_TOPIC, HEADER_SOURCE,
};
use serde_json::json;

type MemoryDocument = DocumentParticipant<InMemoryDocumentSession>;
type MemoryKeyValue = KeyValueParticipant<InMemoryPipeline>;

// =============================================================================
// Helpers
// =============================================================================

/// Create user u-1 in both stores and stage `UserCreated`.
async fn create_user(
    publisher: &EventPublisher,
    documents: &InMemoryDocumentStore,
    cache: &InMemoryKeyValueStore,
) -> Result<String, EventError> {
    publisher
        .execute(|uow| {
            async move {
                uow.transaction()
                    .get_or_register::<MemoryDocument, _, _>(DOCUMENT_KEY, || {
                        DocumentParticipant::begin(documents)
                    })
                    .await?
                    .session_mut()
                    .insert("users", "u-1", json!({"name": "Ada"}))?;

                uow.transaction()
                    .get_or_register::<MemoryKeyValue, _, _>(KEY_VALUE_KEY, || async {
                        Ok(KeyValueParticipant::new(cache.pipeline()))
                    })
                    .await?
                    .pipeline_mut()
                    .set("user:u-1:name", "Ada");

                let event = uow.event("UserCreated", json!({"userId": "u-1"}));
                uow.stage_keyed("user-events", "u-1", event);
                Ok::<_, EventError>("u-1".to_string())
            }
            .scope_boxed()
        })
        .await
}

fn counting_router(calls: Arc<AtomicU32>, failures: u32) -> EventRouter {
    EventRouter::builder()
        .register(
            "UserCreated",
            FnEventHandler::new("welcome-email", move |_event: IntegrationEvent, _id: String| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < failures {
                        Err(HandlerError::failed("smtp down"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap()
        .build()
}

// =============================================================================
// Producer
// =============================================================================

#[tokio::test]
async fn test_unit_of_work_spans_both_stores() {
    let documents = InMemoryDocumentStore::new();
    let cache = InMemoryKeyValueStore::new();
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");

    let id = create_user(&publisher, &documents, &cache).await.unwrap();
    assert_eq!(id, "u-1");

    assert!(documents.get("users", "u-1").is_some());
    assert_eq!(cache.get("user:u-1:name").as_deref(), Some("Ada"));
    assert_eq!(documents.open_sessions(), 0);
    assert_eq!(cache.open_pipelines(), 0);

    let messages = broker.messages("user-events").await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.key.as_deref(), Some("u-1"));
    assert_eq!(message.header(HEADER_EVENT_TYPE), Some("UserCreated"));
    assert_eq!(message.header(HEADER_SOURCE), Some("users"));

    let event = IntegrationEvent::from_slice(&message.value).unwrap();
    assert_eq!(message.header(HEADER_EVENT_ID), Some(event.id()));
    assert_eq!(event.payload()["userId"], "u-1");
}

#[tokio::test]
async fn test_key_value_commit_failure_sends_nothing() {
    let documents = InMemoryDocumentStore::new();
    let cache = InMemoryKeyValueStore::new();
    cache.fail_next_exec("READONLY replica");
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");

    let result = create_user(&publisher, &documents, &cache).await;

    assert!(matches!(result, Err(EventError::TransactionFailed(_))));
    assert!(cache.is_empty());
    // Participants commit in registration order; the document store was
    // already committed when the pipeline failed.
    assert!(documents.get("users", "u-1").is_some());
    assert!(broker.messages("user-events").await.is_empty());
    assert_eq!(documents.open_sessions(), 0);
    assert_eq!(cache.open_pipelines(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_keeps_local_state() {
    let documents = InMemoryDocumentStore::new();
    let cache = InMemoryKeyValueStore::new();
    let inner = Arc::new(InMemoryBroker::new());
    inner
        .fail_next_sends((0..3).map(|_| BrokerError::NotAvailable("leader election".into())))
        .await;

    let broker = ResilientBroker::new(inner.clone(), &BrokerConfig::default())
        .with_retry(RetryPolicy::new(Duration::from_millis(100), 3).without_jitter());
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.into_shared(), "users");

    let result = create_user(&publisher, &documents, &cache).await;

    match result {
        Err(EventError::EventDeliveryFailed { topic, unsent, source, .. }) => {
            assert_eq!(topic, "user-events");
            assert!(unsent.is_empty());
            assert_eq!(source.attempts(), Some(3));
        }
        other => panic!("expected EventDeliveryFailed, got {other:?}"),
    }

    assert!(documents.get("users", "u-1").is_some());
    assert_eq!(cache.get("user:u-1:name").as_deref(), Some("Ada"));
    assert!(inner.messages("user-events").await.is_empty());
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn test_rollback_outside_transaction_is_noop() {
    let mut context = TransactionContext::new();
    context.rollback().await.unwrap();
    context.rollback().await.unwrap();
    assert_eq!(context.state(), ContextState::RolledBack);
    context.dispose().await.unwrap();

    let documents = InMemoryDocumentStore::new();
    let mut participant = DocumentParticipant::begin(&documents).await.unwrap();
    participant.rollback().await.unwrap();
    participant.rollback().await.unwrap();
    participant.dispose().await.unwrap();
    participant.dispose().await.unwrap();

    assert_eq!(documents.sessions_ended(), 1);
    assert_eq!(documents.count("users"), 0);
}

// =============================================================================
// Consumer
// =============================================================================

#[tokio::test]
async fn test_duplicate_delivery_runs_handler_once() {
    let broker = Arc::new(InMemoryBroker::new().with_partitions(1));
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");
    let event = publisher.event("UserCreated", json!({"userId": "u-1"})).with_id("evt-1");
    publisher.publish("user-events", &event).await.unwrap();
    publisher.publish("user-events", &event).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let ledger = Arc::new(InMemoryDedupLedger::new());
    let router = counting_router(calls.clone(), 0);
    let listener = EventListener::new(broker.clone(), router, ledger.clone());

    let messages = broker.messages("user-events").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(
        listener.dispatch(&messages[0]).await,
        Dispatch::Handled {
            handler: "welcome-email".into()
        }
    );
    assert_eq!(
        listener.dispatch(&messages[1]).await,
        Dispatch::Duplicate {
            handler: "welcome-email".into()
        }
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.len(), 1);
    assert!(ledger.get("evt-1", "welcome-email").is_some());

    let stats = listener.tracker().get("user-events", "UserCreated").unwrap();
    assert_eq!(stats.success_count, 2);
    assert_eq!(stats.failure_count, 0);
}

#[tokio::test]
async fn test_poison_message_is_dead_lettered() {
    let broker = Arc::new(InMemoryBroker::new().with_partitions(1));
    broker.connect().await.unwrap();
    let publisher = EventPublisher::new(broker.clone(), "users");
    let event = publisher.event("UserCreated", json!({})).with_id("evt-9");
    publisher.publish_keyed("user-events", "u-9", &event).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let ledger = Arc::new(InMemoryDedupLedger::new());
    let router = counting_router(calls.clone(), u32::MAX);
    let listener = EventListener::new(broker.clone(), router, ledger.clone())
        .with_dead_letter(DeadLetterPolicy::topic(2));

    let message = broker.messages("user-events").await.remove(0);
    assert!(matches!(listener.dispatch(&message).await, Dispatch::Failed { .. }));
    assert_eq!(listener.failed_deliveries("user-events", "evt-9"), 1);
    assert_eq!(
        listener.dispatch(&message).await,
        Dispatch::DeadLettered {
            topic: "user-events.dlq".into()
        }
    );
    assert_eq!(listener.failed_deliveries("user-events", "evt-9"), 0);

    let dead = broker.messages("user-events.dlq").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key.as_deref(), Some("u-9"));
    assert_eq!(dead[0].header(HEADER_ORIGINAL_TOPIC), Some("user-events"));
    assert!(dead[0].header(HEADER_DEAD_LETTER_REASON).is_some());
    assert_eq!(dead[0].value, message.value);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(ledger.is_empty());

    let stats = listener.tracker().get("user-events", "UserCreated").unwrap();
    assert_eq!(stats.failure_count, 2);
}

#[tokio::test]
async fn test_reaction_event_keeps_correlation() {
    let broker = Arc::new(InMemoryBroker::new().with_partitions(1));
    broker.connect().await.unwrap();
    let users = EventPublisher::new(broker.clone(), "users");
    let billing = EventPublisher::new(broker.clone(), "billing");

    let created = users
        .event("UserCreated", json!({"userId": "u-1"}))
        .with_id("evt-1")
        .with_metadata("tenant", "acme");
    users.publish("user-events", &created).await.unwrap();

    let received = broker.messages("user-events").await.remove(0);
    let cause = IntegrationEvent::from_slice(&received.value).unwrap();
    let reaction = billing.event("AccountOpened", json!({})).caused_by(&cause);
    billing.publish("billing-events", &reaction).await.unwrap();

    let sent = broker.messages("billing-events").await.remove(0);
    assert_eq!(sent.header(HEADER_CORRELATION_ID), Some("evt-1"));
    let decoded = IntegrationEvent::from_slice(&sent.value).unwrap();
    assert_eq!(decoded.metadata_value("tenant"), Some("acme"));
    assert_eq!(decoded.correlation_id(), Some("evt-1"));
}
