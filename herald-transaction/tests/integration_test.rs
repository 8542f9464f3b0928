//! Integration tests for herald-transaction

use herald_transaction::*;
use serde_json::json;

type MemoryDocument = DocumentParticipant<InMemoryDocumentSession>;
type MemoryKeyValue = KeyValueParticipant<InMemoryPipeline>;

async fn save_user(
    ctx: &mut TransactionContext,
    documents: &InMemoryDocumentStore,
    kv: &InMemoryKeyValueStore,
    id: &str,
    name: &str,
) -> Result<()> {
    ctx.get_or_register::<MemoryDocument, _, _>(DOCUMENT_KEY, || {
        DocumentParticipant::begin(documents)
    })
    .await?
    .session_mut()
    .insert("users", id, json!({ "name": name }))?;

    ctx.get_or_register::<MemoryKeyValue, _, _>(KEY_VALUE_KEY, || async {
        Ok(KeyValueParticipant::new(kv.pipeline()))
    })
    .await?
    .pipeline_mut()
    .set(format!("user:{id}:name"), name);

    Ok(())
}

#[tokio::test]
async fn test_writes_across_stores_commit_together() {
    let documents = InMemoryDocumentStore::new();
    let kv = InMemoryKeyValueStore::new();

    TransactionContext::run(|ctx| {
        let (documents, kv) = (&documents, &kv);
        async move {
            save_user(ctx, documents, kv, "u-1", "Ada").await?;
            save_user(ctx, documents, kv, "u-2", "Grace").await?;
            assert_eq!(ctx.len(), 2);
            Ok::<_, TransactionError>(())
        }
        .scope_boxed()
    })
    .await
    .unwrap();

    assert_eq!(documents.count("users"), 2);
    assert_eq!(kv.get("user:u-2:name").as_deref(), Some("Grace"));
    assert_eq!(documents.open_sessions(), 0);
    assert_eq!(kv.open_pipelines(), 0);
}

#[tokio::test]
async fn test_failure_after_writes_leaves_both_stores_untouched() {
    let documents = InMemoryDocumentStore::new();
    let kv = InMemoryKeyValueStore::new();

    let result: Result<()> = TransactionContext::run(|ctx| {
        let (documents, kv) = (&documents, &kv);
        async move {
            save_user(ctx, documents, kv, "u-1", "Ada").await?;
            Err(TransactionError::store("forced failure"))
        }
        .scope_boxed()
    })
    .await;

    assert!(result.is_err());
    assert_eq!(documents.count("users"), 0);
    assert!(kv.is_empty());
    assert_eq!(documents.sessions_ended(), 1);
    assert_eq!(kv.open_pipelines(), 0);
}

#[tokio::test]
async fn test_commit_failure_rolls_back_later_participants() {
    let documents = InMemoryDocumentStore::new();
    let kv = InMemoryKeyValueStore::new();
    documents.fail_next_commit("write conflict");

    let result: Result<()> = TransactionContext::run(|ctx| {
        let (documents, kv) = (&documents, &kv);
        async move { save_user(ctx, documents, kv, "u-1", "Ada").await }.scope_boxed()
    })
    .await;

    assert!(matches!(result, Err(TransactionError::Participant { .. })));
    assert_eq!(documents.count("users"), 0);
    assert!(kv.is_empty(), "key-value writes are discarded, not executed");
    assert_eq!(documents.open_sessions(), 0);
}

#[tokio::test]
async fn test_rollback_without_transaction_is_noop() {
    let documents = InMemoryDocumentStore::new();
    let session = documents.start_session().await.unwrap();
    let mut ctx = TransactionContext::new();
    ctx.register(DOCUMENT_KEY, DocumentParticipant::from_session(session))
        .unwrap();

    ctx.rollback().await.unwrap();
    ctx.rollback().await.unwrap();
    ctx.dispose().await.unwrap();

    assert_eq!(ctx.state(), ContextState::RolledBack);
    assert_eq!(documents.sessions_ended(), 1);
}

#[tokio::test]
async fn test_dispose_runs_once_for_every_sequence() {
    let sequences: [&[&str]; 5] = [
        &["commit"],
        &["rollback"],
        &["commit", "rollback"],
        &["rollback", "commit"],
        &["commit", "commit", "rollback", "rollback"],
    ];

    for ops in sequences {
        let documents = InMemoryDocumentStore::new();
        let mut participant = DocumentParticipant::begin(&documents).await.unwrap();

        for op in ops {
            match *op {
                "commit" => participant.commit().await.unwrap(),
                _ => participant.rollback().await.unwrap(),
            }
        }
        participant.dispose().await.unwrap();
        participant.dispose().await.unwrap();

        assert!(participant.state().is_terminal(), "{ops:?}");
        assert_eq!(documents.sessions_ended(), 1, "{ops:?}");
    }
}
