//! In-memory stores for local development and tests.
//!
//! Writes made inside a transaction are buffered by the session (or
//! pipeline) and applied atomically on commit, so an aborted transaction
//! leaves the store exactly as it was.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::{DocumentClient, DocumentSession, KeyValuePipeline, Result, TransactionError};

type Collections = HashMap<String, BTreeMap<String, Value>>;

#[derive(Default)]
struct DocumentState {
    collections: RwLock<Collections>,
    sessions_started: AtomicUsize,
    sessions_ended: AtomicUsize,
    commit_faults: Mutex<VecDeque<String>>,
}

/// Document store held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<DocumentState>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed document.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.state
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id).cloned())
    }

    /// Number of committed documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.state
            .collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Write outside of any session.
    pub fn insert(&self, collection: &str, id: &str, document: Value) {
        self.state
            .collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), document);
    }

    /// Sessions started and not yet ended.
    pub fn open_sessions(&self) -> usize {
        let started = self.state.sessions_started.load(Ordering::SeqCst);
        started - self.state.sessions_ended.load(Ordering::SeqCst)
    }

    /// Sessions ended so far.
    pub fn sessions_ended(&self) -> usize {
        self.state.sessions_ended.load(Ordering::SeqCst)
    }

    /// Make the next transaction commit fail with `message`.
    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.commit_faults.lock().push_back(message.into());
    }

    fn apply(&self, writes: Vec<DocumentWrite>) {
        let mut collections = self.state.collections.write();
        for write in writes {
            match write {
                DocumentWrite::Put { collection, id, document } => {
                    collections.entry(collection).or_default().insert(id, document);
                }
                DocumentWrite::Delete { collection, id } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&id);
                    }
                }
                DocumentWrite::Clear { collection } => {
                    collections.remove(&collection);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentClient for InMemoryDocumentStore {
    type Session = InMemoryDocumentSession;

    async fn start_session(&self) -> Result<Self::Session> {
        self.state.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryDocumentSession {
            store: self.clone(),
            writes: Vec::new(),
            in_transaction: false,
            ended: false,
        })
    }
}

enum DocumentWrite {
    Put { collection: String, id: String, document: Value },
    Delete { collection: String, id: String },
    Clear { collection: String },
}

/// Session on an [`InMemoryDocumentStore`].
pub struct InMemoryDocumentSession {
    store: InMemoryDocumentStore,
    writes: Vec<DocumentWrite>,
    in_transaction: bool,
    ended: bool,
}

impl InMemoryDocumentSession {
    /// Insert or replace a document.
    pub fn insert(&mut self, collection: &str, id: &str, document: Value) -> Result<()> {
        self.write(DocumentWrite::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
        })
    }

    /// Delete a document.
    pub fn delete(&mut self, collection: &str, id: &str) -> Result<()> {
        self.write(DocumentWrite::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        })
    }

    /// Delete every document in a collection.
    pub fn clear(&mut self, collection: &str) -> Result<()> {
        self.write(DocumentWrite::Clear {
            collection: collection.to_string(),
        })
    }

    /// Read a document, seeing this session's uncommitted writes.
    pub fn find(&self, collection: &str, id: &str) -> Option<Value> {
        let mut current = self.store.get(collection, id);
        for write in &self.writes {
            match write {
                DocumentWrite::Put {
                    collection: c,
                    id: i,
                    document,
                } if c == collection && i == id => {
                    current = Some(document.clone());
                }
                DocumentWrite::Delete { collection: c, id: i } if c == collection && i == id => {
                    current = None;
                }
                DocumentWrite::Clear { collection: c } if c == collection => current = None,
                _ => {}
            }
        }
        current
    }

    /// Writes waiting for commit.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    fn write(&mut self, write: DocumentWrite) -> Result<()> {
        if self.ended {
            return Err(TransactionError::SessionEnded);
        }
        if self.in_transaction {
            self.writes.push(write);
        } else {
            self.store.apply(vec![write]);
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentSession for InMemoryDocumentSession {
    async fn start_transaction(&mut self) -> Result<()> {
        if self.ended {
            return Err(TransactionError::SessionEnded);
        }
        if self.in_transaction {
            return Err(TransactionError::store("transaction already in progress"));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(TransactionError::store("no transaction started"));
        }
        if let Some(message) = self.store.state.commit_faults.lock().pop_front() {
            return Err(TransactionError::Store(message));
        }
        self.store.apply(std::mem::take(&mut self.writes));
        self.in_transaction = false;
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(TransactionError::store("no transaction started"));
        }
        self.writes.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn end_session(&mut self) -> Result<()> {
        if self.ended {
            return Err(TransactionError::SessionEnded);
        }
        // Ending a session aborts whatever it still has open.
        self.writes.clear();
        self.in_transaction = false;
        self.ended = true;
        self.store.state.sessions_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[derive(Default)]
struct KeyValueState {
    values: RwLock<HashMap<String, String>>,
    pipelines_opened: AtomicUsize,
    pipelines_closed: AtomicUsize,
    exec_faults: Mutex<VecDeque<String>>,
}

/// Key-value store held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    state: Arc<KeyValueState>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pipeline; commands are applied on `exec`.
    pub fn pipeline(&self) -> InMemoryPipeline {
        self.state.pipelines_opened.fetch_add(1, Ordering::SeqCst);
        InMemoryPipeline {
            store: self.clone(),
            commands: Vec::new(),
            closed: false,
        }
    }

    /// Committed value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.values.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pipelines opened and not yet quit.
    pub fn open_pipelines(&self) -> usize {
        let opened = self.state.pipelines_opened.load(Ordering::SeqCst);
        opened - self.state.pipelines_closed.load(Ordering::SeqCst)
    }

    /// Make the next `exec` fail with `message`.
    pub fn fail_next_exec(&self, message: impl Into<String>) {
        self.state.exec_faults.lock().push_back(message.into());
    }
}

enum KeyValueCommand {
    Set { key: String, value: String },
    Del { key: String },
}

/// Pipeline on an [`InMemoryKeyValueStore`].
pub struct InMemoryPipeline {
    store: InMemoryKeyValueStore,
    commands: Vec<KeyValueCommand>,
    closed: bool,
}

impl InMemoryPipeline {
    /// Queue a `SET`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.commands.push(KeyValueCommand::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Queue a `DEL`.
    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.commands.push(KeyValueCommand::Del { key: key.into() });
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(TransactionError::SessionEnded)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValuePipeline for InMemoryPipeline {
    fn queued(&self) -> usize {
        self.commands.len()
    }

    async fn exec(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(message) = self.store.state.exec_faults.lock().pop_front() {
            return Err(TransactionError::Store(message));
        }

        let mut values = self.store.state.values.write();
        for command in self.commands.drain(..) {
            match command {
                KeyValueCommand::Set { key, value } => {
                    values.insert(key, value);
                }
                KeyValueCommand::Del { key } => {
                    values.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.commands.clear();
        Ok(())
    }

    async fn quit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        self.commands.clear();
        self.store.state.pipelines_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_reads_own_writes_until_abort() {
        let store = InMemoryDocumentStore::new();
        store.insert("users", "u-1", json!({"name": "Ada"}));

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.insert("users", "u-1", json!({"name": "Grace"})).unwrap();
        session.insert("users", "u-2", json!({"name": "Linus"})).unwrap();

        assert_eq!(session.find("users", "u-1"), Some(json!({"name": "Grace"})));
        assert_eq!(store.get("users", "u-1"), Some(json!({"name": "Ada"})));

        session.abort_transaction().await.unwrap();
        session.end_session().await.unwrap();

        assert_eq!(store.get("users", "u-1"), Some(json!({"name": "Ada"})));
        assert_eq!(store.count("users"), 1);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_commit_applies_delete_and_clear() {
        let store = InMemoryDocumentStore::new();
        store.insert("users", "u-1", json!({}));
        store.insert("channels", "c-1", json!({}));

        let mut session = store.start_session().await.unwrap();
        session.start_transaction().await.unwrap();
        session.delete("users", "u-1").unwrap();
        session.clear("channels").unwrap();
        session.commit_transaction().await.unwrap();

        assert_eq!(store.count("users"), 0);
        assert_eq!(store.count("channels"), 0);
    }

    #[tokio::test]
    async fn test_session_cannot_end_twice() {
        let store = InMemoryDocumentStore::new();
        let mut session = store.start_session().await.unwrap();

        session.end_session().await.unwrap();
        assert!(matches!(session.end_session().await, Err(TransactionError::SessionEnded)));
        assert!(session.insert("users", "u-1", json!({})).is_err());
    }

    #[tokio::test]
    async fn test_pipeline_applies_on_exec() {
        let store = InMemoryKeyValueStore::new();
        let mut pipeline = store.pipeline();
        pipeline.set("user:1", "Ada").set("user:2", "Grace").del("user:2");

        assert_eq!(pipeline.queued(), 3);
        assert!(store.is_empty());

        pipeline.exec().await.unwrap();
        pipeline.quit().await.unwrap();

        assert_eq!(store.get("user:1").as_deref(), Some("Ada"));
        assert_eq!(store.get("user:2"), None);
        assert_eq!(store.open_pipelines(), 0);
    }

    #[tokio::test]
    async fn test_exec_fault_keeps_store_untouched() {
        let store = InMemoryKeyValueStore::new();
        store.fail_next_exec("connection reset");
        let mut pipeline = store.pipeline();
        pipeline.set("k", "v");

        assert!(pipeline.exec().await.is_err());
        assert!(store.is_empty());
    }
}
