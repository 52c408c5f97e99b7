//! In-process document store with live queries
//!
//! Reference backend used by the CLI and the tests. Live queries keep a
//! window per listener and emit diff batches after every write, including
//! `Removed` for records pushed out of a limited window. Faults can be
//! injected to exercise the error paths of the sync layer.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Document, DocumentStore, Query, SetMode, SERVER_TIMESTAMP};
use crate::error::{Result, SyncError};
use crate::feed::{CancelHandle, Change, ChangeBatch, FeedItem, Subscription};

type Collection = BTreeMap<String, Map<String, Value>>;

/// Serializable contents of a `MemoryStore`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub collections: BTreeMap<String, Collection>,
    pub last_timestamp: i64,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    fail_next_writes: usize,
    failing_prefixes: Vec<String>,
}

struct Listener {
    id: u64,
    query: Query,
    tx: mpsc::UnboundedSender<FeedItem>,
    window: Vec<Document>,
}

#[derive(Default)]
struct StoreInner {
    collections: BTreeMap<String, Collection>,
    listeners: Vec<Listener>,
    next_listener: u64,
    last_timestamp: i64,
    faults: Faults,
}

/// Thread-safe in-memory `DocumentStore`.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let inner = StoreInner {
            collections: snapshot.collections,
            last_timestamp: snapshot.last_timestamp,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let inner = self.lock();
        StoreSnapshot {
            collections: inner.collections.clone(),
            last_timestamp: inner.last_timestamp,
        }
    }

    /// Load a snapshot file, or start empty if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No store snapshot at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)
            .map_err(|e| SyncError::Storage(format!("reading {}: {}", path.display(), e)))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)
            .map_err(|e| SyncError::Storage(format!("parsing {}: {}", path.display(), e)))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| SyncError::Storage(format!("creating {}: {}", dir.display(), e)))?;
        }
        let content = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| SyncError::Storage(format!("writing {}: {}", path.display(), e)))
    }

    // -- Fault injection --

    /// While offline every operation fails with `TransientNetwork`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().faults.offline = offline;
    }

    /// Fail the next `n` writes of any kind.
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().faults.fail_next_writes = n;
    }

    /// Fail every write whose `collection/id` path starts with `prefix`.
    pub fn fail_writes_under(&self, prefix: impl Into<String>) {
        self.lock().faults.failing_prefixes.push(prefix.into());
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// End every live feed with a transient error, as a dropped connection would.
    pub fn break_feeds(&self, reason: &str) {
        let listeners = std::mem::take(&mut self.lock().listeners);
        tracing::debug!("Breaking {} live feeds: {}", listeners.len(), reason);
        for listener in listeners {
            let _ = listener
                .tx
                .send(Err(SyncError::TransientNetwork(reason.to_string())));
        }
    }

    /// Re-send every listener window on `collection` as `Added` (duplicate delivery).
    pub fn redeliver(&self, collection: &str) {
        let inner = self.lock();
        for listener in inner.listeners.iter().filter(|l| l.query.collection == collection) {
            let batch: ChangeBatch<Document> =
                listener.window.iter().cloned().map(Change::added).collect();
            let _ = listener.tx.send(Ok(batch));
        }
    }

    // -- Inspection --

    /// Raw stored body, bypassing fault injection.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| Document::new(id, data.clone()))
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StoreInner {
    fn check_online(&self) -> Result<()> {
        if self.faults.offline {
            return Err(SyncError::TransientNetwork("store unreachable".to_string()));
        }
        Ok(())
    }

    fn check_write(&mut self, collection: &str, id: &str) -> Result<()> {
        self.check_online()?;
        if self.faults.fail_next_writes > 0 {
            self.faults.fail_next_writes -= 1;
            return Err(SyncError::TransientNetwork(format!(
                "write to {}/{} timed out",
                collection, id
            )));
        }
        let path = format!("{}/{}", collection, id);
        if self.faults.failing_prefixes.iter().any(|p| path.starts_with(p)) {
            return Err(SyncError::TransientNetwork(format!("write to {} rejected", path)));
        }
        Ok(())
    }

    /// Strictly increasing epoch milliseconds.
    fn next_timestamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .map(|(id, data)| Document::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn stored(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| Document::new(id, data.clone()))
    }

    fn put(&mut self, collection: &str, id: &str, data: Map<String, Value>) -> Document {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data.clone());
        self.notify(collection);
        Document::new(id, data)
    }

    /// Recompute every window on `collection` and send the differences.
    fn notify(&mut self, collection: &str) {
        let docs = self.documents(collection);
        self.listeners.retain_mut(|listener| {
            if listener.query.collection != collection {
                return true;
            }
            let window = listener.query.evaluate(docs.iter());
            let batch = diff_windows(&listener.window, &window);
            listener.window = window;
            if batch.is_empty() {
                return true;
            }
            listener.tx.send(Ok(batch)).is_ok()
        });
    }
}

fn diff_windows(old: &[Document], new: &[Document]) -> ChangeBatch<Document> {
    let previous: HashMap<&str, &Document> = old.iter().map(|d| (d.id.as_str(), d)).collect();
    let mut batch = Vec::new();
    for doc in new {
        match previous.get(doc.id.as_str()) {
            None => batch.push(Change::added(doc.clone())),
            Some(before) if before.data != doc.data => batch.push(Change::modified(doc.clone())),
            Some(_) => {}
        }
    }
    for doc in old {
        if !new.iter().any(|d| d.id == doc.id) {
            batch.push(Change::removed(doc.clone()));
        }
    }
    batch
}

/// Replace every `SERVER_TIMESTAMP` sentinel with `millis`.
fn resolve_sentinels(value: &mut Value, millis: i64) {
    match value {
        Value::String(s) if s == SERVER_TIMESTAMP => *value = Value::from(millis),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_sentinels(v, millis)),
        Value::Object(map) => map.values_mut().for_each(|v| resolve_sentinels(v, millis)),
        _ => {}
    }
}

fn resolve_body(inner: &mut StoreInner, mut data: Map<String, Value>) -> Map<String, Value> {
    let millis = inner.next_timestamp();
    data.values_mut().for_each(|v| resolve_sentinels(v, millis));
    data
}

/// Set `value` at a dotted `path`, creating intermediate objects.
fn set_path(data: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(leaf) = parts.pop() else {
        return;
    };
    let mut current = data;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(leaf.to_string(), value);
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let inner = self.lock();
        inner.check_online()?;
        Ok(inner.stored(collection, id))
    }

    async fn add(&self, collection: &str, data: Map<String, Value>) -> Result<Document> {
        let id = Uuid::new_v4().simple().to_string();
        let mut inner = self.lock();
        inner.check_write(collection, &id)?;
        let data = resolve_body(&mut inner, data);
        tracing::debug!("add {}/{}", collection, id);
        Ok(inner.put(collection, &id, data))
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(Document, bool)> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        if let Some(existing) = inner.stored(collection, id) {
            return Ok((existing, false));
        }
        let data = resolve_body(&mut inner, data);
        tracing::debug!("create {}/{}", collection, id);
        Ok((inner.put(collection, id, data), true))
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
        mode: SetMode,
    ) -> Result<Document> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        let data = resolve_body(&mut inner, data);
        let body = match (mode, inner.stored(collection, id)) {
            (SetMode::Merge, Some(mut existing)) => {
                existing.data.extend(data);
                existing.data
            }
            _ => data,
        };
        Ok(inner.put(collection, id, body))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Document> {
        let mut inner = self.lock();
        inner.check_write(collection, id)?;
        let Some(mut existing) = inner.stored(collection, id) else {
            return Err(SyncError::not_found(
                "document",
                format!("{}/{}", collection, id),
            ));
        };
        let patch = resolve_body(&mut inner, patch);
        for (path, value) in patch {
            set_path(&mut existing.data, &path, value);
        }
        Ok(inner.put(collection, id, existing.data))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let inner = self.lock();
        inner.check_online()?;
        let docs = inner.documents(&query.collection);
        Ok(query.evaluate(docs.iter()))
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription> {
        let mut inner = self.lock();
        inner.check_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let docs = inner.documents(&query.collection);
        let window = query.evaluate(docs.iter());
        let initial: ChangeBatch<Document> = window.iter().cloned().map(Change::added).collect();
        let _ = tx.send(Ok(initial));

        let id = inner.next_listener;
        inner.next_listener += 1;
        tracing::debug!("listener {} on {}", id, query.collection);
        inner.listeners.push(Listener {
            id,
            query,
            tx,
            window,
        });

        let cancel = CancelHandle::new();
        let store: Weak<Mutex<StoreInner>> = Arc::downgrade(&self.inner);
        cancel.on_cancel(move || {
            if let Some(store) = store.upgrade() {
                let mut inner = store.lock().unwrap_or_else(|e| e.into_inner());
                inner.listeners.retain(|l| l.id != id);
                tracing::debug!("listener {} released", id);
            }
        });
        Ok(Subscription::new(rx, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeOp;
    use crate::store::Direction;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_add_resolves_server_timestamp() {
        let store = MemoryStore::new();
        let a = store
            .add("items", body(json!({"createdAt": SERVER_TIMESTAMP})))
            .await
            .unwrap();
        let b = store
            .add("items", body(json!({"createdAt": SERVER_TIMESTAMP})))
            .await
            .unwrap();
        let ta = a.data["createdAt"].as_i64().unwrap();
        let tb = b.data["createdAt"].as_i64().unwrap();
        assert!(tb > ta);
    }

    #[tokio::test]
    async fn test_update_dotted_path_and_missing_doc() {
        let store = MemoryStore::new();
        store
            .set("m", "1", body(json!({"readBy": {}})), SetMode::Overwrite)
            .await
            .unwrap();
        let doc = store
            .update("m", "1", body(json!({"readBy.u1": {"userId": "u1"}})))
            .await
            .unwrap();
        assert_eq!(doc.field("readBy.u1.userId"), Some(&json!("u1")));

        let err = store.update("m", "nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_create_if_absent_is_idempotent() {
        let store = MemoryStore::new();
        let (_, created) = store
            .create_if_absent("chats", "dm_a_b", body(json!({"n": 1})))
            .await
            .unwrap();
        assert!(created);
        let (doc, created) = store
            .create_if_absent("chats", "dm_a_b", body(json!({"n": 2})))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(doc.data["n"], json!(1));
    }

    #[tokio::test]
    async fn test_live_query_window_eviction() {
        let store = MemoryStore::new();
        for (id, t) in [("a", 1), ("b", 2)] {
            store
                .set("m", id, body(json!({"t": t})), SetMode::Overwrite)
                .await
                .unwrap();
        }
        let query = Query::collection("m")
            .order_by("t", Direction::Descending)
            .limit(2);
        let mut sub = store.subscribe(query).await.unwrap();
        let initial = sub.next_batch().await.unwrap().unwrap();
        assert_eq!(initial.len(), 2);

        store
            .set("m", "c", body(json!({"t": 3})), SetMode::Overwrite)
            .await
            .unwrap();
        let batch = sub.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!((batch[0].op, batch[0].record.id.as_str()), (ChangeOp::Added, "c"));
        assert_eq!((batch[1].op, batch[1].record.id.as_str()), (ChangeOp::Removed, "a"));
    }

    #[tokio::test]
    async fn test_cancel_releases_listener() {
        let store = MemoryStore::new();
        let sub = store.subscribe(Query::collection("m")).await.unwrap();
        assert_eq!(store.listener_count(), 1);
        sub.cancel();
        sub.cancel();
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_faults() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.add("m", Map::new()).await.unwrap_err().is_transient());
        assert!(store.add("m", Map::new()).await.is_ok());

        store.fail_writes_under("chats/");
        assert!(store
            .set("chats", "c1", Map::new(), SetMode::Merge)
            .await
            .is_err());

        store.set_offline(true);
        assert!(store.query(&Query::collection("m")).await.is_err());
        store.clear_faults();
        assert_eq!(store.query(&Query::collection("m")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_break_feeds_ends_stream_with_error() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(Query::collection("m")).await.unwrap();
        let _ = sub.next_batch().await;
        store.break_feeds("connection reset");
        assert!(sub.next_batch().await.unwrap().is_err());
        assert!(sub.next_batch().await.is_none());
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_clock() {
        let store = MemoryStore::new();
        store.lock().last_timestamp = 42;
        let restored = MemoryStore::from_snapshot(store.snapshot());
        assert_eq!(restored.lock().last_timestamp, 42);
    }
}
