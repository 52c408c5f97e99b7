//! Per-chat message logs
//!
//! Each chat keeps an ordered, id-deduplicated log fed by a live window over
//! its most recent messages, extended backwards one page at a time. Messages
//! become visible only through the store (the feed or an older-page query);
//! sends are never appended locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use super::unread::UnreadAccounting;
use crate::error::{Result, SyncError};
use crate::feed::{
    decode_batch, spawn_pump, AttachHandle, ChangeBatch, ChangeOp, FeedItem, FeedStatus,
};
use crate::models::{ChatId, Message, MessageId, Timestamp, UserId};
use crate::store::{messages_collection, Cursor, Direction, DocumentStore, Query, CHATS};

#[derive(Debug)]
struct ChatLog {
    entries: BTreeMap<(Timestamp, MessageId), Message>,
    index: HashMap<MessageId, Timestamp>,
    has_more: bool,
    /// Set once the first window has been merged.
    primed: bool,
    loading_older: bool,
    status: FeedStatus,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            has_more: true,
            primed: false,
            loading_older: false,
            status: FeedStatus::Detached,
        }
    }
}

impl ChatLog {
    /// Insert a message, or refresh the known copy. Returns true for a new id.
    fn upsert(&mut self, message: Message) -> bool {
        match self.index.get(&message.id).copied() {
            Some(created_at) => {
                let key = (created_at, message.id.clone());
                let merged = match self.entries.remove(&key) {
                    Some(mut existing) => {
                        existing.absorb(message);
                        existing
                    }
                    None => message,
                };
                self.index.insert(merged.id.clone(), merged.created_at);
                self.entries
                    .insert((merged.created_at, merged.id.clone()), merged);
                false
            }
            None => {
                self.index.insert(message.id.clone(), message.created_at);
                self.entries
                    .insert((message.created_at, message.id.clone()), message);
                true
            }
        }
    }

    fn oldest(&self) -> Option<&Message> {
        self.entries.values().next()
    }
}

type SharedLog = Arc<Mutex<ChatLog>>;

pub struct MessageStore {
    remote: Arc<dyn DocumentStore>,
    viewer_id: UserId,
    page_size: usize,
    unread: Arc<UnreadAccounting>,
    logs: Mutex<HashMap<ChatId, SharedLog>>,
    revision: watch::Sender<u64>,
}

impl MessageStore {
    pub fn new(
        remote: Arc<dyn DocumentStore>,
        viewer_id: impl Into<UserId>,
        page_size: usize,
        unread: Arc<UnreadAccounting>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            viewer_id: viewer_id.into(),
            page_size: page_size.max(1),
            unread,
            logs: Mutex::new(HashMap::new()),
            revision: watch::channel(0).0,
        })
    }

    fn log(&self, chat_id: &str) -> SharedLog {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(chat_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_log(&self, chat_id: &str) -> Option<SharedLog> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(chat_id)
            .cloned()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Follow the most recent page of `chat_id` live.
    ///
    /// The returned handle detaches the feed when cancelled or dropped; no
    /// merge from this feed runs after `cancel()` returns.
    pub async fn attach(self: &Arc<Self>, chat_id: &str) -> Result<AttachHandle> {
        if self.remote.get(CHATS, chat_id).await?.is_none() {
            return Err(SyncError::not_found("chat", chat_id));
        }

        let query = Query::collection(messages_collection(chat_id))
            .order_by("createdAt", Direction::Descending)
            .limit(self.page_size);
        let subscription = self.remote.subscribe(query).await?;
        let cancel = subscription.cancel_handle();

        let log = self.log(chat_id);
        {
            let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
            guard.status = FeedStatus::Connecting;
            guard.primed = false;
        }

        // Cancellation waits for an in-flight merge, then marks the log detached.
        let barrier = log.clone();
        cancel.on_cancel(move || {
            let mut guard = barrier.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(guard.status, FeedStatus::Disconnected(_)) {
                guard.status = FeedStatus::Detached;
            }
        });

        tracing::debug!("Attached message feed for {}", chat_id);
        let store = Arc::clone(self);
        let chat_id = chat_id.to_string();
        let feed_cancel = cancel.clone();
        Ok(spawn_pump(subscription, move |item: FeedItem| {
            let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
            if feed_cancel.is_cancelled() {
                return false;
            }
            let keep_going = match item {
                Ok(batch) => {
                    store.merge(&chat_id, &mut guard, decode_batch(batch));
                    guard.status = FeedStatus::Live;
                    true
                }
                Err(e) => {
                    tracing::warn!("Message feed for {} failed: {:#}", chat_id, e);
                    guard.status = FeedStatus::Disconnected(e.to_string());
                    false
                }
            };
            drop(guard);
            store.bump();
            keep_going
        }))
    }

    /// Merge a decoded batch into a chat's log, as if delivered by its feed.
    pub fn apply_batch(&self, chat_id: &str, batch: ChangeBatch<Message>) {
        let log = self.log(chat_id);
        {
            let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
            self.merge(chat_id, &mut guard, batch);
        }
        self.bump();
    }

    fn merge(&self, chat_id: &str, log: &mut ChatLog, batch: ChangeBatch<Message>) {
        let first = !log.primed;
        let mut live = 0;
        for change in batch {
            match change.op {
                ChangeOp::Added | ChangeOp::Modified => {
                    live += 1;
                    let message = change.record;
                    if message.chat_id != chat_id {
                        tracing::warn!(
                            "Ignoring message {} for chat {} on feed of {}",
                            message.id,
                            message.chat_id,
                            chat_id
                        );
                        continue;
                    }
                    let arrived = message.clone();
                    if log.upsert(message) {
                        self.unread
                            .on_message_arrived(chat_id, &arrived, &self.viewer_id);
                    }
                }
                // Left the recent window; older pages still show it.
                ChangeOp::Removed => {
                    tracing::debug!("Message {} left the live window", change.record.id);
                }
            }
        }
        if first {
            log.primed = true;
            log.has_more = live >= self.page_size;
        }
    }

    /// Fetch the page just older than the oldest loaded message.
    ///
    /// Returns how many messages were prepended; 0 once history is exhausted
    /// or while another page load for the chat is still running.
    pub async fn load_older(&self, chat_id: &str) -> Result<usize> {
        let log = self.log(chat_id);
        let cursor = {
            let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
            if guard.loading_older || !guard.has_more {
                return Ok(0);
            }
            guard.loading_older = true;
            guard.oldest().map(|m| Cursor {
                value: Value::from(m.created_at.timestamp_millis()),
                id: m.id.clone(),
            })
        };

        // One extra record tells whether anything lies beyond this page.
        let mut query = Query::collection(messages_collection(chat_id))
            .order_by("createdAt", Direction::Descending)
            .limit(self.page_size + 1);
        if let Some(cursor) = cursor {
            query = query.start_after(cursor);
        }
        let result = self.remote.query(&query).await;

        let mut guard = log.lock().unwrap_or_else(|e| e.into_inner());
        guard.loading_older = false;
        let docs = result?;

        guard.has_more = docs.len() > self.page_size;
        let mut added = 0;
        for doc in docs.into_iter().take(self.page_size) {
            match doc.decode::<Message>() {
                Ok(message) => {
                    if guard.upsert(message) {
                        added += 1;
                    }
                }
                Err(e) => tracing::warn!("Skipping message in {}: {:#}", chat_id, e),
            }
        }
        drop(guard);

        tracing::debug!("Loaded {} older messages in {}", added, chat_id);
        self.bump();
        Ok(added)
    }

    /// Loaded messages in display order: `(created_at, id)` ascending.
    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.existing_log(chat_id)
            .map(|log| {
                log.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entries
                    .values()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn message(&self, chat_id: &str, message_id: &str) -> Option<Message> {
        let log = self.existing_log(chat_id)?;
        let guard = log.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = *guard.index.get(message_id)?;
        guard
            .entries
            .get(&(created_at, message_id.to_string()))
            .cloned()
    }

    /// Whether older history may still exist on the server.
    pub fn has_more(&self, chat_id: &str) -> bool {
        self.existing_log(chat_id)
            .map_or(true, |log| log.lock().unwrap_or_else(|e| e.into_inner()).has_more)
    }

    pub fn status(&self, chat_id: &str) -> FeedStatus {
        self.existing_log(chat_id)
            .map(|log| log.lock().unwrap_or_else(|e| e.into_inner()).status.clone())
            .unwrap_or_default()
    }

    /// Ids of loaded messages from others that `viewer_id` has not read yet.
    pub fn unread_by(&self, chat_id: &str, viewer_id: &str) -> Vec<MessageId> {
        self.existing_log(chat_id)
            .map(|log| {
                log.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entries
                    .values()
                    .filter(|m| m.sender_id != viewer_id && !m.is_read_by(viewer_id))
                    .map(|m| m.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Change;
    use crate::models::{timestamp_from_millis, MessageContent, ReadReceipt};
    use crate::store::{to_body, MemoryStore, RetryPolicy, RetryingStore};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn message(id: &str, sender: &str, millis: i64, text: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: "c1".into(),
            sender_id: sender.into(),
            content: MessageContent::text(text),
            reply_to_message_id: None,
            created_at: timestamp_from_millis(millis),
            updated_at: None,
            delivered_to: BTreeSet::new(),
            read_by: BTreeMap::new(),
        }
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn store_for(memory: &MemoryStore, page_size: usize) -> Arc<MessageStore> {
        let remote: Arc<dyn DocumentStore> = Arc::new(memory.clone());
        let unread = UnreadAccounting::new(remote.clone(), 10);
        MessageStore::new(remote, "alice", page_size, unread)
    }

    async fn seed(memory: &MemoryStore, count: i64) {
        memory
            .set(
                CHATS,
                "c1",
                json!({
                    "kind": "direct",
                    "memberIds": ["alice", "bob"],
                    "createdAt": 0,
                    "createdBy": "alice",
                })
                .as_object()
                .cloned()
                .unwrap(),
                crate::store::SetMode::Overwrite,
            )
            .await
            .unwrap();
        for i in 1..=count {
            let msg = message(&format!("m{:02}", i), "bob", i * 10, "hi");
            memory
                .set(
                    &messages_collection("c1"),
                    &msg.id,
                    to_body(&msg).unwrap(),
                    crate::store::SetMode::Overwrite,
                )
                .await
                .unwrap();
        }
    }

    async fn wait_for(store: &MessageStore, chat: &str, count: usize) {
        let mut changes = store.changes();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.messages(chat).len() < count {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_reordered_batch_displays_ascending() {
        let memory = MemoryStore::new();
        let store = store_for(&memory, 50);
        store.apply_batch(
            "c1",
            vec![
                Change::added(message("m2", "bob", 3, "yo")),
                Change::added(message("m1", "bob", 1, "hi")),
            ],
        );
        assert_eq!(ids(&store.messages("c1")), vec!["m1", "m2"]);
    }

    #[test]
    fn test_duplicate_delivery_keeps_one_entry() {
        let memory = MemoryStore::new();
        let store = store_for(&memory, 50);
        let first = message("m1", "bob", 1, "hi");
        let mut echoed = first.clone();
        echoed.read_by.insert(
            "alice".into(),
            ReadReceipt {
                user_id: "alice".into(),
                read_at: timestamp_from_millis(5),
            },
        );
        store.apply_batch("c1", vec![Change::added(first.clone())]);
        store.apply_batch("c1", vec![Change::modified(echoed)]);
        // A stale copy cannot drop the receipt again.
        store.apply_batch("c1", vec![Change::added(first)]);

        let messages = store.messages("c1");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_read_by("alice"));
    }

    #[test]
    fn test_same_timestamp_orders_by_id() {
        let memory = MemoryStore::new();
        let store = store_for(&memory, 50);
        store.apply_batch(
            "c1",
            vec![
                Change::added(message("b", "bob", 7, "x")),
                Change::added(message("a", "bob", 7, "y")),
            ],
        );
        assert_eq!(ids(&store.messages("c1")), vec!["a", "b"]);
    }

    #[test]
    fn test_removed_keeps_message() {
        let memory = MemoryStore::new();
        let store = store_for(&memory, 50);
        let msg = message("m1", "bob", 1, "hi");
        store.apply_batch("c1", vec![Change::added(msg.clone())]);
        store.apply_batch("c1", vec![Change::removed(msg)]);
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_chat_is_not_found() {
        let memory = MemoryStore::new();
        let store = store_for(&memory, 50);
        let Err(err) = store.attach("nope").await else {
            panic!("attaching an unknown chat succeeded");
        };
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_attach_loads_recent_window_then_pages_back() {
        let memory = MemoryStore::new();
        seed(&memory, 7).await;
        let store = store_for(&memory, 3);

        let _handle = store.attach("c1").await.unwrap();
        wait_for(&store, "c1", 3).await;
        assert_eq!(ids(&store.messages("c1")), vec!["m05", "m06", "m07"]);
        assert!(store.has_more("c1"));

        assert_eq!(store.load_older("c1").await.unwrap(), 3);
        assert!(store.has_more("c1"));
        assert_eq!(store.load_older("c1").await.unwrap(), 1);
        assert!(!store.has_more("c1"));
        assert_eq!(store.load_older("c1").await.unwrap(), 0);
        assert_eq!(store.messages("c1").len(), 7);
        assert_eq!(store.messages("c1")[0].id, "m01");
    }

    #[tokio::test]
    async fn test_load_older_exhausts_small_chat() {
        let memory = MemoryStore::new();
        seed(&memory, 4).await;
        let store = store_for(&memory, 10);

        let mut total = 0;
        for _ in 0..3 {
            total += store.load_older("c1").await.unwrap();
        }
        assert_eq!(total, 4);
        assert!(!store.has_more("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_older_skips_while_page_in_flight() {
        let memory = MemoryStore::new();
        seed(&memory, 4).await;
        let remote: Arc<dyn DocumentStore> = Arc::new(RetryingStore::new(
            Arc::new(memory.clone()),
            RetryPolicy::default(),
        ));
        let unread = UnreadAccounting::new(remote.clone(), 10);
        let store = MessageStore::new(remote, "alice", 10, unread);

        // The first page load stalls in retry backoff.
        memory.set_offline(true);
        let first = tokio::spawn({
            let store = store.clone();
            async move { store.load_older("c1").await }
        });
        for _ in 0..100 {
            if store.log("c1").lock().unwrap().loading_older {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(store.log("c1").lock().unwrap().loading_older);

        assert_eq!(store.load_older("c1").await.unwrap(), 0);
        assert!(store.messages("c1").is_empty());

        memory.set_offline(false);
        assert_eq!(first.await.unwrap().unwrap(), 4);
        assert_eq!(store.messages("c1").len(), 4);
        assert!(!store.has_more("c1"));
    }

    #[tokio::test]
    async fn test_live_arrival_and_unread_count() {
        let memory = MemoryStore::new();
        seed(&memory, 2).await;
        let store = store_for(&memory, 50);
        let _handle = store.attach("c1").await.unwrap();
        wait_for(&store, "c1", 2).await;
        // Both seeded messages are inbound and unread.
        assert_eq!(store.unread.count("c1"), 2);

        let own = message("m99", "alice", 999, "mine");
        memory
            .set(
                &messages_collection("c1"),
                "m99",
                to_body(&own).unwrap(),
                crate::store::SetMode::Overwrite,
            )
            .await
            .unwrap();
        wait_for(&store, "c1", 3).await;
        assert_eq!(store.unread.count("c1"), 2);
        assert_eq!(store.unread_by("c1", "alice").len(), 2);
    }

    #[tokio::test]
    async fn test_no_merge_after_cancel() {
        let memory = MemoryStore::new();
        seed(&memory, 1).await;
        let store = store_for(&memory, 50);
        let handle = store.attach("c1").await.unwrap();
        wait_for(&store, "c1", 1).await;

        handle.cancel();
        assert_eq!(memory.listener_count(), 0);
        assert_eq!(store.status("c1"), FeedStatus::Detached);

        let late = message("m50", "bob", 500, "late");
        memory
            .set(
                &messages_collection("c1"),
                "m50",
                to_body(&late).unwrap(),
                crate::store::SetMode::Overwrite,
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(store.messages("c1").len(), 1);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_feed_error_marks_disconnected() {
        let memory = MemoryStore::new();
        seed(&memory, 1).await;
        let store = store_for(&memory, 50);
        let _handle = store.attach("c1").await.unwrap();
        wait_for(&store, "c1", 1).await;

        let mut changes = store.changes();
        memory.break_feeds("connection reset");
        changes.changed().await.unwrap();
        assert!(matches!(store.status("c1"), FeedStatus::Disconnected(_)));
        // Loaded messages stay visible.
        assert_eq!(store.messages("c1").len(), 1);
    }
}
