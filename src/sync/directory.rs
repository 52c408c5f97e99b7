//! Chat directory
//!
//! Mirrors the set of chats a user belongs to, ordered by recency, and
//! creates new direct and group chats.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tokio::sync::watch;

use super::unread::UnreadAccounting;
use super::users::UserCache;
use crate::error::{Result, SyncError};
use crate::feed::{
    decode_batch, spawn_pump, AttachHandle, ChangeBatch, ChangeOp, FeedItem, FeedStatus,
};
use crate::models::{direct_chat_id, placeholder_name, Chat, ChatId, ChatKind, UserId};
use crate::store::{DocumentStore, Query, CHATS, SERVER_TIMESTAMP};

#[derive(Default)]
struct DirectoryState {
    chats: HashMap<ChatId, Chat>,
    /// Chat ids, most recent first.
    order: Vec<ChatId>,
    primed: bool,
    status: FeedStatus,
}

impl DirectoryState {
    fn reorder(&mut self) {
        let mut ranked: Vec<&Chat> = self.chats.values().collect();
        ranked.sort_by(|a, b| b.recency().cmp(&a.recency()).then_with(|| a.id.cmp(&b.id)));
        self.order = ranked.into_iter().map(|c| c.id.clone()).collect();
    }
}

pub struct ChatDirectory {
    remote: Arc<dyn DocumentStore>,
    viewer_id: UserId,
    users: Arc<UserCache>,
    unread: Arc<UnreadAccounting>,
    state: Arc<Mutex<DirectoryState>>,
    revision: watch::Sender<u64>,
}

impl ChatDirectory {
    pub fn new(
        remote: Arc<dyn DocumentStore>,
        viewer_id: impl Into<UserId>,
        users: Arc<UserCache>,
        unread: Arc<UnreadAccounting>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            viewer_id: viewer_id.into(),
            users,
            unread,
            state: Arc::new(Mutex::new(DirectoryState::default())),
            revision: watch::channel(0).0,
        })
    }

    /// Follow every chat whose members include `user_id`.
    pub async fn attach(self: &Arc<Self>, user_id: &str) -> Result<AttachHandle> {
        let query = Query::collection(CHATS).where_array_contains("memberIds", user_id);
        let subscription = self.remote.subscribe(query).await?;
        let cancel = subscription.cancel_handle();
        self.lock().status = FeedStatus::Connecting;

        let barrier = Arc::clone(&self.state);
        cancel.on_cancel(move || {
            let mut state = barrier.lock().unwrap_or_else(|e| e.into_inner());
            if !matches!(state.status, FeedStatus::Disconnected(_)) {
                state.status = FeedStatus::Detached;
            }
        });

        tracing::debug!("Attached chat list for {}", user_id);
        let directory = Arc::clone(self);
        let feed_cancel = cancel.clone();
        Ok(spawn_pump(subscription, move |item: FeedItem| {
            let mut state = directory.lock();
            if feed_cancel.is_cancelled() {
                return false;
            }
            let keep_going = match item {
                Ok(batch) => {
                    directory.merge(&mut state, decode_batch(batch));
                    state.status = FeedStatus::Live;
                    true
                }
                Err(e) => {
                    tracing::warn!("Chat list feed failed: {:#}", e);
                    state.status = FeedStatus::Disconnected(e.to_string());
                    false
                }
            };
            drop(state);
            directory.revision.send_modify(|r| *r += 1);
            keep_going
        }))
    }

    /// Merge a decoded batch, as if delivered by the chat-list feed.
    pub fn apply_batch(&self, batch: ChangeBatch<Chat>) {
        {
            let mut state = self.lock();
            self.merge(&mut state, batch);
        }
        self.revision.send_modify(|r| *r += 1);
    }

    fn merge(&self, state: &mut DirectoryState, batch: ChangeBatch<Chat>) {
        for change in batch {
            let chat = change.record;
            match change.op {
                ChangeOp::Added | ChangeOp::Modified => {
                    if let Err(e) = chat.validate() {
                        tracing::warn!("Skipping chat {}: {:#}", chat.id, e);
                        continue;
                    }
                    let previous = state
                        .chats
                        .get(&chat.id)
                        .and_then(|c| c.last_message_preview.as_ref())
                        .map(|p| p.message_id.clone());
                    if state.primed {
                        if let Some(ref preview) = chat.last_message_preview {
                            if previous.as_deref() != Some(preview.message_id.as_str()) {
                                self.unread
                                    .on_preview_arrived(&chat.id, preview, &self.viewer_id);
                            }
                        }
                    }
                    state.chats.insert(chat.id.clone(), chat);
                }
                ChangeOp::Removed => {
                    tracing::debug!("Chat {} left the directory", chat.id);
                    state.chats.remove(&chat.id);
                }
            }
        }
        state.primed = true;
        state.reorder();
    }

    /// Chats ordered by last activity, most recent first.
    pub fn chats(&self) -> Vec<Chat> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.chats.get(id).cloned())
            .collect()
    }

    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.lock().chats.get(chat_id).cloned()
    }

    pub fn status(&self) -> FeedStatus {
        self.lock().status.clone()
    }

    /// Point read of a single chat, bypassing the live list.
    pub async fn load_chat(&self, chat_id: &str) -> Result<Chat> {
        match self.remote.get(CHATS, chat_id).await? {
            Some(doc) => doc.decode(),
            None => Err(SyncError::not_found("chat", chat_id)),
        }
    }

    /// Title to show for `chat`. Never waits on the network.
    ///
    /// For a direct chat whose counterpart is not cached yet, a placeholder is
    /// returned and the profile is fetched in the background.
    pub fn resolve_display_name(&self, chat: &Chat, viewer_id: &str) -> String {
        match chat.kind {
            ChatKind::Group => chat
                .group_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or("Group")
                .to_string(),
            ChatKind::Direct => {
                let Some(other) = chat.counterpart(viewer_id) else {
                    return "Direct chat".to_string();
                };
                match self.users.cached(other) {
                    Some(user) => user.display_name,
                    None => {
                        self.users.prefetch(other);
                        placeholder_name(other)
                    }
                }
            }
        }
    }

    /// Find or create the direct chat between `self_id` and `other_id`.
    pub async fn create_direct(&self, self_id: &str, other_id: &str) -> Result<ChatId> {
        if self_id == other_id {
            return Err(SyncError::validation("cannot start a direct chat with yourself"));
        }
        if self.users.get(other_id).await?.is_none() {
            return Err(SyncError::not_found("user", other_id));
        }

        let is_pair = |chat: &Chat| {
            chat.kind == ChatKind::Direct && chat.is_member(self_id) && chat.is_member(other_id)
        };
        let mut existing: Vec<Chat> = self
            .lock()
            .chats
            .values()
            .filter(|c| is_pair(c))
            .cloned()
            .collect();
        if existing.is_empty() {
            let query = Query::collection(CHATS)
                .where_eq("kind", "direct")
                .where_array_contains("memberIds", self_id);
            existing = self
                .remote
                .query(&query)
                .await?
                .iter()
                .filter_map(|doc| doc.decode::<Chat>().ok())
                .filter(|c| is_pair(c))
                .collect();
        }

        if !existing.is_empty() {
            if existing.len() > 1 {
                tracing::warn!(
                    "Found {} direct chats between {} and {}, using the oldest",
                    existing.len(),
                    self_id,
                    other_id
                );
            }
            existing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            return Ok(existing.swap_remove(0).id);
        }

        let chat_id = direct_chat_id(self_id, other_id);
        let members: BTreeSet<&str> = [self_id, other_id].into_iter().collect();
        let body = object(json!({
            "kind": "direct",
            "memberIds": members,
            "createdAt": SERVER_TIMESTAMP,
            "createdBy": self_id,
        }));
        let (doc, created) = self
            .remote
            .create_if_absent(CHATS, &chat_id, body.clone())
            .await?;
        if created {
            tracing::info!("Created direct chat {}", chat_id);
            return Ok(chat_id);
        }
        match doc.decode::<Chat>() {
            Ok(chat) if is_pair(&chat) => {
                tracing::debug!("Direct chat {} already existed", chat_id);
                Ok(chat_id)
            }
            _ => {
                tracing::warn!(
                    "Chat {} belongs to other members, allocating a new id",
                    chat_id
                );
                let doc = self.remote.add(CHATS, body).await?;
                Ok(doc.id)
            }
        }
    }

    /// Create a group chat. The creator always ends up a member and an admin.
    pub async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
        creator_id: &str,
    ) -> Result<ChatId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::validation("group name must not be blank"));
        }
        let mut members: BTreeSet<&str> = member_ids.iter().map(String::as_str).collect();
        members.insert(creator_id);
        if members.len() < 2 {
            return Err(SyncError::validation("a group needs at least one other member"));
        }

        let body = object(json!({
            "kind": "group",
            "memberIds": members,
            "createdAt": SERVER_TIMESTAMP,
            "createdBy": creator_id,
            "groupName": name,
            "admins": [creator_id],
        }));
        let doc = self.remote.add(CHATS, body).await?;
        tracing::info!("Created group {} ({} members)", doc.id, members.len());
        Ok(doc.id)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Change;
    use crate::models::{timestamp_from_millis, MessageKind, MessagePreview, User};
    use crate::store::MemoryStore;
    use crate::sync::users::StoreUserProvider;
    use std::time::Duration;

    struct Fixture {
        memory: MemoryStore,
        users: Arc<UserCache>,
        unread: Arc<UnreadAccounting>,
        directory: Arc<ChatDirectory>,
    }

    async fn fixture() -> Fixture {
        let memory = MemoryStore::new();
        let remote: Arc<dyn DocumentStore> = Arc::new(memory.clone());
        let provider = Arc::new(StoreUserProvider::new(remote.clone()));
        for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
            provider
                .put_user(&User::new(id, name, timestamp_from_millis(1)))
                .await
                .unwrap();
        }
        let users = UserCache::new(provider);
        let unread = UnreadAccounting::new(remote.clone(), 10);
        let directory = ChatDirectory::new(remote, "alice", users.clone(), unread.clone());
        Fixture {
            memory,
            users,
            unread,
            directory,
        }
    }

    fn chat(id: &str, kind: ChatKind, members: &[&str], created: i64) -> Chat {
        Chat {
            id: id.into(),
            kind,
            member_ids: members.iter().map(|m| m.to_string()).collect(),
            created_at: timestamp_from_millis(created),
            created_by: members[0].into(),
            last_message_preview: None,
            group_name: None,
            group_photo: None,
            description: None,
            admins: None,
        }
    }

    fn preview(message_id: &str, sender: &str, at: i64) -> MessagePreview {
        MessagePreview {
            message_id: message_id.into(),
            text: "hi".into(),
            sender_id: sender.into(),
            created_at: timestamp_from_millis(at),
            kind: MessageKind::Text,
        }
    }

    #[tokio::test]
    async fn test_orders_by_recency() {
        let f = fixture().await;
        let mut old_with_message = chat("a", ChatKind::Direct, &["alice", "bob"], 10);
        old_with_message.last_message_preview = Some(preview("m1", "bob", 500));
        f.directory.apply_batch(vec![
            Change::added(old_with_message),
            Change::added(chat("b", ChatKind::Direct, &["alice", "carol"], 100)),
            Change::added(chat("c", ChatKind::Group, &["alice", "bob", "carol"], 200)),
        ]);
        let order: Vec<String> = f.directory.chats().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec!["a", "c", "b"]);

        f.directory
            .apply_batch(vec![Change::removed(chat("c", ChatKind::Group, &["alice", "bob"], 200))]);
        assert_eq!(f.directory.chats().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_chat_skipped() {
        let f = fixture().await;
        f.directory
            .apply_batch(vec![Change::added(chat("x", ChatKind::Direct, &["alice"], 1))]);
        assert!(f.directory.chats().is_empty());
    }

    #[tokio::test]
    async fn test_new_preview_counts_as_arrival() {
        let f = fixture().await;
        let mut c = chat("a", ChatKind::Direct, &["alice", "bob"], 10);
        c.last_message_preview = Some(preview("m1", "bob", 20));
        // Initial snapshot: previews there already are not new arrivals.
        f.directory.apply_batch(vec![Change::added(c.clone())]);
        assert_eq!(f.unread.count("a"), 0);

        c.last_message_preview = Some(preview("m2", "bob", 30));
        f.directory.apply_batch(vec![Change::modified(c.clone())]);
        f.directory.apply_batch(vec![Change::modified(c.clone())]);
        assert_eq!(f.unread.count("a"), 1);

        c.last_message_preview = Some(preview("m3", "alice", 40));
        f.directory.apply_batch(vec![Change::modified(c)]);
        assert_eq!(f.unread.count("a"), 1);
    }

    #[tokio::test]
    async fn test_display_name_placeholder_then_cached() {
        let f = fixture().await;
        let direct = chat("d", ChatKind::Direct, &["alice", "bob"], 1);
        let mut changes = f.users.changes();
        assert_eq!(f.directory.resolve_display_name(&direct, "alice"), "User bob");
        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.directory.resolve_display_name(&direct, "alice"), "Bob");

        let mut group = chat("g", ChatKind::Group, &["alice", "bob"], 1);
        assert_eq!(f.directory.resolve_display_name(&group, "alice"), "Group");
        group.group_name = Some("Climbing".into());
        assert_eq!(f.directory.resolve_display_name(&group, "alice"), "Climbing");
    }

    #[tokio::test]
    async fn test_create_direct_is_idempotent() {
        let f = fixture().await;
        let first = f.directory.create_direct("alice", "bob").await.unwrap();
        let second = f.directory.create_direct("alice", "bob").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, direct_chat_id("alice", "bob"));

        let chat: Chat = f.memory.document(CHATS, &first).unwrap().decode().unwrap();
        assert_eq!(chat.kind, ChatKind::Direct);
        assert_eq!(chat.member_ids.len(), 2);
        assert_eq!(chat.created_by, "alice");
    }

    #[tokio::test]
    async fn test_create_direct_concurrent_does_not_fail() {
        let f = fixture().await;
        let (a, b) = tokio::join!(
            f.directory.create_direct("alice", "bob"),
            f.directory.create_direct("alice", "bob"),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_create_direct_reuses_legacy_chat() {
        let f = fixture().await;
        let legacy = chat("legacy", ChatKind::Direct, &["alice", "bob"], 5);
        f.memory
            .set(
                CHATS,
                "legacy",
                crate::store::to_body(&legacy).unwrap(),
                crate::store::SetMode::Overwrite,
            )
            .await
            .unwrap();
        assert_eq!(f.directory.create_direct("bob", "alice").await.unwrap(), "legacy");
    }

    async fn seed_chat(f: &Fixture, chat: &Chat) {
        f.memory
            .set(
                CHATS,
                &chat.id,
                crate::store::to_body(chat).unwrap(),
                crate::store::SetMode::Overwrite,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_direct_returns_oldest_of_duplicates() {
        let f = fixture().await;
        seed_chat(&f, &chat("newer", ChatKind::Direct, &["alice", "bob"], 50)).await;
        seed_chat(&f, &chat("older", ChatKind::Direct, &["bob", "alice"], 20)).await;
        seed_chat(&f, &chat("other", ChatKind::Direct, &["alice", "carol"], 1)).await;
        assert_eq!(f.directory.create_direct("alice", "bob").await.unwrap(), "older");
    }

    #[tokio::test]
    async fn test_create_direct_keeps_underscored_pairs_apart() {
        let f = fixture().await;
        let provider = StoreUserProvider::new(Arc::new(f.memory.clone()));
        for id in ["a_b", "c", "a", "b_c"] {
            provider
                .put_user(&User::new(id, id, timestamp_from_millis(1)))
                .await
                .unwrap();
        }

        let first = f.directory.create_direct("a_b", "c").await.unwrap();
        let second = f.directory.create_direct("a", "b_c").await.unwrap();
        assert_ne!(first, second);
        let chat = f.directory.load_chat(&second).await.unwrap();
        assert!(chat.is_member("a") && chat.is_member("b_c"));
        assert_eq!(chat.member_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_create_direct_skips_foreign_chat_under_same_id() {
        let f = fixture().await;
        let squatter = chat(
            &direct_chat_id("alice", "carol"),
            ChatKind::Direct,
            &["alice", "bob"],
            1,
        );
        seed_chat(&f, &squatter).await;

        let id = f.directory.create_direct("alice", "carol").await.unwrap();
        assert_ne!(id, squatter.id);
        let chat = f.directory.load_chat(&id).await.unwrap();
        assert_eq!(chat.kind, ChatKind::Direct);
        assert!(chat.is_member("alice") && chat.is_member("carol"));
    }

    #[tokio::test]
    async fn test_create_direct_rejects_bad_input() {
        let f = fixture().await;
        assert!(matches!(
            f.directory.create_direct("alice", "alice").await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            f.directory.create_direct("alice", "ghost").await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_group_adds_creator() {
        let f = fixture().await;
        let id = f
            .directory
            .create_group("  Crew ", &["bob".to_string()], "alice")
            .await
            .unwrap();
        let chat = f.directory.load_chat(&id).await.unwrap();
        assert_eq!(chat.group_name.as_deref(), Some("Crew"));
        assert!(chat.is_member("alice"));
        assert!(chat.admins.unwrap().contains("alice"));

        assert!(f.directory.create_group("", &["bob".into()], "alice").await.is_err());
        assert!(f.directory.create_group("Solo", &[], "alice").await.is_err());
        assert!(matches!(
            f.directory.load_chat("missing").await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_follows_membership() {
        let f = fixture().await;
        let _handle = f.directory.attach("alice").await.unwrap();
        let mut changes = f.directory.changes();
        let id = f.directory.create_direct("alice", "carol").await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.directory.chat(&id).is_none() {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(f.directory.status(), FeedStatus::Live);
    }

    #[tokio::test]
    async fn test_feed_error_marks_disconnected() {
        let f = fixture().await;
        f.directory.create_direct("alice", "bob").await.unwrap();
        let _handle = f.directory.attach("alice").await.unwrap();
        let mut changes = f.directory.changes();
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.directory.status() != FeedStatus::Live {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        f.memory.break_feeds("connection reset");
        tokio::time::timeout(Duration::from_secs(2), async {
            while !matches!(f.directory.status(), FeedStatus::Disconnected(_)) {
                changes.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        // The loaded chat list stays visible.
        assert_eq!(f.directory.chats().len(), 1);
    }
}
