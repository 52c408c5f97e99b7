//! Per-viewer session context
//!
//! Builds one instance of every sync component for a signed-in user and
//! shares the collaborators between them. Nothing here is global: two
//! sessions over the same store behave like two independent clients.

use std::sync::Arc;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::feed::AttachHandle;
use crate::models::{ChatId, MessageDraft, UserId};
use crate::store::{BlobStore, DocumentStore};
use crate::sync::{
    ChatDirectory, MessageStore, Outbox, ReceiptReport, SendReceipt, TypingTracker,
    UnreadAccounting, UserCache, UserProvider,
};

pub struct Session {
    viewer_id: UserId,
    users: Arc<UserCache>,
    unread: Arc<UnreadAccounting>,
    messages: Arc<MessageStore>,
    directory: Arc<ChatDirectory>,
    typing: TypingTracker,
    outbox: Outbox,
}

/// Live feeds backing one open chat screen. Dropping it closes the chat.
#[must_use = "dropping an OpenChat detaches its feeds"]
pub struct OpenChat {
    pub chat_id: ChatId,
    messages: AttachHandle,
    typing: AttachHandle,
}

impl OpenChat {
    pub fn close(&self) {
        self.messages.cancel();
        self.typing.cancel();
    }
}

impl Session {
    pub fn new(
        viewer_id: impl Into<UserId>,
        remote: Arc<dyn DocumentStore>,
        profiles: Arc<dyn UserProvider>,
        blobs: Arc<dyn BlobStore>,
        settings: &SyncSettings,
    ) -> Self {
        let viewer_id = viewer_id.into();
        let users = UserCache::new(profiles);
        let unread = UnreadAccounting::new(remote.clone(), settings.receipt_batch_size);
        let messages = MessageStore::new(
            remote.clone(),
            viewer_id.clone(),
            settings.page_size,
            unread.clone(),
        );
        let directory =
            ChatDirectory::new(remote.clone(), viewer_id.clone(), users.clone(), unread.clone());
        let typing = TypingTracker::new(remote.clone(), viewer_id.clone(), settings.typing_quiet());
        let outbox = Outbox::new(remote, blobs, viewer_id.clone(), typing.clone());
        tracing::debug!("Session ready for {}", viewer_id);
        Self {
            viewer_id,
            users,
            unread,
            messages,
            directory,
            typing,
            outbox,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn users(&self) -> &Arc<UserCache> {
        &self.users
    }

    pub fn unread(&self) -> &Arc<UnreadAccounting> {
        &self.unread
    }

    pub fn messages(&self) -> &Arc<MessageStore> {
        &self.messages
    }

    pub fn directory(&self) -> &Arc<ChatDirectory> {
        &self.directory
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Follow the viewer's chat list.
    pub async fn attach_chat_list(&self) -> Result<AttachHandle> {
        self.directory.attach(&self.viewer_id).await
    }

    /// Attach the message and typing feeds of a chat.
    pub async fn open_chat(&self, chat_id: &str) -> Result<OpenChat> {
        let messages = self.messages.attach(chat_id).await?;
        let typing = self.typing.attach(chat_id).await?;
        Ok(OpenChat {
            chat_id: chat_id.to_string(),
            messages,
            typing,
        })
    }

    pub async fn send(&self, chat_id: &str, draft: &MessageDraft) -> Result<SendReceipt> {
        self.outbox.send_message(chat_id, draft).await
    }

    pub async fn mark_read(&self, chat_id: &str) -> Result<ReceiptReport> {
        self.unread
            .mark_read(chat_id, &self.viewer_id, &self.messages)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedStatus;
    use crate::models::{timestamp_from_millis, User};
    use crate::store::{messages_collection, MemoryBlobStore, MemoryStore};
    use crate::sync::StoreUserProvider;
    use std::future::Future;
    use std::time::Duration;

    async fn world() -> (MemoryStore, Session, Session) {
        let memory = MemoryStore::new();
        let remote: Arc<dyn DocumentStore> = Arc::new(memory.clone());
        let provider = Arc::new(StoreUserProvider::new(remote.clone()));
        for (id, name) in [("alice", "Alice"), ("bob", "Bob")] {
            provider
                .put_user(&User::new(id, name, timestamp_from_millis(1)))
                .await
                .unwrap();
        }
        let blobs = Arc::new(MemoryBlobStore::new());
        let settings = SyncSettings {
            receipt_batch_size: 2,
            ..Default::default()
        };
        let alice = Session::new(
            "alice",
            remote.clone(),
            provider.clone(),
            blobs.clone(),
            &settings,
        );
        let bob = Session::new("bob", remote, provider, blobs, &settings);
        (memory, alice, bob)
    }

    /// Poll `check` after every revision of `changes` until it holds.
    async fn eventually<F>(mut changes: tokio::sync::watch::Receiver<u64>, mut check: F)
    where
        F: FnMut() -> bool,
    {
        timeout(async {
            while !check() {
                changes.changed().await.unwrap();
            }
        })
        .await;
    }

    async fn timeout<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), fut).await.unwrap()
    }

    #[tokio::test]
    async fn test_conversation_between_two_sessions() {
        let (_memory, alice, bob) = world().await;
        let _bob_list = bob.attach_chat_list().await.unwrap();

        let chat_id = alice.directory().create_direct("alice", "bob").await.unwrap();
        eventually(bob.directory().changes(), || bob.directory().chat(&chat_id).is_some()).await;

        let _alice_chat = alice.open_chat(&chat_id).await.unwrap();
        for text in ["hi", "are you there?", "ping"] {
            alice.send(&chat_id, &MessageDraft::text(text)).await.unwrap();
        }
        eventually(alice.messages().changes(), || alice.messages().messages(&chat_id).len() == 3)
            .await;
        // Own messages never count as unread.
        assert_eq!(alice.unread().count(&chat_id), 0);

        // Bob sees the arrivals through chat-list previews before opening the chat.
        eventually(bob.unread().changes(), || bob.unread().count(&chat_id) >= 1).await;

        let bob_chat = bob.open_chat(&chat_id).await.unwrap();
        eventually(bob.messages().changes(), || bob.messages().messages(&chat_id).len() == 3).await;
        assert_eq!(bob.unread().count(&chat_id), 3);
        let texts: Vec<String> = bob
            .messages()
            .messages(&chat_id)
            .iter()
            .map(|m| m.content.preview_text())
            .collect();
        assert_eq!(texts, vec!["hi", "are you there?", "ping"]);

        let report = bob.mark_read(&chat_id).await.unwrap();
        assert_eq!(report, ReceiptReport { written: 3, failed: 0 });
        assert_eq!(bob.unread().count(&chat_id), 0);

        // Receipts echo back to the sender's open chat.
        eventually(alice.messages().changes(), || {
            alice
                .messages()
                .messages(&chat_id)
                .iter()
                .all(|m| m.is_read_by("bob"))
        })
        .await;
        eventually(bob.messages().changes(), || {
            bob.messages().unread_by(&chat_id, "bob").is_empty()
        })
        .await;

        bob_chat.close();
        assert_eq!(bob.messages().status(&chat_id), FeedStatus::Detached);
    }

    #[tokio::test]
    async fn test_partial_receipt_failure_is_reported() {
        let (memory, alice, bob) = world().await;
        let chat_id = alice.directory().create_direct("alice", "bob").await.unwrap();
        let mut sent = Vec::new();
        for text in ["one", "two", "three"] {
            sent.push(alice.send(&chat_id, &MessageDraft::text(text)).await.unwrap().message_id);
        }

        let _bob_chat = bob.open_chat(&chat_id).await.unwrap();
        eventually(bob.messages().changes(), || bob.messages().messages(&chat_id).len() == 3).await;

        memory.fail_writes_under(format!("{}/{}", messages_collection(&chat_id), sent[1]));
        let report = bob.mark_read(&chat_id).await.unwrap();
        assert_eq!(report, ReceiptReport { written: 2, failed: 1 });
        assert_eq!(bob.unread().count(&chat_id), 0);

        // The failed one is retried on the next mark.
        memory.clear_faults();
        eventually(bob.messages().changes(), || {
            bob.messages().unread_by(&chat_id, "bob").len() == 1
        })
        .await;
        let report = bob.mark_read(&chat_id).await.unwrap();
        assert_eq!(report, ReceiptReport { written: 1, failed: 0 });
    }

    #[tokio::test]
    async fn test_open_unknown_chat_fails() {
        let (_memory, alice, _bob) = world().await;
        assert!(alice.open_chat("missing").await.is_err());
    }
}
