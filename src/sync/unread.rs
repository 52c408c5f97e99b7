//! Unread accounting
//!
//! Counters are session-local: each inbound message (not authored by the
//! viewer) counts once per chat, whichever path reported it first: the
//! chat's message feed or the chat-list preview. Marking a chat read resets
//! its counter and writes read receipts for the loaded messages.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde_json::{json, Map};
use tokio::sync::watch;

use super::messages::MessageStore;
use crate::error::Result;
use crate::models::{ChatId, Message, MessageId, MessagePreview};
use crate::store::{messages_collection, DocumentStore, SERVER_TIMESTAMP};

/// Ids stay in `counted` until the viewer's receipt for them is written, so
/// the set holds at most the inbound messages not yet marked read.
#[derive(Default)]
struct ChatUnread {
    count: u32,
    counted: HashSet<MessageId>,
}

/// Outcome of a `mark_read` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptReport {
    pub written: usize,
    /// Receipts that failed; those messages stay unmarked until the next attempt.
    pub failed: usize,
}

pub struct UnreadAccounting {
    remote: Arc<dyn DocumentStore>,
    receipt_batch_size: usize,
    counters: Mutex<HashMap<ChatId, ChatUnread>>,
    revision: watch::Sender<u64>,
}

impl UnreadAccounting {
    pub fn new(remote: Arc<dyn DocumentStore>, receipt_batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            remote,
            receipt_batch_size: receipt_batch_size.max(1),
            counters: Mutex::new(HashMap::new()),
            revision: watch::channel(0).0,
        })
    }

    /// Count an inbound message. Returns whether the counter moved.
    pub fn on_message_arrived(&self, chat_id: &str, message: &Message, viewer_id: &str) -> bool {
        if message.is_read_by(viewer_id) {
            return false;
        }
        self.record_arrival(chat_id, &message.id, &message.sender_id, viewer_id)
    }

    /// Count a new chat-list preview as an arrival, for chats whose messages are not loaded.
    pub fn on_preview_arrived(
        &self,
        chat_id: &str,
        preview: &MessagePreview,
        viewer_id: &str,
    ) -> bool {
        self.record_arrival(chat_id, &preview.message_id, &preview.sender_id, viewer_id)
    }

    fn record_arrival(
        &self,
        chat_id: &str,
        message_id: &str,
        sender_id: &str,
        viewer_id: &str,
    ) -> bool {
        if sender_id == viewer_id {
            return false;
        }
        let counted = {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            let entry = counters.entry(chat_id.to_string()).or_default();
            if entry.counted.insert(message_id.to_string()) {
                entry.count += 1;
                true
            } else {
                false
            }
        };
        if counted {
            tracing::debug!("New message {} in chat {}", message_id, chat_id);
            self.revision.send_modify(|r| *r += 1);
        }
        counted
    }

    pub fn count(&self, chat_id: &str) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(chat_id)
            .map_or(0, |c| c.count)
    }

    pub fn total(&self) -> u32 {
        self.counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| c.count)
            .sum()
    }

    /// Zero the counter for a chat. Already-counted ids stay counted.
    pub fn reset(&self, chat_id: &str) {
        if let Some(entry) = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(chat_id)
        {
            entry.count = 0;
        }
        self.revision.send_modify(|r| *r += 1);
    }

    /// Reset the chat's counter and write read receipts for its loaded inbound messages.
    ///
    /// Receipts go out in batches of concurrent writes. Failures are counted,
    /// not rolled back; the echo of each successful receipt arrives through
    /// the message feed.
    pub async fn mark_read(
        &self,
        chat_id: &str,
        viewer_id: &str,
        messages: &MessageStore,
    ) -> Result<ReceiptReport> {
        self.reset(chat_id);

        let pending = messages.unread_by(chat_id, viewer_id);
        if pending.is_empty() {
            return Ok(ReceiptReport::default());
        }
        tracing::debug!("Marking {} messages read in {}", pending.len(), chat_id);

        let collection = messages_collection(chat_id);
        let mut report = ReceiptReport::default();
        for batch in pending.chunks(self.receipt_batch_size) {
            let writes = batch.iter().map(|message_id| {
                let mut patch = Map::new();
                patch.insert(
                    format!("readBy.{}", viewer_id),
                    json!({"userId": viewer_id, "readAt": SERVER_TIMESTAMP}),
                );
                self.remote.update(&collection, message_id, patch)
            });
            for (message_id, result) in batch.iter().zip(join_all(writes).await) {
                match result {
                    Ok(_) => {
                        report.written += 1;
                        self.forget(chat_id, message_id);
                    }
                    Err(e) => {
                        tracing::warn!("Read receipt in {} failed: {:#}", chat_id, e);
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Drop a receipted id. Its feed copies now carry the viewer's receipt.
    fn forget(&self, chat_id: &str, message_id: &str) {
        if let Some(entry) = self
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(chat_id)
        {
            entry.counted.remove(message_id);
        }
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
