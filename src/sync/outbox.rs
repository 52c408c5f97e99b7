//! Outbound write coordinator
//!
//! Sends go to the store first; the sender sees its own message only when
//! the message feed echoes it back.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::typing::TypingTracker;
use crate::error::{Result, SyncError};
use crate::models::{
    timestamp_from_millis, Chat, MessageContent, MessageDraft, MessageId, MessagePreview, UserId,
};
use crate::store::{
    messages_collection, to_body, BlobStore, DocumentStore, CHATS, SERVER_TIMESTAMP,
};

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// False when the message was stored but the chat preview could not be refreshed.
    pub preview_updated: bool,
}

/// A local file to upload and send as a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: Option<String>,
    pub caption: Option<String>,
}

pub struct Outbox {
    remote: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    viewer_id: UserId,
    typing: TypingTracker,
}

impl Outbox {
    pub fn new(
        remote: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        viewer_id: impl Into<UserId>,
        typing: TypingTracker,
    ) -> Self {
        Self {
            remote,
            blobs,
            viewer_id: viewer_id.into(),
            typing,
        }
    }

    /// Submit a message from the viewer, then refresh the chat preview and clear typing.
    ///
    /// Invalid drafts are rejected before anything is written. A failed
    /// preview refresh does not undo the message.
    pub async fn send_message(&self, chat_id: &str, draft: &MessageDraft) -> Result<SendReceipt> {
        draft.content.validate()?;

        let chat: Chat = match self.remote.get(CHATS, chat_id).await? {
            Some(doc) => doc.decode()?,
            None => return Err(SyncError::not_found("chat", chat_id)),
        };
        if !chat.is_member(&self.viewer_id) {
            return Err(SyncError::validation(format!(
                "{} is not a member of chat {}",
                self.viewer_id, chat_id
            )));
        }

        let mut body = to_body(draft)?;
        body.insert("chatId".into(), json!(chat_id));
        body.insert("senderId".into(), json!(self.viewer_id));
        body.insert("createdAt".into(), json!(SERVER_TIMESTAMP));
        body.insert("deliveredTo".into(), json!([]));
        body.insert("readBy".into(), json!({}));
        let stored = self.remote.add(&messages_collection(chat_id), body).await?;
        tracing::debug!("Sent {:?} message {} to {}", draft.content.kind(), stored.id, chat_id);

        let created_at = stored
            .field("createdAt")
            .and_then(Value::as_i64)
            .map(timestamp_from_millis)
            .unwrap_or_else(Utc::now);
        let preview = MessagePreview {
            message_id: stored.id.clone(),
            text: draft.content.preview_text(),
            sender_id: self.viewer_id.clone(),
            created_at,
            kind: draft.content.kind(),
        };
        let preview_updated = match self.update_preview(chat_id, &preview).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Message {} sent but chat preview is stale: {:#}", stored.id, e);
                false
            }
        };

        if let Err(e) = self.typing.stop(chat_id).await {
            tracing::warn!("Failed to clear typing state in {}: {:#}", chat_id, e);
        }

        Ok(SendReceipt {
            message_id: stored.id,
            preview_updated,
        })
    }

    async fn update_preview(&self, chat_id: &str, preview: &MessagePreview) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(
            "lastMessagePreview".into(),
            serde_json::to_value(preview).map_err(|e| SyncError::validation(e.to_string()))?,
        );
        self.remote.update(CHATS, chat_id, patch).await?;
        Ok(())
    }

    /// Upload an attachment and send it, picking the message kind from its content type.
    pub async fn send_attachment(
        &self,
        chat_id: &str,
        attachment: Attachment,
    ) -> Result<SendReceipt> {
        let Attachment {
            bytes,
            content_type,
            file_name,
            caption,
        } = attachment;
        let uploaded = self.blobs.upload(bytes, &content_type).await?;
        let content = content_for_upload(
            uploaded.url,
            uploaded.size_bytes,
            content_type,
            file_name,
            caption,
        );
        self.send_message(chat_id, &MessageDraft::new(content)).await
    }
}

fn content_for_upload(
    media_url: String,
    size_bytes: u64,
    content_type: String,
    file_name: Option<String>,
    caption: Option<String>,
) -> MessageContent {
    let caption = caption.filter(|c| !c.trim().is_empty());
    if content_type.starts_with("image/") {
        MessageContent::Image {
            media_url,
            media_mime: Some(content_type),
            caption,
        }
    } else if content_type.starts_with("audio/") {
        MessageContent::Audio {
            media_url,
            media_mime: Some(content_type),
            duration_seconds: None,
        }
    } else {
        MessageContent::File {
            media_url,
            media_mime: Some(content_type),
            file_name,
            file_size_bytes: Some(size_bytes),
        }
    }
}
