//! Message-related models

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{ChatId, MessageId, Timestamp, UserId};
use crate::error::{Result, SyncError};

/// Longest preview text kept on a chat before truncating with "...".
const PREVIEW_MAX_CHARS: usize = 80;

/// Message kind as stored in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Audio,
    Emoji,
}

/// Kind-specific message content.
///
/// Each variant holds exactly the fields its kind may carry, so serializing a
/// message can never emit a field that does not belong to it. Absent optional
/// fields are omitted from the record rather than written as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageContent {
    #[serde(rename_all = "camelCase")]
    Text { text: String },
    #[serde(rename_all = "camelCase")]
    Emoji { text: String },
    #[serde(rename_all = "camelCase")]
    Image {
        media_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_mime: Option<String>,
        #[serde(default, rename = "text", skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    File {
        media_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_mime: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size_bytes: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Audio {
        media_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_mime: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u32>,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_url: impl Into<String>) -> Self {
        Self::Image {
            media_url: media_url.into(),
            media_mime: None,
            caption: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Emoji { .. } => MessageKind::Emoji,
            Self::Image { .. } => MessageKind::Image,
            Self::File { .. } => MessageKind::File,
            Self::Audio { .. } => MessageKind::Audio,
        }
    }

    /// Check that the content-defining field for this kind is present.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Text { text } | Self::Emoji { text } => {
                if text.trim().is_empty() {
                    return Err(SyncError::validation(format!(
                        "{:?} message requires non-empty text",
                        self.kind()
                    )));
                }
            }
            Self::Image { media_url, .. } | Self::Audio { media_url, .. } => {
                if media_url.trim().is_empty() {
                    return Err(SyncError::validation(format!(
                        "{:?} message requires a media URL",
                        self.kind()
                    )));
                }
            }
            Self::File {
                media_url,
                file_name,
                ..
            } => {
                if media_url.trim().is_empty() {
                    return Err(SyncError::validation("File message requires a media URL"));
                }
                if file_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                    return Err(SyncError::validation("File name must not be blank"));
                }
            }
        }
        Ok(())
    }

    /// Text shown in the chat list for this content.
    ///
    /// Media kinds fall back to an emoji-prefixed label when they carry no text.
    pub fn preview_text(&self) -> String {
        let text = match self {
            Self::Text { text } | Self::Emoji { text } => text.trim().to_string(),
            Self::Image { caption, .. } => caption
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .unwrap_or_else(|| "📷 Photo".to_string()),
            Self::File { file_name, .. } => match file_name.as_deref() {
                Some(name) if !name.trim().is_empty() => format!("📎 {}", name.trim()),
                _ => "📎 File".to_string(),
            },
            Self::Audio { .. } => "🎤 Voice message".to_string(),
        };
        truncate_preview(&text)
    }
}

fn truncate_preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_MAX_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(PREVIEW_MAX_CHARS - 3).collect();
    format!("{}...", kept)
}

/// A read receipt entry, keyed by reader in `Message::read_by`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub read_at: Timestamp,
}

/// Chat message as stored under `messages/{chatId}/items/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<Timestamp>,
    #[serde(default)]
    pub delivered_to: BTreeSet<UserId>,
    #[serde(default)]
    pub read_by: BTreeMap<UserId, ReadReceipt>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    /// Display ordering key: `(created_at, id)` ascending.
    pub fn sort_key(&self) -> (Timestamp, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains_key(user_id)
    }

    /// Take a newer copy of the same message.
    ///
    /// `delivered_to` and `read_by` only ever grow, so entries already known
    /// locally survive a stale or reordered redelivery.
    pub fn absorb(&mut self, incoming: Message) {
        let delivered = std::mem::take(&mut self.delivered_to);
        let read_by = std::mem::take(&mut self.read_by);
        *self = incoming;
        self.delivered_to.extend(delivered);
        for (user, receipt) in read_by {
            self.read_by.entry(user).or_insert(receipt);
        }
    }
}

/// User-authored content awaiting submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<MessageId>,
}

impl MessageDraft {
    pub fn new(content: MessageContent) -> Self {
        Self {
            content,
            reply_to_message_id: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageContent::text(text))
    }

    pub fn replying_to(mut self, message_id: impl Into<MessageId>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }
}
