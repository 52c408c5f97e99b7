//! Chat-related models

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{ChatId, MessageId, MessageKind, Timestamp, UserId};
use crate::error::{Result, SyncError};

/// Chat type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

/// Denormalized summary of the last accepted message in a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub text: String,
    pub sender_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    pub kind: MessageKind,
}

/// Chat entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub member_ids: BTreeSet<UserId>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    pub created_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<MessagePreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_photo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admins: Option<BTreeSet<UserId>>,
}

impl Chat {
    /// Check the membership invariants for this chat's kind.
    pub fn validate(&self) -> Result<()> {
        if self.member_ids.len() < 2 {
            return Err(SyncError::validation(format!(
                "chat {} needs at least two members",
                self.id
            )));
        }
        match self.kind {
            ChatKind::Direct if self.member_ids.len() != 2 => Err(SyncError::validation(
                format!("direct chat {} must have exactly two members", self.id),
            )),
            ChatKind::Group => match self.admins {
                Some(ref admins) if !admins.is_subset(&self.member_ids) => {
                    Err(SyncError::validation(format!(
                        "chat {} has admins who are not members",
                        self.id
                    )))
                }
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.contains(user_id)
    }

    /// The other participant of a direct chat.
    pub fn counterpart(&self, viewer_id: &str) -> Option<&UserId> {
        if self.kind != ChatKind::Direct {
            return None;
        }
        self.member_ids.iter().find(|id| id.as_str() != viewer_id)
    }

    /// Recency used for chat-list ordering: the last message time, or creation time.
    pub fn recency(&self) -> Timestamp {
        match self.last_message_preview {
            Some(ref preview) => preview.created_at.max(self.created_at),
            None => self.created_at,
        }
    }
}

/// Deterministic id for the direct chat between two users.
///
/// Both sides derive the same id regardless of who initiates, which makes
/// concurrent first contact converge on one document. The length prefix keeps
/// pairs like (`a_b`, `c`) and (`a`, `b_c`) apart.
pub fn direct_chat_id(a: &str, b: &str) -> ChatId {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("dm_{}_{}_{}", lo.len(), lo, hi)
}
