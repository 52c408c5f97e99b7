//! Typing status model

use serde::{Deserialize, Serialize};

use super::{ChatId, Timestamp, UserId};

/// One (chat, user) typing cell as mirrored in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub is_typing: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
}
