//! Data models for chat entities

mod chat;
mod message;
mod typing;
mod user;

pub use chat::*;
pub use message::*;
pub use typing::*;
pub use user::*;

use chrono::{DateTime, Utc};

pub type UserId = String;
pub type ChatId = String;
pub type MessageId = String;

/// Server-assigned instant, carried on the wire as epoch milliseconds.
pub type Timestamp = DateTime<Utc>;

/// Build a timestamp from epoch milliseconds (out-of-range values clamp to the epoch).
pub fn timestamp_from_millis(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
