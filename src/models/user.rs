//! User-related models

use serde::{Deserialize, Serialize};

use super::{Timestamp, UserId};

/// User profile, owned by the auth/profile subsystem and only cached here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: Timestamp,
}

impl User {
    /// A freshly registered, offline user.
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            photo_url: None,
            about: None,
            is_online: false,
            last_seen_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Placeholder shown for a user whose profile has not been fetched yet.
pub fn placeholder_name(user_id: &str) -> String {
    let tail: String = {
        let chars: Vec<char> = user_id.chars().collect();
        let start = chars.len().saturating_sub(4);
        chars[start..].iter().collect()
    };
    format!("User {}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::timestamp_from_millis;

    #[test]
    fn test_placeholder_uses_last_four_chars() {
        assert_eq!(placeholder_name("user-abcdef1234"), "User 1234");
        assert_eq!(placeholder_name("ab"), "User ab");
    }

    #[test]
    fn test_user_omits_absent_optionals() {
        let user = User::new("u1", "Ada", timestamp_from_millis(5));
        let value = serde_json::to_value(&user).unwrap();
        assert!(value.get("photoUrl").is_none());
        assert!(value.get("about").is_none());
        assert_eq!(value["createdAt"], 5);
    }
}
