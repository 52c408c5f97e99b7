//! Error taxonomy for the sync layer.

/// Errors surfaced by the store, the feeds and the sync components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The remote was unreachable or the operation timed out. Safe to retry.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// An outbound write is inconsistent with its declared kind. Never reaches the network.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced chat, user or document does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A remote record could not be decoded into its model type.
    #[error("malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// Local persistence (snapshot file) failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Whether a retry budget may be spent on this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
