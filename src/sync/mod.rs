//! Live-sync components
//!
//! Each component owns its slice of client state and is constructed per
//! session; none of them is a process-wide singleton.

pub mod directory;
pub mod messages;
pub mod outbox;
pub mod typing;
pub mod unread;
pub mod users;

pub use directory::ChatDirectory;
pub use messages::MessageStore;
pub use outbox::{Attachment, Outbox, SendReceipt};
pub use typing::{TypingState, TypingTracker};
pub use unread::{ReceiptReport, UnreadAccounting};
pub use users::{StoreUserProvider, UserCache, UserProvider};
