//! Live-sync chat client core
//!
//! Keeps a client's view of conversations, messages, typing indicators and
//! unread counts consistent with a remote document store that pushes live
//! change batches.

pub mod config;
pub mod error;
pub mod feed;
pub mod models;
pub mod session;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
pub use session::{OpenChat, Session};
