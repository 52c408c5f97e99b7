//! Command-line front end
//!
//! Each invocation loads the store snapshot, runs one command against a
//! session for the signed-in user, and writes the snapshot back.

pub mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use chrono::Local;
use tokio::sync::watch;

use chat_sync::config::Config;
use chat_sync::feed::FeedStatus;
use chat_sync::models::{Chat, Message, MessageDraft, User};
use chat_sync::session::Session;
use chat_sync::store::{DocumentStore, MemoryBlobStore, MemoryStore, RetryingStore};
use chat_sync::sync::{StoreUserProvider, UserProvider};

const FEED_TIMEOUT: Duration = Duration::from_secs(5);

/// Config plus the local store for one CLI invocation.
pub struct Workspace {
    config: Config,
    memory: MemoryStore,
    store_path: PathBuf,
}

impl Workspace {
    pub fn open(store_override: Option<PathBuf>) -> Result<Self> {
        let config = Config::load()?;
        let store_path = match store_override {
            Some(path) => path,
            None => config.store_path()?,
        };
        let memory = MemoryStore::open(&store_path).context("Failed to open store")?;
        tracing::debug!("Using store at {}", store_path.display());
        Ok(Self {
            config,
            memory,
            store_path,
        })
    }

    fn remote(&self) -> Arc<dyn DocumentStore> {
        Arc::new(RetryingStore::new(
            Arc::new(self.memory.clone()),
            self.config.retry.policy(),
        ))
    }

    fn profiles(&self) -> Arc<StoreUserProvider> {
        Arc::new(StoreUserProvider::new(self.remote()))
    }

    fn session(&self) -> Result<Session> {
        let viewer = self.config.require_viewer()?;
        Ok(Session::new(
            viewer,
            self.remote(),
            self.profiles(),
            Arc::new(MemoryBlobStore::new()),
            &self.config.sync,
        ))
    }

    fn persist(&self) -> Result<()> {
        self.memory
            .save(&self.store_path)
            .context("Failed to save store")
    }
}

/// Wait until a feed has merged its initial snapshot.
async fn wait_live(
    mut changes: watch::Receiver<u64>,
    status: impl Fn() -> FeedStatus,
) -> Result<()> {
    loop {
        match status() {
            FeedStatus::Live => return Ok(()),
            FeedStatus::Disconnected(reason) => bail!("Disconnected: {}", reason),
            _ => {}
        }
        tokio::time::timeout(FEED_TIMEOUT, changes.changed())
            .await
            .context("Timed out waiting for the store")?
            .context("Feed closed")?;
    }
}

pub async fn login(ws: &mut Workspace, user_id: &str) -> Result<()> {
    let Some(user) = ws.profiles().get_user_by_id(user_id).await? else {
        bail!(
            "Unknown user {}. Create it with `chat-sync add-user {} --name <name>`.",
            user_id,
            user_id
        );
    };
    ws.config.viewer_id = Some(user.id.clone());
    ws.config.save()?;
    println!("Logged in as {} ({})", user.display_name, user.id);
    Ok(())
}

pub fn logout(ws: &mut Workspace) -> Result<()> {
    ws.config.viewer_id = None;
    ws.config.save()?;
    println!("Logged out.");
    Ok(())
}

pub async fn status(ws: &Workspace) -> Result<()> {
    println!("Store: {}", ws.store_path.display());
    match ws.config.viewer_id {
        Some(ref id) => match ws.profiles().get_user_by_id(id).await? {
            Some(user) => println!("Logged in as {} ({})", user.display_name, user.id),
            None => println!("Logged in as {} (profile missing)", id),
        },
        None => println!("Not logged in."),
    }
    Ok(())
}

pub async fn add_user(ws: &Workspace, user_id: &str, name: &str) -> Result<()> {
    if user_id.trim().is_empty() || name.trim().is_empty() {
        bail!("User id and name must not be empty");
    }
    let user = User::new(user_id.trim(), name.trim(), chrono::Utc::now());
    ws.profiles().put_user(&user).await?;
    ws.persist()?;
    println!("Added user {} ({})", user.display_name, user.id);
    Ok(())
}

/// List chats with unread counts (prints to stdout).
pub async fn list_chats(ws: &Workspace, limit: usize) -> Result<()> {
    let session = ws.session()?;
    let directory = session.directory().clone();
    let _feed = session.attach_chat_list().await?;
    wait_live(directory.changes(), || directory.status()).await?;

    let chats: Vec<Chat> = directory.chats().into_iter().take(limit).collect();

    println!("\nRecent Chats:");
    println!("{:-<60}", "");

    if chats.is_empty() {
        println!("  (no chats found)");
        return Ok(());
    }

    for chat in &chats {
        warm_names(&session, chat).await;
        let name = directory.resolve_display_name(chat, session.viewer_id());
        let unread = unread_in(&session, chat).await?;
        if unread > 0 {
            println!("{} ({} unread)", name, unread);
        } else {
            println!("{}", name);
        }
        println!("  ID: {}", chat.id);
        if let Some(ref description) = chat.description {
            println!("  {}", description);
        }
        if let Some(ref preview) = chat.last_message_preview {
            let sender = sender_name(&session, &preview.sender_id).await;
            println!(
                "  Last: {}",
                preview.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            );
            println!("  [{}]: {}", sender, preview.text);
        }
        println!();
    }

    Ok(())
}

/// Unread messages in the most recent window of a chat.
async fn unread_in(session: &Session, chat: &Chat) -> Result<usize> {
    let messages = session.messages();
    let feed = messages.attach(&chat.id).await?;
    wait_live(messages.changes(), || messages.status(&chat.id)).await?;
    feed.cancel();
    Ok(messages.unread_by(&chat.id, session.viewer_id()).len())
}

async fn warm_names(session: &Session, chat: &Chat) {
    if let Some(other) = chat.counterpart(session.viewer_id()) {
        if let Err(e) = session.users().get(other).await {
            tracing::debug!("Could not load profile {}: {:#}", other, e);
        }
    }
}

async fn sender_name(session: &Session, user_id: &str) -> String {
    if user_id == session.viewer_id() {
        return "You".to_string();
    }
    match session.users().get(user_id).await {
        Ok(Some(user)) => user.display_name,
        _ => chat_sync::models::placeholder_name(user_id),
    }
}

/// Read messages from a chat (prints to stdout).
pub async fn read_messages(
    ws: &Workspace,
    chat_id: &str,
    limit: usize,
    older_pages: usize,
) -> Result<()> {
    let session = ws.session()?;
    let messages = session.messages().clone();
    let chat = session.open_chat(chat_id).await?;
    wait_live(messages.changes(), || messages.status(chat_id)).await?;

    for _ in 0..older_pages {
        if messages.load_older(chat_id).await? == 0 {
            break;
        }
    }
    chat.close();

    let loaded = messages.messages(chat_id);
    if loaded.is_empty() {
        println!("(no messages)");
        return Ok(());
    }

    let skip = loaded.len().saturating_sub(limit);
    for msg in &loaded[skip..] {
        print_message(&session, msg).await;
    }
    if messages.has_more(chat_id) {
        println!("(older messages available, use --older)");
    }

    Ok(())
}

async fn print_message(session: &Session, msg: &Message) {
    let sender = sender_name(session, &msg.sender_id).await;
    let time = msg.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M");
    let seen = if msg.sender_id == session.viewer_id() && !msg.read_by.is_empty() {
        " ✓✓"
    } else {
        ""
    };
    println!("[{}] {}: {}{}", time, sender, msg.content.preview_text(), seen);
}

pub async fn send_message(ws: &Workspace, chat_id: &str, text: &str) -> Result<()> {
    let session = ws.session()?;
    let receipt = session.send(chat_id, &MessageDraft::text(text)).await?;
    ws.persist()?;
    if !receipt.preview_updated {
        println!("Message sent (chat preview not updated).");
    } else {
        println!("Message sent.");
    }
    Ok(())
}

pub async fn start_direct(ws: &Workspace, other_id: &str) -> Result<()> {
    let session = ws.session()?;
    let chat_id = session
        .directory()
        .create_direct(session.viewer_id(), other_id)
        .await?;
    ws.persist()?;
    println!("Direct chat: {}", chat_id);
    Ok(())
}

pub async fn create_group(ws: &Workspace, name: &str, members: &[String]) -> Result<()> {
    let session = ws.session()?;
    for member in members {
        if session.users().get(member).await?.is_none() {
            bail!("Unknown user {}", member);
        }
    }
    let chat_id = session
        .directory()
        .create_group(name, members, session.viewer_id())
        .await?;
    ws.persist()?;
    println!("Group chat: {}", chat_id);
    Ok(())
}

pub async fn mark_read(ws: &Workspace, chat_id: &str) -> Result<()> {
    let session = ws.session()?;
    let messages = session.messages().clone();
    let chat = session.open_chat(chat_id).await?;
    wait_live(messages.changes(), || messages.status(chat_id)).await?;

    let report = session.mark_read(chat_id).await?;
    chat.close();
    ws.persist()?;

    if report.failed > 0 {
        println!(
            "Marked {} messages read, {} failed (run again to retry).",
            report.written, report.failed
        );
    } else {
        println!("Marked {} messages read.", report.written);
    }
    Ok(())
}
