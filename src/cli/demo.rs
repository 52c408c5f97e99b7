//! Scripted two-user walkthrough over a throwaway in-memory store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use chat_sync::config::SyncSettings;
use chat_sync::models::{MessageDraft, User};
use chat_sync::session::Session;
use chat_sync::store::{DocumentStore, MemoryBlobStore, MemoryStore};
use chat_sync::sync::{Attachment, StoreUserProvider};

/// Wait for `check` to hold, re-testing after every revision.
async fn until(
    mut changes: watch::Receiver<u64>,
    what: &str,
    check: impl Fn() -> bool,
) -> Result<()> {
    let wait = async {
        while !check() {
            if changes.changed().await.is_err() {
                break;
            }
        }
    };
    within(wait).await.with_context(|| format!("Timed out waiting for {}", what))
}

async fn within<T>(fut: impl Future<Output = T>) -> Result<T> {
    Ok(tokio::time::timeout(Duration::from_secs(5), fut).await?)
}

pub async fn run() -> Result<()> {
    let memory = MemoryStore::new();
    let remote: Arc<dyn DocumentStore> = Arc::new(memory);
    let profiles = Arc::new(StoreUserProvider::new(remote.clone()));
    let now = chrono::Utc::now();
    profiles.put_user(&User::new("ada", "Ada", now)).await?;
    profiles.put_user(&User::new("grace", "Grace", now)).await?;
    profiles.put_user(&User::new("linus", "Linus", now)).await?;

    let settings = SyncSettings {
        typing_quiet_ms: 500,
        ..Default::default()
    };
    let blobs = Arc::new(MemoryBlobStore::new());
    let ada = Session::new("ada", remote.clone(), profiles.clone(), blobs.clone(), &settings);
    let grace = Session::new("grace", remote, profiles, blobs, &settings);

    let _ada_list = ada.attach_chat_list().await?;
    let _grace_list = grace.attach_chat_list().await?;

    println!("\n== Ada starts a direct chat with Grace");
    let chat_id = ada.directory().create_direct("ada", "grace").await?;
    println!("chat id: {}", chat_id);
    let again = ada.directory().create_direct("grace", "ada").await?;
    println!("asking again from the other side gives: {}", again);

    until(grace.directory().changes(), "Grace's chat list", || {
        grace.directory().chat(&chat_id).is_some()
    })
    .await?;
    let ada_chat = ada.open_chat(&chat_id).await?;

    println!("\n== Ada types, Grace watches");
    let grace_chat = grace.open_chat(&chat_id).await?;
    ada.typing().on_input(&chat_id, "Hey Gr").await?;
    until(grace.typing().changes(), "typing indicator", || {
        !grace.typing().typing_users(&chat_id).is_empty()
    })
    .await?;
    println!("Grace sees typing: {:?}", grace.typing().typing_users(&chat_id));
    grace_chat.close();

    println!("\n== Ada sends a text and a photo");
    ada.send(&chat_id, &MessageDraft::text("Hey Grace, got a minute?"))
        .await?;
    ada.outbox()
        .send_attachment(
            &chat_id,
            Attachment {
                bytes: vec![0x89, b'P', b'N', b'G'],
                content_type: "image/png".into(),
                file_name: Some("whiteboard.png".into()),
                caption: None,
            },
        )
        .await?;
    println!("typing after send: {:?}", ada.typing().local_state(&chat_id));

    until(grace.unread().changes(), "unread count", || {
        grace.unread().count(&chat_id) == 2
    })
    .await?;
    grace.users().get("ada").await?;
    if let Some(chat) = grace.directory().chat(&chat_id) {
        let title = grace.directory().resolve_display_name(&chat, "grace");
        let preview = chat.last_message_preview.map(|p| p.text).unwrap_or_default();
        println!(
            "Grace's list: {} [{} unread] {}",
            title,
            grace.unread().count(&chat_id),
            preview
        );
    }

    println!("\n== Grace opens the chat and reads");
    let grace_chat = grace.open_chat(&chat_id).await?;
    until(grace.messages().changes(), "messages", || {
        grace.messages().messages(&chat_id).len() == 2
    })
    .await?;
    for msg in grace.messages().messages(&chat_id) {
        println!("  {}: {}", msg.sender_id, msg.content.preview_text());
    }
    let report = grace.mark_read(&chat_id).await?;
    println!(
        "receipts written: {}, unread now: {}",
        report.written,
        grace.unread().count(&chat_id)
    );

    until(ada.messages().changes(), "read receipts", || {
        ada.messages()
            .messages(&chat_id)
            .iter()
            .all(|m| m.is_read_by("grace"))
    })
    .await?;
    println!("Ada sees both messages read by Grace");

    println!("\n== Grace replies and starts a group");
    let last = ada.messages().messages(&chat_id).last().map(|m| m.id.clone());
    let mut reply = MessageDraft::text("Sure, call in five");
    if let Some(id) = last {
        reply = reply.replying_to(id);
    }
    grace.send(&chat_id, &reply).await?;
    let group_id = grace
        .directory()
        .create_group("Compilers", &["ada".to_string(), "linus".to_string()], "grace")
        .await?;
    until(ada.directory().changes(), "group in Ada's list", || {
        ada.directory().chat(&group_id).is_some()
    })
    .await?;

    println!("\nAda's chats, most recent first:");
    for chat in ada.directory().chats() {
        if let Some(other) = chat.counterpart("ada") {
            ada.users().get(other).await?;
        }
        println!(
            "  {} ({} unread)",
            ada.directory().resolve_display_name(&chat, "ada"),
            ada.unread().count(&chat.id)
        );
    }

    grace_chat.close();
    ada_chat.close();
    Ok(())
}
