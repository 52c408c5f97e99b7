//! Presence & typing tracker
//!
//! Local side: one `Idle`/`Typing` cell per chat for the viewer, with a quiet
//! timer restarted on every keystroke. Every state transition is mirrored to
//! the viewer's typing document for that chat (last write wins).
//!
//! Remote side: `attach` follows all typing documents of a chat and exposes
//! who is currently typing, minus the viewer.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::Result;
use crate::feed::{decode_batch, spawn_pump, AttachHandle, ChangeOp, FeedItem};
use crate::models::{ChatId, TypingStatus, UserId};
use crate::store::{typing_collection, DocumentStore, Query, SetMode, SERVER_TIMESTAMP};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypingState {
    #[default]
    Idle,
    Typing,
}

#[derive(Default)]
struct LocalCell {
    state: TypingState,
    /// Bumped on every keystroke and stop; a timer only fires for its own generation.
    generation: u64,
    timer: Option<AbortHandle>,
}

type RemoteCells = HashMap<ChatId, HashMap<UserId, bool>>;

struct TypingInner {
    remote: Arc<dyn DocumentStore>,
    viewer_id: UserId,
    quiet: Duration,
    local: Mutex<HashMap<ChatId, LocalCell>>,
    remote_cells: Arc<Mutex<RemoteCells>>,
    revision: watch::Sender<u64>,
}

impl TypingInner {
    async fn write(&self, chat_id: &str, is_typing: bool) -> Result<()> {
        let body = match json!({
            "chatId": chat_id,
            "userId": self.viewer_id,
            "isTyping": is_typing,
            "updatedAt": SERVER_TIMESTAMP,
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.remote
            .set(&typing_collection(chat_id), &self.viewer_id, body, SetMode::Merge)
            .await?;
        tracing::debug!("Typing in {} -> {}", chat_id, is_typing);
        Ok(())
    }

    fn lock_local(&self) -> std::sync::MutexGuard<'_, HashMap<ChatId, LocalCell>> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<TypingInner>,
}

impl TypingTracker {
    pub fn new(
        remote: Arc<dyn DocumentStore>,
        viewer_id: impl Into<UserId>,
        quiet: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                remote,
                viewer_id: viewer_id.into(),
                quiet,
                local: Mutex::new(HashMap::new()),
                remote_cells: Arc::new(Mutex::new(HashMap::new())),
                revision: watch::channel(0).0,
            }),
        }
    }

    /// Report the current composer contents for `chat_id`.
    ///
    /// Non-empty input starts (or keeps) the viewer typing and restarts the
    /// quiet timer; empty input stops typing.
    pub async fn on_input(&self, chat_id: &str, input: &str) -> Result<()> {
        if input.trim().is_empty() {
            return self.stop(chat_id).await;
        }

        let started = {
            let mut local = self.inner.lock_local();
            let cell = local.entry(chat_id.to_string()).or_default();
            cell.generation += 1;
            if let Some(timer) = cell.timer.take() {
                timer.abort();
            }
            let started = cell.state == TypingState::Idle;
            cell.state = TypingState::Typing;
            cell.timer = Some(self.spawn_quiet_timer(chat_id, cell.generation));
            started
        };

        if started {
            if let Err(e) = self.inner.write(chat_id, true).await {
                // Back to idle so the next keystroke tries again.
                if let Some(cell) = self.inner.lock_local().get_mut(chat_id) {
                    cell.state = TypingState::Idle;
                    if let Some(timer) = cell.timer.take() {
                        timer.abort();
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop typing in `chat_id` (input cleared or message sent).
    pub async fn stop(&self, chat_id: &str) -> Result<()> {
        let stopped = {
            let mut local = self.inner.lock_local();
            match local.get_mut(chat_id) {
                Some(cell) if cell.state == TypingState::Typing => {
                    cell.state = TypingState::Idle;
                    cell.generation += 1;
                    if let Some(timer) = cell.timer.take() {
                        timer.abort();
                    }
                    true
                }
                _ => false,
            }
        };
        if stopped {
            self.inner.write(chat_id, false).await?;
        }
        Ok(())
    }

    fn spawn_quiet_timer(&self, chat_id: &str, generation: u64) -> AbortHandle {
        let inner: Weak<TypingInner> = Arc::downgrade(&self.inner);
        let quiet = self.inner.quiet;
        let chat_id = chat_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = {
                let mut local = inner.lock_local();
                match local.get_mut(&chat_id) {
                    Some(cell)
                        if cell.generation == generation && cell.state == TypingState::Typing =>
                    {
                        cell.state = TypingState::Idle;
                        cell.timer = None;
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tracing::debug!("Typing in {} went quiet", chat_id);
                if let Err(e) = inner.write(&chat_id, false).await {
                    tracing::warn!("Clearing typing state in {} failed: {:#}", chat_id, e);
                }
            }
        });
        task.abort_handle()
    }

    pub fn local_state(&self, chat_id: &str) -> TypingState {
        self.inner
            .lock_local()
            .get(chat_id)
            .map_or(TypingState::Idle, |c| c.state)
    }

    /// Follow the typing documents of `chat_id`.
    pub async fn attach(&self, chat_id: &str) -> Result<AttachHandle> {
        let subscription = self
            .inner
            .remote
            .subscribe(Query::collection(typing_collection(chat_id)))
            .await?;
        let cancel = subscription.cancel_handle();

        // Detached chats show nobody typing.
        let cells = Arc::clone(&self.inner.remote_cells);
        let key = chat_id.to_string();
        cancel.on_cancel(move || {
            cells.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
        });

        let inner = Arc::clone(&self.inner);
        let chat_id = chat_id.to_string();
        let feed_cancel = cancel.clone();
        Ok(spawn_pump(subscription, move |item: FeedItem| {
            let mut cells = inner.remote_cells.lock().unwrap_or_else(|e| e.into_inner());
            if feed_cancel.is_cancelled() {
                return false;
            }
            let batch = match item {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!("Typing feed for {} failed: {:#}", chat_id, e);
                    cells.remove(&chat_id);
                    drop(cells);
                    inner.revision.send_modify(|r| *r += 1);
                    return false;
                }
            };
            let chat = cells.entry(chat_id.clone()).or_default();
            for change in decode_batch::<TypingStatus>(batch) {
                let status = change.record;
                match change.op {
                    ChangeOp::Added | ChangeOp::Modified => {
                        chat.insert(status.user_id, status.is_typing);
                    }
                    ChangeOp::Removed => {
                        chat.remove(&status.user_id);
                    }
                }
            }
            drop(cells);
            inner.revision.send_modify(|r| *r += 1);
            true
        }))
    }

    /// Users currently typing in `chat_id`, excluding the viewer.
    pub fn typing_users(&self, chat_id: &str) -> BTreeSet<UserId> {
        self.inner
            .remote_cells
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(chat_id)
            .map(|chat| {
                chat.iter()
                    .filter(|(user, typing)| **typing && **user != self.inner.viewer_id)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}
