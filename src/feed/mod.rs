//! Live query change feeds
//!
//! A `Subscription` delivers ordered batches of added/modified/removed records
//! for one query until it is cancelled. Delivery is at-least-once: consumers
//! must treat a repeated `Added` or `Modified` for a known id as an update.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use crate::error::Result;
use crate::store::Document;

/// Kind of change applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Added,
    Modified,
    /// The record left the query window (deleted, or evicted by a limit).
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub op: ChangeOp,
    pub record: T,
}

impl<T> Change<T> {
    pub fn added(record: T) -> Self {
        Self {
            op: ChangeOp::Added,
            record,
        }
    }

    pub fn modified(record: T) -> Self {
        Self {
            op: ChangeOp::Modified,
            record,
        }
    }

    pub fn removed(record: T) -> Self {
        Self {
            op: ChangeOp::Removed,
            record,
        }
    }
}

pub type ChangeBatch<T> = Vec<Change<T>>;

/// One delivery on a feed: a batch, or the error that ended the feed.
pub type FeedItem = Result<ChangeBatch<Document>>;

/// Connection state of one attached feed, for "disconnected" indicators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedStatus {
    #[default]
    Detached,
    /// Subscribed, initial snapshot not yet merged.
    Connecting,
    Live,
    /// The feed failed and was not retried.
    Disconnected(String),
}

type Hook = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

/// Idempotent cancellation token shared by a feed's producer and consumer.
///
/// Hooks registered with `on_cancel` run synchronously, in registration
/// order, on the first `cancel()`; later calls are no-ops.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a hook to run on cancellation. Runs immediately if already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks: Vec<Hook> = {
            let mut guard = self.inner.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for hook in hooks {
            hook();
        }
    }
}

/// Receiving end of a live query.
///
/// Nothing is yielded once `cancel()` has returned, including batches that
/// were already buffered. Dropping the subscription cancels it.
pub struct Subscription {
    stream: UnboundedReceiverStream<FeedItem>,
    cancel: CancelHandle,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<FeedItem>, cancel: CancelHandle) -> Self {
        Self {
            stream: UnboundedReceiverStream::new(rx),
            cancel,
        }
    }

    /// Next delivery, or `None` once the feed ended or was cancelled.
    pub async fn next_batch(&mut self) -> Option<FeedItem> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let item = self.stream.next().await?;
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(item)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for Subscription {
    type Item = FeedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(_)) if self.cancel.is_cancelled() => Poll::Ready(None),
            other => other,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decode a raw batch into model records, dropping records that fail to decode.
pub fn decode_batch<T: DeserializeOwned>(batch: ChangeBatch<Document>) -> ChangeBatch<T> {
    batch
        .into_iter()
        .filter_map(|change| match change.record.decode::<T>() {
            Ok(record) => Some(Change {
                op: change.op,
                record,
            }),
            Err(e) => {
                tracing::warn!("Dropping undecodable record: {:#}", e);
                None
            }
        })
        .collect()
}

/// Owner's handle for an attached feed and the task merging it.
///
/// Cancelling (explicitly or by drop) stops the remote listener and the merge
/// task; once `cancel()` returns, no further merge from this feed is applied.
#[must_use = "dropping an AttachHandle detaches the feed immediately"]
pub struct AttachHandle {
    cancel: CancelHandle,
    task: Option<AbortHandle>,
}

impl AttachHandle {
    pub fn new(cancel: CancelHandle, task: Option<AbortHandle>) -> Self {
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(ref task) = self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for AttachHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawn the task that feeds each delivery of `subscription` to `on_item`.
///
/// `on_item` returns `false` to stop consuming (for example after an error).
pub(crate) fn spawn_pump<F>(mut subscription: Subscription, mut on_item: F) -> AttachHandle
where
    F: FnMut(FeedItem) -> bool + Send + 'static,
{
    let cancel = subscription.cancel_handle();
    let task = tokio::spawn(async move {
        while let Some(item) = subscription.next_batch().await {
            if !on_item(item) {
                break;
            }
        }
    });
    AttachHandle::new(cancel, Some(task.abort_handle()))
}
