//! Bounded retry for transient store failures
//!
//! Wraps any `DocumentStore` and retries operations that fail with a
//! transient network error, backing off exponentially (doubling, capped).
//! Other errors are returned immediately. Live feeds are not re-established
//! once they fail; only the initial `subscribe` call is retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time;
use uuid::Uuid;

use super::{Document, DocumentStore, Query, SetMode};
use crate::error::Result;
use crate::feed::Subscription;

/// Retry budget for a single store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct RetryingStore {
    inner: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn DocumentStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        "{} failed: {:#}. Retrying in {}ms (attempt {}/{})",
                        what,
                        e,
                        delay.as_millis(),
                        attempt + 1,
                        self.policy.max_attempts
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl DocumentStore for RetryingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.with_retry("get", || self.inner.get(collection, id)).await
    }

    /// The id is chosen once so a retried insert cannot create a duplicate.
    async fn add(&self, collection: &str, data: Map<String, Value>) -> Result<Document> {
        let id = Uuid::new_v4().simple().to_string();
        let (doc, _) = self
            .with_retry("add", || {
                self.inner.create_if_absent(collection, &id, data.clone())
            })
            .await?;
        Ok(doc)
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> Result<(Document, bool)> {
        self.with_retry("create", || {
            self.inner.create_if_absent(collection, id, data.clone())
        })
        .await
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
        mode: SetMode,
    ) -> Result<Document> {
        self.with_retry("set", || self.inner.set(collection, id, data.clone(), mode))
            .await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Document> {
        self.with_retry("update", || self.inner.update(collection, id, patch.clone()))
            .await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.with_retry("query", || self.inner.query(query)).await
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription> {
        self.with_retry("subscribe", || self.inner.subscribe(query.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store_with(memory: &MemoryStore, attempts: u32) -> RetryingStore {
        RetryingStore::new(
            Arc::new(memory.clone()),
            RetryPolicy {
                max_attempts: attempts,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(64),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(9), Duration::from_secs(64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_write() {
        let memory = MemoryStore::new();
        memory.fail_next_writes(2);
        let store = store_with(&memory, 3);
        let doc = store.add("m", Map::new()).await.unwrap();
        assert!(memory.document("m", &doc.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let memory = MemoryStore::new();
        memory.fail_next_writes(5);
        let store = store_with(&memory, 2);
        let err = store.add("m", Map::new()).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let memory = MemoryStore::new();
        let store = store_with(&memory, 3);
        let err = store.update("m", "missing", Map::new()).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
