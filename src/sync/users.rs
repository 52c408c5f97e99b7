//! User read-through cache
//!
//! Profiles are fetched lazily on first reference and never invalidated;
//! stale display names are acceptable for the lifetime of a session.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{User, UserId};
use crate::store::{to_body, DocumentStore, SetMode, USERS};

/// Auth/profile collaborator: resolves user ids to profiles.
#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>>;
}

/// `UserProvider` backed by the `users` collection of a document store.
pub struct StoreUserProvider {
    remote: Arc<dyn DocumentStore>,
}

impl StoreUserProvider {
    pub fn new(remote: Arc<dyn DocumentStore>) -> Self {
        Self { remote }
    }

    /// Write a profile (used to seed users; profile editing lives elsewhere).
    pub async fn put_user(&self, user: &User) -> Result<()> {
        self.remote
            .set(USERS, &user.id, to_body(user)?, SetMode::Overwrite)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserProvider for StoreUserProvider {
    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        match self.remote.get(USERS, id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }
}

pub struct UserCache {
    provider: Arc<dyn UserProvider>,
    entries: Mutex<HashMap<UserId, User>>,
    pending: Mutex<HashSet<UserId>>,
    /// Ids whose background fetch found nothing or failed this session.
    unresolved: Mutex<HashSet<UserId>>,
    revision: watch::Sender<u64>,
}

impl UserCache {
    pub fn new(provider: Arc<dyn UserProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            entries: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            unresolved: Mutex::new(HashSet::new()),
            revision: watch::channel(0).0,
        })
    }

    /// Cached profile, without touching the provider.
    pub fn cached(&self, id: &str) -> Option<User> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Read-through lookup. `Ok(None)` means the user does not exist.
    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        if let Some(user) = self.cached(id) {
            return Ok(Some(user));
        }
        let fetched = self.provider.get_user_by_id(id).await?;
        if let Some(ref user) = fetched {
            self.insert(user.clone());
        }
        Ok(fetched)
    }

    /// Start filling the cache for `id` in the background, at most once at a time.
    ///
    /// An id whose fetch came back empty or failed is not fetched again in the
    /// background; an explicit `get` still goes to the provider.
    pub fn prefetch(self: &Arc<Self>, id: &str) {
        if self.cached(id).is_some() || self.is_unresolved(id) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime, skipping profile fetch for {}", id);
            return;
        };
        if !self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string())
        {
            return;
        }
        let cache = Arc::clone(self);
        let id = id.to_string();
        runtime.spawn(async move {
            let found = match cache.get(&id).await {
                Ok(Some(_)) => {
                    tracing::debug!("Cached profile for {}", id);
                    true
                }
                Ok(None) => {
                    tracing::debug!("No profile for {}", id);
                    false
                }
                Err(e) => {
                    tracing::warn!("Profile fetch for {} failed: {:#}", id, e);
                    false
                }
            };
            if !found {
                cache
                    .unresolved
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone());
            }
            cache
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        });
    }

    fn is_unresolved(&self, id: &str) -> bool {
        self.unresolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    pub fn insert(&self, user: User) {
        self.unresolved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&user.id);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.id.clone(), user);
        self.revision.send_modify(|r| *r += 1);
    }

    /// Notified whenever a profile lands in the cache.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
