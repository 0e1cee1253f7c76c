//! Current-identity resolution from persisted session state.
//!
//! The session store is injected rather than read from ambient global state;
//! [`IdentityResolver::watch`] turns its change notifications into
//! `IdentityChanged` events for a running session.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{Context, Result};
use serde::Deserialize;
use shared::{domain::Identity, protocol::RawId};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::session::SessionHandle;

pub const TOKEN_KEY: &str = "token";
pub const USER_ID_KEY: &str = "userId";
pub const USER_KEY: &str = "user";
pub const PROFILE_PICTURE_KEY: &str = "profilePicture";

/// Notification that a stored key changed; `key: None` means the store was cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: Option<String>,
}

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: RwLock::new(HashMap::new()),
            changes,
        }
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store from a JSON object. Non-string values (the cached `user`
    /// object) are kept as their JSON text, the way browser storage holds them.
    pub fn load_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read session file '{}'", path.display()))?;
        let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("session file '{}' is not a JSON object", path.display()))?;

        let store = Self::new();
        {
            let mut values = store.values.write().unwrap_or_else(PoisonError::into_inner);
            for (key, value) in entries {
                let text = match value {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(text) => text,
                    other => other.to_string(),
                };
                values.insert(key, text);
            }
        }
        info!(path = %path.display(), "loaded session state");
        Ok(store)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.into());
        let _ = self.changes.send(StorageChange { key: Some(key) });
    }

    pub fn remove(&self, key: &str) {
        let removed = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if removed {
            let _ = self.changes.send(StorageChange {
                key: Some(key.to_string()),
            });
        }
    }

    pub fn clear(&self) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let _ = self.changes.send(StorageChange { key: None });
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.changes.subscribe()
    }
}

#[derive(Deserialize)]
struct StoredUser {
    #[serde(rename = "_id", default)]
    underscore_id: Option<RawId>,
    #[serde(default)]
    id: Option<RawId>,
}

impl StoredUser {
    fn identity(&self) -> Option<Identity> {
        self.underscore_id
            .as_ref()
            .and_then(RawId::identity)
            .or_else(|| self.id.as_ref().and_then(RawId::identity))
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn SessionStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// `userId` wins; otherwise the id of the cached `user` object. Absence is
    /// the anonymous state, not an error.
    pub fn current_identity(&self) -> Option<Identity> {
        if let Some(identity) = self
            .store
            .get(USER_ID_KEY)
            .and_then(|raw| Identity::normalize(raw))
        {
            return Some(identity);
        }

        let raw_user = self.store.get(USER_KEY)?;
        match serde_json::from_str::<StoredUser>(&raw_user) {
            Ok(user) => user.identity(),
            Err(err) => {
                debug!(%err, "cached user object has no usable id");
                None
            }
        }
    }

    pub fn credentials(&self) -> Option<String> {
        self.store
            .get(TOKEN_KEY)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    }

    /// Re-resolves on every storage change and forwards actual identity
    /// changes into `session`. `seen` is the identity the session already
    /// holds; a change that landed before the subscription is forwarded
    /// first. Ends when the store or the session goes away.
    pub fn watch(&self, session: SessionHandle, seen: Option<Identity>) -> JoinHandle<()> {
        let resolver = self.clone();
        let mut changes = self.store.subscribe();
        let mut last = seen;
        tokio::spawn(async move {
            loop {
                let current = resolver.current_identity();
                if current != last {
                    info!(
                        previous = ?last.as_ref().map(Identity::as_str),
                        current = ?current.as_ref().map(Identity::as_str),
                        "session identity changed"
                    );
                    last = current.clone();
                    if session.set_identity(current).is_err() {
                        break;
                    }
                }

                match changes.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "identity watch lagged behind storage changes");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
