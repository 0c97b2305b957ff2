//! In-process backend.

use super::{ChangeFeed, Fetched, WatchedBackend};
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Changes a slow watcher may fall behind by before it loses some.
const CHANGE_BUFFER: usize = 256;

/// A backend over a [`MemoryStore`].
pub type MemoryBackend = WatchedBackend<MemoryStore>;

struct Slot {
    value: Option<Vec<u8>>,
    changes: broadcast::Sender<Option<Vec<u8>>>,
}

impl Slot {
    fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            value: None,
            changes,
        }
    }
}

/// An in-process key-value store with change notification.
///
/// Every [`set`](Self::set) and [`delete`](Self::delete) is one change.
/// Clones share the same store, so one handle can be given to a
/// [`WatchedBackend`] while another is used to write.
///
/// # Examples
///
/// ```rust
/// use distconfig::backends::MemoryStore;
///
/// let store = MemoryStore::new();
/// store.set("app", r#"{"debug": true}"#);
/// assert_eq!(store.get("app").as_deref(), Some(&br#"{"debug": true}"#[..]));
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.publish(key, Some(value.into()));
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let existed = self.get(key).is_some();
        self.publish(key, None);
        existed
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.slots
            .lock()
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    fn publish(&self, key: &str, value: Option<Vec<u8>>) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
        slot.value = value.clone();
        // No receiver just means nobody watches this key yet.
        let _ = slot.changes.send(value);
    }
}

#[async_trait]
impl ChangeFeed for MemoryStore {
    type Cursor = broadcast::Receiver<Option<Vec<u8>>>;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, key: &str) -> Result<Fetched<Self::Cursor>> {
        // Read and subscribe under one lock so no change falls in between.
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.to_string()).or_insert_with(Slot::new);
        Ok(Fetched {
            value: slot.value.clone(),
            cursor: slot.changes.subscribe(),
        })
    }

    async fn wait_for_change(
        &self,
        key: &str,
        cursor: &mut Self::Cursor,
    ) -> Result<Option<Vec<u8>>> {
        match cursor.recv().await {
            Ok(value) => Ok(value),
            Err(RecvError::Lagged(missed)) => Err(ConfigError::WatchError(format!(
                "watcher of '{}' fell behind by {} changes",
                key, missed
            ))),
            Err(RecvError::Closed) => Err(ConfigError::WatchError(format!(
                "change stream of '{}' closed",
                key
            ))),
        }
    }
}
