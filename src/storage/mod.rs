//! Persistence boundary for session and key material.
//!
//! A [`KeyValueStore`] is the Rust face of the browser's `localStorage`: a
//! flat string map plus a change-notification stream. Change notifications
//! follow browser semantics: a handle never observes its own writes, only
//! writes made through another handle (another tab, another process).
//!
//! # Implementations
//!
//! ```text
//! KeyValueStore (trait)
//!     │
//!     ├── MemoryStore   shared in-process map, one handle per "tab"
//!     ├── FileStore     JSON file, external edits observed via notify
//!     └── ScopedStorage prefix wrapper (`-walletlink:{origin}:`)
//! ```

// Rust guideline compliant 2026-02

pub mod file;
pub mod memory;
pub mod scoped;

use std::fmt::Debug;

use tokio::sync::broadcast;

use crate::error::Result;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use scoped::ScopedStorage;

/// Buffer of change events per subscriber before lagging.
const EVENT_BUFFER: usize = 64;

/// A single key change observed on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that changed (scope prefix already stripped for scoped views).
    pub key: String,
    /// Value before the change, `None` if the key was absent.
    pub old_value: Option<String>,
    /// Value after the change, `None` if the key was removed.
    pub new_value: Option<String>,
    /// Handle that produced the change; `0` for changes from outside the process.
    pub origin: u64,
}

/// Flat string key-value persistence with change notifications.
pub trait KeyValueStore: Send + Sync + Debug {
    /// Read a value.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write a value, notifying other handles if it changed.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value, notifying other handles if it existed.
    fn remove_item(&self, key: &str) -> Result<()>;

    /// Remove every key visible through this handle.
    fn clear(&self) -> Result<()>;

    /// All keys visible through this handle.
    fn keys(&self) -> Vec<String>;

    /// Subscribe to changes made through other handles.
    ///
    /// Every call creates an independent subscription starting at "now".
    fn subscribe(&self) -> StorageSubscription;
}

/// Receiving end of a store's change notifications.
///
/// Filters out the subscriber's own writes and, for scoped views, keys
/// outside the scope.
#[derive(Debug)]
pub struct StorageSubscription {
    rx: broadcast::Receiver<StorageEvent>,
    own_origin: Option<u64>,
    prefix: Option<String>,
}

impl StorageSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<StorageEvent>, own_origin: Option<u64>) -> Self {
        Self {
            rx,
            own_origin,
            prefix: None,
        }
    }

    /// Restrict the subscription to keys under `prefix`, stripping it from
    /// delivered events. Prefixes nest.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(match self.prefix.take() {
            Some(outer) => format!("{outer}{prefix}"),
            None => prefix.to_string(),
        });
        self
    }

    /// Wait for the next relevant change. Returns `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(event) = self.accept(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[Storage] Subscriber lagged, {skipped} change events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, mut event: StorageEvent) -> Option<StorageEvent> {
        if self.own_origin == Some(event.origin) {
            return None;
        }
        if let Some(prefix) = &self.prefix {
            event.key = event.key.strip_prefix(prefix.as_str())?.to_string();
        }
        Some(event)
    }
}

pub(crate) fn event_channel() -> broadcast::Sender<StorageEvent> {
    broadcast::channel(EVENT_BUFFER).0
}
