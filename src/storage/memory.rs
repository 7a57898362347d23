//! In-process shared store.
//!
//! All handles cloned from one [`MemoryStore`] share a map, and each handle
//! gets its own origin id so that it behaves like a separate browser tab.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use super::{event_channel, KeyValueStore, StorageEvent, StorageSubscription};
use crate::error::Result;

/// Origin ids start at 1; 0 is reserved for out-of-process changes.
static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct Shared {
    items: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// Shared in-memory key-value store.
#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with a single handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(HashMap::new()),
                events: event_channel(),
            }),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Open another handle on the same map, as a second tab would.
    #[must_use]
    pub fn new_tab(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn notify(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        if old_value == new_value {
            return;
        }
        // No subscribers is not an error.
        let _ = self.shared.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.origin,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Option<String> {
        let items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let old = {
            let mut items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.insert(key.to_string(), value.to_string())
        };
        self.notify(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let old = {
            let mut items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.remove(key)
        };
        self.notify(key, old, None);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let drained: Vec<(String, String)> = {
            let mut items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
            items.drain().collect()
        };
        for (key, old) in drained {
            self.notify(&key, Some(old), None);
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        let items = self.shared.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.keys().cloned().collect()
    }

    fn subscribe(&self) -> StorageSubscription {
        StorageSubscription::new(self.shared.events.subscribe(), Some(self.origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let store = MemoryStore::new();
        assert_eq!(store.get_item("k"), None);

        store.set_item("k", "v").unwrap();
        assert_eq!(store.get_item("k").as_deref(), Some("v"));

        store.remove_item("k").unwrap();
        assert_eq!(store.get_item("k"), None);
    }

    #[test]
    fn test_tabs_share_items() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.new_tab();

        tab_a.set_item("session:id", "abc").unwrap();
        assert_eq!(tab_b.get_item("session:id").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_other_tab_observes_change() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.new_tab();
        let mut sub_b = tab_b.subscribe();

        tab_a.set_item("session:id", "abc").unwrap();

        let event = sub_b.recv().await.unwrap();
        assert_eq!(event.key, "session:id");
        assert_eq!(event.old_value, None);
        assert_eq!(event.new_value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_own_writes_not_observed() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.new_tab();
        let mut sub_a = tab_a.subscribe();

        tab_a.set_item("mine", "1").unwrap();
        tab_b.set_item("theirs", "2").unwrap();

        assert_eq!(sub_a.recv().await.unwrap().key, "theirs");
    }

    #[tokio::test]
    async fn test_clear_emits_removals() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.new_tab();
        tab_a.set_item("x", "1").unwrap();
        let mut sub_b = tab_b.subscribe();

        tab_a.clear().unwrap();

        let event = sub_b.recv().await.unwrap();
        assert_eq!(event.key, "x");
        assert_eq!(event.new_value, None);
        assert!(tab_b.keys().is_empty());
    }

    #[test]
    fn test_unchanged_write_is_silent() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.new_tab();
        tab_a.set_item("k", "same").unwrap();
        let mut sub_b = tab_b.subscribe();

        tab_a.set_item("k", "same").unwrap();
        assert!(sub_b.rx.try_recv().is_err());
    }
}
