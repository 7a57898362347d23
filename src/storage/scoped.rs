//! Namespaced view over a shared store.

use std::sync::Arc;

use super::{KeyValueStore, StorageSubscription};
use crate::error::Result;

/// Prefixes every key with a scope so several relays can share one store.
///
/// The SDK scopes by relay origin: `-walletlink:https://www.walletlink.org`.
#[derive(Debug, Clone)]
pub struct ScopedStorage {
    inner: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl ScopedStorage {
    /// Create a view over `inner` under `scope`.
    pub fn new(inner: Arc<dyn KeyValueStore>, scope: &str) -> Self {
        Self {
            inner,
            prefix: format!("{scope}:"),
        }
    }

    /// The scope used for a wallet surface (relay server or popup page).
    #[must_use]
    pub fn scope_for_origin(url: &url::Url) -> String {
        format!("-walletlink:{}", url.origin().ascii_serialization())
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl KeyValueStore for ScopedStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.inner.get_item(&self.scoped_key(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_item(&self.scoped_key(key), value)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.inner.remove_item(&self.scoped_key(key))
    }

    /// Removes only the keys inside this scope.
    fn clear(&self) -> Result<()> {
        for key in self.inner.keys() {
            if key.starts_with(&self.prefix) {
                self.inner.remove_item(&key)?;
            }
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.inner
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(ToOwned::to_owned))
            .collect()
    }

    fn subscribe(&self) -> StorageSubscription {
        self.inner.subscribe().with_prefix(&self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_keys_are_prefixed() {
        let backing = Arc::new(MemoryStore::new());
        let scoped = ScopedStorage::new(backing.clone(), "-walletlink:https://a.example");

        scoped.set_item("session:id", "abc").unwrap();

        assert_eq!(
            backing.get_item("-walletlink:https://a.example:session:id").as_deref(),
            Some("abc")
        );
        assert_eq!(scoped.keys(), vec!["session:id".to_string()]);
    }

    #[test]
    fn test_clear_leaves_other_scopes() {
        let backing = Arc::new(MemoryStore::new());
        let a = ScopedStorage::new(backing.clone(), "a");
        let b = ScopedStorage::new(backing.clone(), "b");
        a.set_item("k", "1").unwrap();
        b.set_item("k", "2").unwrap();

        a.clear().unwrap();

        assert_eq!(a.get_item("k"), None);
        assert_eq!(b.get_item("k").as_deref(), Some("2"));
    }

    #[test]
    fn test_scope_for_origin_drops_path() {
        let url = url::Url::parse("https://www.walletlink.org/rpc?x=1").unwrap();
        assert_eq!(
            ScopedStorage::scope_for_origin(&url),
            "-walletlink:https://www.walletlink.org"
        );
    }

    #[tokio::test]
    async fn test_subscription_sees_only_scope() {
        let backing = MemoryStore::new();
        let other_tab: Arc<dyn KeyValueStore> = Arc::new(backing.new_tab());
        let scoped = ScopedStorage::new(Arc::new(backing), "s");
        let mut sub = scoped.subscribe();

        other_tab.set_item("unrelated", "x").unwrap();
        other_tab.set_item("s:session:id", "abc").unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, "session:id");
    }
}
