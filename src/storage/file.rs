//! JSON-file-backed store shared between processes.
//!
//! The whole map lives in one JSON object file. Writes go through a temp
//! file and an atomic rename. A [`FileWatcher`] on the parent directory
//! reloads the file whenever it changes on disk and diffs it against the
//! in-memory copy; only keys that differ produce [`StorageEvent`]s, so this
//! handle's own writes stay silent while another process's writes are
//! reported with origin `0`.
//!
//! Every write re-reads the file under the lock before applying its change,
//! so two handles on one path never drop each other's keys.
//!
//! # Storage structure
//!
//! ```text
//! ~/.config/walletlink/
//!     storage.json      { "-walletlink:https://www.walletlink.org:session:id": "…", … }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result as AnyResult};
use tokio::sync::broadcast;

use super::{event_channel, KeyValueStore, StorageEvent, StorageSubscription};
use crate::error::Result;
use crate::file_watcher::FileWatcher;

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    items: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// Key-value store persisted to a JSON file.
#[derive(Debug)]
pub struct FileStore {
    inner: Arc<Inner>,
    _watcher: Option<FileWatcher>,
}

impl FileStore {
    /// Open (or create) the store at `path` and start watching it.
    ///
    /// A watcher failure is logged and the store keeps working without
    /// external change notifications.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .context("Storage path has no parent directory")?;
        fs::create_dir_all(&dir).context("Failed to create storage directory")?;

        let items = read_items(&path)?;
        let inner = Arc::new(Inner {
            path,
            items: Mutex::new(items),
            events: event_channel(),
        });

        let watcher = match start_watcher(&inner, &dir) {
            Ok(w) => Some(w),
            Err(e) => {
                log::warn!("[Storage] External change detection disabled: {e:#}");
                None
            }
        };

        Ok(Self {
            inner,
            _watcher: watcher,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Re-read the file and emit events for keys changed on disk.
    ///
    /// Called by the watcher; exposed so callers can force a refresh on
    /// platforms where notifications are coalesced.
    pub fn reload(&self) {
        self.inner.reload();
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let external = {
            let mut items = self.inner.items.lock().unwrap_or_else(PoisonError::into_inner);
            // Start from the file so writes by other handles are kept.
            let on_disk = read_items(&self.inner.path)?;
            let external = diff(&items, &on_disk);
            *items = on_disk;
            f(&mut items);
            write_items(&self.inner.path, &items)?;
            external
        };

        for event in external {
            log::debug!("[Storage] External change to {}", event.key);
            let _ = self.inner.events.send(event);
        }
        Ok(())
    }
}

impl Inner {
    fn reload(&self) {
        let on_disk = match read_items(&self.path) {
            Ok(items) => items,
            Err(e) => {
                log::warn!("[Storage] Ignoring unreadable storage file: {e:#}");
                return;
            }
        };

        let changes = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let changes = diff(&items, &on_disk);
            *items = on_disk;
            changes
        };

        for event in changes {
            log::debug!("[Storage] External change to {}", event.key);
            let _ = self.events.send(event);
        }
    }
}

fn start_watcher(inner: &Arc<Inner>, dir: &Path) -> AnyResult<FileWatcher> {
    let file_name = inner.path.file_name().map(ToOwned::to_owned);
    let weak = Arc::downgrade(inner);
    let mut watcher = FileWatcher::new(move |event| {
        if !event.kind.is_mutation() || event.path.file_name() != file_name.as_deref() {
            return;
        }
        if let Some(inner) = weak.upgrade() {
            inner.reload();
        }
    })?;
    watcher.watch(dir)?;
    Ok(watcher)
}

fn read_items(path: &Path) -> AnyResult<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_items(path: &Path, items: &HashMap<String, String>) -> AnyResult<()> {
    let tmp = path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(items).context("Failed to serialize storage")?;
    fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Events turning `before` into `after`, attributed to origin 0.
fn diff(before: &HashMap<String, String>, after: &HashMap<String, String>) -> Vec<StorageEvent> {
    let mut events = Vec::new();
    for (key, new) in after {
        let old = before.get(key);
        if old != Some(new) {
            events.push(StorageEvent {
                key: key.clone(),
                old_value: old.cloned(),
                new_value: Some(new.clone()),
                origin: 0,
            });
        }
    }
    for (key, old) in before {
        if !after.contains_key(key) {
            events.push(StorageEvent {
                key: key.clone(),
                old_value: Some(old.clone()),
                new_value: None,
                origin: 0,
            });
        }
    }
    events
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Option<String> {
        let items = self.inner.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|items| {
            items.insert(key.to_string(), value.to_string());
        })
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.mutate(|items| {
            items.remove(key);
        })
    }

    fn clear(&self) -> Result<()> {
        self.mutate(HashMap::clear)
    }

    fn keys(&self) -> Vec<String> {
        let items = self.inner.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.keys().cloned().collect()
    }

    fn subscribe(&self) -> StorageSubscription {
        // Own writes never reach the diff, so no origin filtering is needed.
        StorageSubscription::new(self.inner.events.subscribe(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.set_item("session:id", "abc").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_item("session:id").as_deref(), Some("abc"));
    }

    #[test]
    fn test_clear_empties_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        let store = FileStore::open(&path).unwrap();
        store.set_item("a", "1").unwrap();

        store.clear().unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.keys().is_empty());
    }

    #[tokio::test]
    async fn test_writes_from_two_handles_are_merged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        let a = FileStore::open(&path).unwrap();
        let b = FileStore::open(&path).unwrap();
        let mut sub = a.subscribe();

        b.set_item("from_b", "2").unwrap();
        a.set_item("from_a", "1").unwrap();

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get_item("from_a").as_deref(), Some("1"));
        assert_eq!(reopened.get_item("from_b").as_deref(), Some("2"));
        assert_eq!(a.get_item("from_b").as_deref(), Some("2"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, "from_b");
        assert_eq!(event.new_value.as_deref(), Some("2"));
        assert_eq!(event.origin, 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{not json").unwrap();

        assert!(FileStore::open(&path).is_err());
    }

    #[tokio::test]
    async fn test_reload_reports_external_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.json");
        let store = FileStore::open(&path).unwrap();
        store.set_item("session:id", "old").unwrap();
        let mut sub = store.subscribe();

        // Another process rewrites the file.
        fs::write(&path, r#"{"session:id":"new"}"#).unwrap();
        store.reload();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, "session:id");
        assert_eq!(event.old_value.as_deref(), Some("old"));
        assert_eq!(event.new_value.as_deref(), Some("new"));
        assert_eq!(event.origin, 0);
    }

    #[test]
    fn test_diff_detects_removal_and_addition() {
        let before = HashMap::from([("gone".to_string(), "1".to_string())]);
        let after = HashMap::from([("added".to_string(), "2".to_string())]);

        let mut events = diff(&before, &after);
        events.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key, "added");
        assert_eq!(events[1].key, "gone");
        assert_eq!(events[1].new_value, None);
    }

    #[test]
    fn test_diff_of_identical_maps_is_empty() {
        let items = HashMap::from([("k".to_string(), "v".to_string())]);
        assert!(diff(&items, &items.clone()).is_empty());
    }
}
