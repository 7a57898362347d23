//! File system event monitoring for file-backed storage.
//!
//! Wraps `notify::RecommendedWatcher` (kqueue on macOS, inotify on Linux)
//! and hands classified [`FileEvent`]s to a callback on the watcher thread.
//! [`crate::storage::FileStore`] uses it to notice when another process
//! rewrites the shared session file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A new file was created.
    Create,
    /// File content or metadata was modified (not a rename).
    Modify,
    /// A file was renamed or moved (atomic replace lands here).
    Rename,
    /// A file was deleted.
    Delete,
    /// Access events, watcher-internal events, etc.
    Other,
}

impl FileEventKind {
    /// Whether the event can have changed file content.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// A single file system event with path and classification.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path of the affected file.
    pub path: PathBuf,
    /// What happened to the file.
    pub kind: FileEventKind,
}

/// Callback-driven file system watcher.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Create a watcher delivering events to `handler`.
    ///
    /// The handler runs on notify's internal thread and must not block.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS file watcher cannot be initialized
    /// (e.g., system resource limits).
    pub fn new<F>(handler: F) -> Result<Self>
    where
        F: Fn(FileEvent) + Send + 'static,
    {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let kind = classify(&event.kind);
                    for path in event.paths {
                        handler(FileEvent { path, kind });
                    }
                }
                Err(e) => log::warn!("[Storage] File watcher error: {e}"),
            }
        })
        .context("Failed to create file watcher")?;

        Ok(Self { watcher })
    }

    /// Start watching `dir` (non-recursively).
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not exist or watch registration fails.
    pub fn watch(&mut self, dir: &Path) -> Result<()> {
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;
        log::debug!("[Storage] Watching for file changes: {:?}", dir);
        Ok(())
    }
}

/// Map `notify::EventKind` to [`FileEventKind`].
fn classify(kind: &notify::EventKind) -> FileEventKind {
    match kind {
        notify::EventKind::Create(_) => FileEventKind::Create,
        notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
        notify::EventKind::Modify(_) => FileEventKind::Modify,
        notify::EventKind::Remove(_) => FileEventKind::Delete,
        _ => FileEventKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_watcher() {
        assert!(FileWatcher::new(|_| {}).is_ok());
    }

    #[test]
    fn test_watch_nonexistent_path_fails() {
        let mut watcher = FileWatcher::new(|_| {}).expect("Should create watcher");
        assert!(watcher.watch(Path::new("/nonexistent/path/abc123")).is_err());
    }

    #[test]
    fn test_classify_rename_vs_modify() {
        use notify::event::{ModifyKind, RenameMode};
        assert_eq!(
            classify(&notify::EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            FileEventKind::Rename
        );
        assert_eq!(
            classify(&notify::EventKind::Modify(ModifyKind::Any)),
            FileEventKind::Modify
        );
        assert!(!classify(&notify::EventKind::Any).is_mutation());
    }
}
