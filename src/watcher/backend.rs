//! Native watch backends.
//!
//! Two strategies, picked once per process:
//! - [`RecursiveBackend`]: one recursive subscription per root, for
//!   platforms where the OS watches whole trees (macOS, Windows)
//! - [`PerDirectoryBackend`]: one subscription per crawled directory,
//!   installed as the crawler discovers them (Linux inotify)
//!
//! Both feed the same channel of raw notify results.

use std::collections::BTreeSet;
use std::sync::Arc;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::WatchBackendKind;
use crate::path::IndexPath;

use super::error::WatchError;

pub type RawEvent = notify::Result<Event>;

/// Capability handed to the orchestrator for native subscriptions.
pub trait WatchBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start watching a new root, before its crawl begins.
    fn open_root(&self, root: &IndexPath) -> Result<(), WatchError>;

    /// Called for each directory the crawler registers under a root.
    fn watch_directory(&self, dir: &IndexPath) -> Result<(), WatchError>;

    /// Stop watching `root` and everything below it.
    fn close_root(&self, root: &IndexPath);

    /// `dir` left the index; drop any subscriptions at or below it.
    fn forget_directory(&self, _dir: &IndexPath) {}

    /// `root` was subsumed by a watch on one of its ancestors.
    ///
    /// Subscriptions the ancestor also needs must survive.
    fn release_root(&self, root: &IndexPath) {
        self.close_root(root);
    }
}

/// Build the backend for `kind`, delivering events into `sender`.
pub fn create_backend(
    kind: WatchBackendKind,
    sender: mpsc::Sender<RawEvent>,
) -> Result<Arc<dyn WatchBackend>, WatchError> {
    let backend: Arc<dyn WatchBackend> = match kind.resolve() {
        WatchBackendKind::Recursive => Arc::new(RecursiveBackend::new(sender)?),
        _ => Arc::new(PerDirectoryBackend::new(sender)?),
    };
    crate::debug_event!("watcher", "backend", "{}", backend.name());
    Ok(backend)
}

fn notify_watcher(sender: mpsc::Sender<RawEvent>) -> Result<RecommendedWatcher, WatchError> {
    // notify calls back on its own thread, outside the runtime
    let watcher = notify::recommended_watcher(move |res: RawEvent| {
        let _ = sender.blocking_send(res);
    })?;
    Ok(watcher)
}

pub struct RecursiveBackend {
    watcher: Mutex<RecommendedWatcher>,
}

impl RecursiveBackend {
    pub fn new(sender: mpsc::Sender<RawEvent>) -> Result<Self, WatchError> {
        Ok(Self {
            watcher: Mutex::new(notify_watcher(sender)?),
        })
    }
}

impl WatchBackend for RecursiveBackend {
    fn name(&self) -> &'static str {
        "recursive"
    }

    fn open_root(&self, root: &IndexPath) -> Result<(), WatchError> {
        self.watcher
            .lock()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| WatchError::path(root.as_path(), e))?;
        crate::debug_event!("watcher", "subscribed", "{root} (recursive)");
        Ok(())
    }

    fn watch_directory(&self, _dir: &IndexPath) -> Result<(), WatchError> {
        Ok(())
    }

    fn close_root(&self, root: &IndexPath) {
        if let Err(e) = self.watcher.lock().unwatch(root) {
            crate::debug_event!("watcher", "unwatch failed", "{root}: {e}");
        }
    }
}

pub struct PerDirectoryBackend {
    watcher: Mutex<RecommendedWatcher>,
    subscribed: Mutex<BTreeSet<IndexPath>>,
}

impl PerDirectoryBackend {
    pub fn new(sender: mpsc::Sender<RawEvent>) -> Result<Self, WatchError> {
        Ok(Self {
            watcher: Mutex::new(notify_watcher(sender)?),
            subscribed: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    fn unsubscribe(&self, top: &IndexPath) -> usize {
        let closing: Vec<IndexPath> = {
            let mut subscribed = self.subscribed.lock();
            let closing: Vec<_> = subscribed
                .range(top.clone()..)
                .take_while(|dir| top.is_ancestor_or_self_of(dir))
                .cloned()
                .collect();
            for dir in &closing {
                subscribed.remove(dir);
            }
            closing
        };

        let mut watcher = self.watcher.lock();
        for dir in &closing {
            // Deleted directories are already gone from the OS side
            let _ = watcher.unwatch(dir);
        }
        closing.len()
    }
}

impl WatchBackend for PerDirectoryBackend {
    fn name(&self) -> &'static str {
        "per-directory"
    }

    fn open_root(&self, _root: &IndexPath) -> Result<(), WatchError> {
        Ok(())
    }

    fn watch_directory(&self, dir: &IndexPath) -> Result<(), WatchError> {
        // Re-issued even when tracked: a directory recreated at the same
        // path is a new inode the old subscription never saw
        let mut watcher = self.watcher.lock();
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            self.subscribed.lock().remove(dir);
            return Err(WatchError::path(dir.as_path(), e));
        }
        self.subscribed.lock().insert(dir.clone());
        Ok(())
    }

    fn close_root(&self, root: &IndexPath) {
        let closed = self.unsubscribe(root);
        crate::debug_event!("watcher", "unsubscribed", "{root} ({closed} directories)");
    }

    fn forget_directory(&self, dir: &IndexPath) {
        let forgotten = self.unsubscribe(dir);
        if forgotten > 0 {
            crate::debug_event!("watcher", "forgot", "{dir} ({forgotten} directories)");
        }
    }

    fn release_root(&self, _root: &IndexPath) {
        // Per-directory subscriptions carry over to the ancestor root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_per_directory_close_root_drops_subtree_only() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::create_dir_all(root.join("ab")).unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let backend = PerDirectoryBackend::new(tx).unwrap();
        let base = IndexPath::new(root);
        for dir in ["a", "a/b", "ab"] {
            backend.watch_directory(&base.join(dir)).unwrap();
        }
        backend.watch_directory(&base.join("a")).unwrap();
        assert_eq!(backend.subscription_count(), 3);

        backend.close_root(&base.join("a"));

        assert_eq!(backend.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_per_directory_failure_is_not_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let backend = PerDirectoryBackend::new(tx).unwrap();

        let missing = IndexPath::new(temp_dir.path().join("missing"));
        let result = backend.watch_directory(&missing);

        assert!(matches!(result, Err(WatchError::PathWatchFailed { .. })));
        assert_eq!(backend.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_forgotten_directory_can_be_subscribed_again() {
        let temp_dir = TempDir::new().unwrap();
        let base = IndexPath::new(temp_dir.path());
        std::fs::create_dir_all(base.join("sub/inner")).unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let backend = PerDirectoryBackend::new(tx).unwrap();
        for dir in ["sub", "sub/inner"] {
            backend.watch_directory(&base.join(dir)).unwrap();
        }

        std::fs::remove_dir_all(base.join("sub")).unwrap();
        backend.forget_directory(&base.join("sub"));
        assert_eq!(backend.subscription_count(), 0);

        std::fs::create_dir(base.join("sub")).unwrap();
        backend.watch_directory(&base.join("sub")).unwrap();
        assert_eq!(backend.subscription_count(), 1);
    }
}
