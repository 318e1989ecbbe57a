//! Watch lifecycle: pending crawls, active handles and the event loop.
//!
//! At most one active handle covers any path, and at most one crawl runs
//! over any subtree. Watching a path that a pending or active root already
//! covers joins that root instead of starting a second crawl. Watching an
//! ancestor first waits for pending crawls below it, then absorbs the
//! active roots they leave behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crawler::{CrawlContext, CrawlReason, Crawler, DirectoryCallback, RemovalCallback};
use crate::diagnostics::Diagnostics;
use crate::error::{FsError, FsResult};
use crate::path::IndexPath;
use crate::stats;

use super::backend::{RawEvent, WatchBackend};
use super::error::WatchError;
use super::event::ChangeEvent;

/// A root whose initial crawl is still running.
#[derive(Debug, Clone)]
struct PendingWatch {
    done: watch::Receiver<Option<bool>>,
    generation: CancellationToken,
}

impl PendingWatch {
    /// Resolves to whether the crawl succeeded.
    async fn wait(mut self) -> bool {
        match self.done.wait_for(|state| state.is_some()).await {
            Ok(state) => state.unwrap_or(false),
            // Sender dropped without settling
            Err(_) => false,
        }
    }
}

/// An installed watch on one root.
#[derive(Debug)]
pub struct WatchHandle {
    root: IndexPath,
    generation: CancellationToken,
}

impl WatchHandle {
    pub fn root(&self) -> &IndexPath {
        &self.root
    }
}

#[derive(Debug, Default)]
struct WatchState {
    pending: HashMap<IndexPath, PendingWatch>,
    active: BTreeMap<IndexPath, WatchHandle>,
}

impl WatchState {
    fn pending_covering(&self, path: &IndexPath) -> Option<(&IndexPath, &PendingWatch)> {
        self.pending
            .iter()
            .find(|(root, _)| root.is_ancestor_or_self_of(path))
    }

    fn pending_below(&self, root: &IndexPath) -> Vec<PendingWatch> {
        self.pending
            .iter()
            .filter(|(pending_root, _)| pending_root.is_descendant_of(root))
            .map(|(_, pending)| pending.clone())
            .collect()
    }

    fn active_covering(&self, path: &IndexPath) -> Option<&WatchHandle> {
        self.active
            .values()
            .find(|handle| handle.root.is_ancestor_or_self_of(path))
    }

    fn take_descendants(&mut self, root: &IndexPath) -> Vec<WatchHandle> {
        let nested: Vec<IndexPath> = self
            .active
            .keys()
            .filter(|active| active.is_descendant_of(root))
            .cloned()
            .collect();
        nested
            .iter()
            .filter_map(|active| self.active.remove(active))
            .collect()
    }
}

enum WatchPlan {
    Join(PendingWatch),
    /// Crawls below the requested root must finish first.
    Drain(Vec<PendingWatch>),
    Covered,
    Start {
        done: watch::Sender<Option<bool>>,
        generation: CancellationToken,
        subsumed: Vec<WatchHandle>,
    },
}

/// Owns every watch root and turns native events into index refreshes.
pub struct WatchOrchestrator {
    crawler: Arc<Crawler>,
    backend: Arc<dyn WatchBackend>,
    state: Mutex<WatchState>,
}

impl WatchOrchestrator {
    pub fn new(crawler: Arc<Crawler>, backend: Arc<dyn WatchBackend>) -> Self {
        Self {
            crawler,
            backend,
            state: Mutex::new(WatchState::default()),
        }
    }

    pub fn crawler(&self) -> &Arc<Crawler> {
        &self.crawler
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether a root covering `path` is still in its initial crawl.
    pub fn is_in_flight(&self, path: &IndexPath) -> bool {
        self.state.lock().pending_covering(path).is_some()
    }

    pub fn watched_roots(&self) -> Vec<IndexPath> {
        self.state.lock().active.keys().cloned().collect()
    }

    /// Watch `root` and crawl it into the index.
    ///
    /// Resolves once the tree is indexed. Calls covered by a root that is
    /// already pending wait for that crawl; calls covered by an active root
    /// return immediately.
    pub async fn watch(&self, root: IndexPath) -> FsResult<()> {
        loop {
            match self.plan(&root) {
                WatchPlan::Drain(below) => {
                    for pending in below {
                        // Failed or not, the crawl below is over
                        pending.wait().await;
                    }
                }
                plan => return self.execute(root, plan).await,
            }
        }
    }

    fn plan(&self, root: &IndexPath) -> WatchPlan {
        let mut state = self.state.lock();
        if let Some((pending_root, pending)) = state.pending_covering(root) {
            crate::debug_event!("watcher", "joining", "{root} under pending {pending_root}");
            return WatchPlan::Join(pending.clone());
        }
        if let Some(handle) = state.active_covering(root) {
            crate::debug_event!("watcher", "covered", "{root} by {}", handle.root);
            return WatchPlan::Covered;
        }
        let below = state.pending_below(root);
        if !below.is_empty() {
            crate::debug_event!("watcher", "draining", "{root} ({} pending below)", below.len());
            return WatchPlan::Drain(below);
        }

        let subsumed = state.take_descendants(root);
        let (done, receiver) = watch::channel(None);
        let generation = CancellationToken::new();
        state.pending.insert(
            root.clone(),
            PendingWatch {
                done: receiver,
                generation: generation.clone(),
            },
        );
        WatchPlan::Start {
            done,
            generation,
            subsumed,
        }
    }

    async fn execute(&self, root: IndexPath, plan: WatchPlan) -> FsResult<()> {
        match plan {
            WatchPlan::Join(pending) => {
                if pending.wait().await {
                    Ok(())
                } else {
                    Err(FsError::WatchFailed {
                        root: root.into_path_buf(),
                    })
                }
            }
            WatchPlan::Covered | WatchPlan::Drain(_) => Ok(()),
            WatchPlan::Start {
                done,
                generation,
                subsumed,
            } => {
                for handle in subsumed {
                    crate::debug_event!("watcher", "subsumed", "{} by {root}", handle.root);
                    self.backend.release_root(&handle.root);
                }

                let diagnostics = Diagnostics::new();
                let result = self
                    .initial_crawl(&root, generation.clone(), diagnostics.clone())
                    .await;
                self.settle(&root, generation.clone(), result.is_ok());
                done.send_replace(Some(result.is_ok()));

                if let Err(e) = result {
                    self.backend.close_root(&root);
                    tracing::error!("[watcher] failed to watch {root}: {e}");
                    return Err(e.with_diagnostics(diagnostics.take()));
                }
                if generation.is_cancelled() {
                    crate::debug_event!("watcher", "unwatched during crawl", "{root}");
                    return Ok(());
                }

                let index = self.crawler.index();
                crate::log_event!(
                    "watcher",
                    "watching",
                    "{root} ({} files, {} directories, {})",
                    index.count_files(&root),
                    index.directory_count(),
                    self.backend.name()
                );

                for diagnostic in diagnostics.snapshot() {
                    tracing::warn!("[watcher] {diagnostic}");
                }
                if diagnostics.has_errors() {
                    return Err(FsError::Diagnostics {
                        root: root.into_path_buf(),
                        diagnostics: diagnostics.take(),
                    });
                }
                Ok(())
            }
        }
    }

    async fn initial_crawl(
        &self,
        root: &IndexPath,
        generation: CancellationToken,
        diagnostics: Diagnostics,
    ) -> FsResult<()> {
        let stats = match stats::stat(root).await {
            Ok(stats) => stats,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FsError::NotFound {
                    path: root.to_path_buf(),
                });
            }
            Err(e) => return Err(FsError::io(root.to_path_buf(), e)),
        };
        if !stats.is_directory() {
            return Err(FsError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        self.backend.open_root(root)?;

        let ctx = CrawlContext::new(CrawlReason::Initial)
            .with_diagnostics(diagnostics)
            .with_generation(generation)
            .on_directory(self.directory_callback())
            .on_directory_removed(self.removal_callback());
        self.crawler.add_directory(root.clone(), stats, ctx).await?;
        Ok(())
    }

    /// Retire the pending entry and install the handle if still wanted.
    fn settle(&self, root: &IndexPath, generation: CancellationToken, ok: bool) {
        let mut state = self.state.lock();
        state.pending.remove(root);
        if !ok || generation.is_cancelled() {
            return;
        }

        // A concurrent watch may have claimed an ancestor meanwhile
        if let Some(handle) = state.active_covering(root) {
            crate::debug_event!("watcher", "subsumed", "{root} by {}", handle.root);
            self.backend.release_root(root);
            return;
        }
        for handle in state.take_descendants(root) {
            self.backend.release_root(&handle.root);
        }
        state.active.insert(
            root.clone(),
            WatchHandle {
                root: root.clone(),
                generation,
            },
        );
    }

    /// Stop watching `root` and forget everything indexed below it.
    ///
    /// Pending crawls at or below `root` are cancelled and write nothing
    /// further. No events are emitted for the evicted entries.
    pub fn unwatch(&self, root: &IndexPath) -> bool {
        let (handle, cancelled) = {
            let mut state = self.state.lock();
            let handle = state.active.remove(root);
            let cancelled: Vec<CancellationToken> = state
                .pending
                .iter()
                .filter(|(pending_root, _)| root.is_ancestor_or_self_of(pending_root))
                .map(|(_, pending)| pending.generation.clone())
                .collect();
            (handle, cancelled)
        };

        if handle.is_none() && cancelled.is_empty() {
            return false;
        }

        for generation in &cancelled {
            generation.cancel();
        }
        if let Some(handle) = &handle {
            handle.generation.cancel();
        }
        self.backend.close_root(root);
        let evicted = self.crawler.index().evict(root);

        crate::log_event!("watcher", "unwatched", "{root} ({} files)", evicted.len());
        true
    }

    pub fn unwatch_all(&self) {
        let roots: Vec<IndexPath> = {
            let state = self.state.lock();
            let mut roots: Vec<_> = state.active.keys().cloned().collect();
            roots.extend(state.pending.keys().cloned());
            roots
        };
        for root in roots {
            self.unwatch(&root);
        }
    }

    /// Re-stat one path under a watched root.
    ///
    /// Paths outside every root are ignored and yield `Ok(false)`.
    pub async fn refresh_path(&self, path: &IndexPath) -> FsResult<bool> {
        let Some(generation) = self.generation_for(path) else {
            crate::debug_event!("watcher", "unwatched path", "{path}");
            return Ok(false);
        };

        let diagnostics = Diagnostics::new();
        let ctx = CrawlContext::new(CrawlReason::Watch)
            .with_diagnostics(diagnostics.clone())
            .with_generation(generation)
            .on_directory(self.directory_callback())
            .on_directory_removed(self.removal_callback());

        let changed = self
            .crawler
            .refresh_path(path, ctx)
            .await
            .map_err(|e| e.with_diagnostics(diagnostics.snapshot()))?;

        if diagnostics.has_errors() {
            return Err(FsError::Diagnostics {
                root: path.to_path_buf(),
                diagnostics: diagnostics.take(),
            });
        }
        for diagnostic in diagnostics.take() {
            tracing::warn!("[watcher] {diagnostic}");
        }
        Ok(changed)
    }

    /// Apply one native change notification.
    pub async fn handle_change(&self, change: ChangeEvent) {
        let path = change.resolve();
        match self.refresh_path(&path).await {
            Ok(true) => crate::debug_event!("watcher", "refreshed", "{path}"),
            Ok(false) => {}
            Err(e) => tracing::error!("[watcher] refresh failed: {e}"),
        }
    }

    /// Consume raw notify results until the channel closes or the
    /// orchestrator is dropped.
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<RawEvent>) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(res) = events.recv().await {
                let Some(this) = orchestrator.upgrade() else {
                    break;
                };
                match res {
                    Ok(event) => {
                        for change in ChangeEvent::from_notify(&event) {
                            this.handle_change(change).await;
                        }
                    }
                    Err(e) => {
                        let error = WatchError::EventError {
                            details: e.to_string(),
                        };
                        tracing::error!("[watcher] {error}");
                    }
                }
            }
            crate::debug_event!("watcher", "event loop stopped");
        })
    }

    fn generation_for(&self, path: &IndexPath) -> Option<CancellationToken> {
        let state = self.state.lock();
        if let Some(handle) = state.active_covering(path) {
            return Some(handle.generation.clone());
        }
        state
            .pending_covering(path)
            .map(|(_, pending)| pending.generation.clone())
    }

    fn directory_callback(&self) -> DirectoryCallback {
        let backend = Arc::clone(&self.backend);
        Arc::new(move |dir: &IndexPath| backend.watch_directory(dir))
    }

    fn removal_callback(&self) -> RemovalCallback {
        let backend = Arc::clone(&self.backend);
        Arc::new(move |dir: &IndexPath| backend.forget_directory(dir))
    }
}

impl std::fmt::Debug for WatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WatchOrchestrator")
            .field("backend", &self.backend.name())
            .field("pending", &state.pending.len())
            .field("active", &state.active.len())
            .finish()
    }
}
