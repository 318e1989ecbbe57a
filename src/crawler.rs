//! Recursive crawler that populates the path index.
//!
//! For each directory the crawler:
//! 1. Rejects unchanged or ignored entries
//! 2. Registers the directory and reports it to the discovery callback
//! 3. Lists the children with one `read_dir`
//! 4. Crawls priority children (project config dir, manifest) one by one
//! 5. Fans out the remaining children concurrently
//!
//! Disk access is bounded by a shared semaphore. A crawl carries a
//! generation token; once it is cancelled the crawl stops writing.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{FsError, FsResult};
use crate::events::FileEvent;
use crate::index::{Insertion, PathIndex};
use crate::manifest::{DeclareManifest, ManifestRegistry};
use crate::path::IndexPath;
use crate::project::{FileHandlers, ProjectRegistrar};
use crate::stats::{self, Stats, StatsKind};
use crate::watcher::WatchError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Called for every directory as it is first registered.
pub type DirectoryCallback = Arc<dyn Fn(&IndexPath) -> Result<(), WatchError> + Send + Sync>;

/// Called for every directory removed from the index.
pub type RemovalCallback = Arc<dyn Fn(&IndexPath) + Send + Sync>;

/// Called after each path finishes processing.
pub type TickCallback = Arc<dyn Fn(&IndexPath) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlReason {
    Initial,
    Watch,
}

/// Per-request crawl state, cheap to clone into child tasks.
#[derive(Clone)]
pub struct CrawlContext {
    pub reason: CrawlReason,
    pub diagnostics: Diagnostics,
    pub on_directory: Option<DirectoryCallback>,
    pub on_directory_removed: Option<RemovalCallback>,
    pub on_tick: Option<TickCallback>,
    pub generation: CancellationToken,
}

impl CrawlContext {
    pub fn new(reason: CrawlReason) -> Self {
        Self {
            reason,
            diagnostics: Diagnostics::new(),
            on_directory: None,
            on_directory_removed: None,
            on_tick: None,
            generation: CancellationToken::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn on_directory(mut self, callback: DirectoryCallback) -> Self {
        self.on_directory = Some(callback);
        self
    }

    pub fn on_directory_removed(mut self, callback: RemovalCallback) -> Self {
        self.on_directory_removed = Some(callback);
        self
    }

    pub fn on_tick(mut self, callback: TickCallback) -> Self {
        self.on_tick = Some(callback);
        self
    }

    pub fn with_generation(mut self, generation: CancellationToken) -> Self {
        self.generation = generation;
        self
    }

    /// The root this crawl serves was unwatched.
    pub fn is_stale(&self) -> bool {
        self.generation.is_cancelled()
    }

    fn tick(&self, path: &IndexPath) {
        if let Some(on_tick) = &self.on_tick {
            on_tick(path);
        }
    }
}

impl std::fmt::Debug for CrawlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlContext")
            .field("reason", &self.reason)
            .field("diagnostics", &self.diagnostics.len())
            .field("stale", &self.is_stale())
            .finish()
    }
}

/// Naming rules the crawler applies.
#[derive(Debug, Clone)]
pub struct CrawlPolicy {
    pub denylist: HashSet<String>,
    /// Ordered: earlier names are crawled first.
    pub priority: Vec<String>,
    pub manifest_filename: String,
    pub dependency_dir: String,
    pub config_dir: String,
    pub config_filenames: HashSet<String>,
}

impl CrawlPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            denylist: settings.crawl.denylist.iter().cloned().collect(),
            priority: settings.crawl.priority.clone(),
            manifest_filename: settings.project.manifest_filename.clone(),
            dependency_dir: settings.project.dependency_dir.clone(),
            config_dir: settings.project.config_dir.clone(),
            config_filenames: settings.project.config_filenames.iter().cloned().collect(),
        }
    }

    pub fn is_denied(&self, path: &IndexPath) -> bool {
        path.basename().is_some_and(|name| self.denylist.contains(name))
    }

    pub fn priority_rank(&self, path: &IndexPath) -> Option<usize> {
        let name = path.basename()?;
        self.priority.iter().position(|p| p == name)
    }

    /// Project root declared by a config file at `path`, if it is one.
    ///
    /// Both `<root>/<config>` and `<root>/<config_dir>/<config>` count.
    pub fn project_root_for_config(&self, path: &IndexPath) -> Option<IndexPath> {
        let name = path.basename()?;
        if !self.config_filenames.contains(name) {
            return None;
        }
        if path.segments().contains(&self.dependency_dir.as_str()) {
            return None;
        }
        let parent = path.parent()?;
        if parent.basename() == Some(self.config_dir.as_str()) {
            parent.parent()
        } else {
            Some(parent)
        }
    }

    fn always_indexed(&self, path: &IndexPath) -> bool {
        path.basename()
            .is_some_and(|name| name == self.manifest_filename || self.config_filenames.contains(name))
    }
}

pub struct Crawler {
    index: Arc<PathIndex>,
    manifests: Arc<ManifestRegistry>,
    registrar: Arc<dyn ProjectRegistrar>,
    handlers: Arc<dyn FileHandlers>,
    policy: CrawlPolicy,
    io_permits: Arc<Semaphore>,
}

impl Crawler {
    pub fn new(
        index: Arc<PathIndex>,
        manifests: Arc<ManifestRegistry>,
        registrar: Arc<dyn ProjectRegistrar>,
        handlers: Arc<dyn FileHandlers>,
        policy: CrawlPolicy,
        io_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            index,
            manifests,
            registrar,
            handlers,
            policy,
            io_permits,
        }
    }

    pub fn index(&self) -> &Arc<PathIndex> {
        &self.index
    }

    pub fn policy(&self) -> &CrawlPolicy {
        &self.policy
    }

    /// Ignore policy: denylisted names, and files no handler recognizes.
    pub fn is_ignored(&self, path: &IndexPath, kind: StatsKind) -> bool {
        if self.policy.is_denied(path) {
            return true;
        }
        match kind {
            StatsKind::File => {
                if self.policy.always_indexed(path) {
                    return false;
                }
                let project = self.registrar.find_project(path);
                !self.handlers.handles(path, project)
            }
            _ => false,
        }
    }

    /// Register `path` as a directory and crawl its children.
    ///
    /// Returns `false` without side effects when the stats are unchanged.
    pub fn add_directory(
        self: &Arc<Self>,
        path: IndexPath,
        stats: Stats,
        ctx: CrawlContext,
    ) -> BoxFuture<'static, FsResult<bool>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            if !this.index.has_stats_changed(&path, &stats) {
                return Ok(false);
            }
            if this.is_ignored(&path, StatsKind::Directory) {
                crate::debug_event!("crawler", "ignored", "{path}");
                return Ok(false);
            }
            let previously_known = match this.index.insert_directory(&path, stats, &ctx.generation) {
                Insertion::Stale => return Ok(false),
                Insertion::Inserted => false,
                Insertion::Replaced(_) => true,
            };

            if let Some(on_directory) = &ctx.on_directory {
                if let Err(e) = on_directory(&path) {
                    tracing::warn!("[crawler] failed to watch {path}: {e}");
                    ctx.diagnostics.push(Diagnostic::warning(
                        "watch/subscribe",
                        path.as_path(),
                        e.to_string(),
                    ));
                }
            }

            let listed = {
                let _permit = this.io_permits.acquire().await.ok();
                stats::read_dir(&path).await
            };
            let children: Vec<IndexPath> = match listed {
                Ok(children) => children.into_iter().map(IndexPath::new).collect(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Removed between stat and read_dir
                    this.remove(&path, &ctx);
                    return Ok(false);
                }
                Err(e) => return Err(FsError::io(path.to_path_buf(), e)),
            };

            if ctx.is_stale() {
                return Ok(false);
            }
            if previously_known {
                this.reconcile(&path, &children, &ctx);
            }

            let (mut priority, rest): (Vec<_>, Vec<_>) = children
                .into_iter()
                .partition(|child| this.policy.priority_rank(child).is_some());
            priority.sort_by_key(|child| this.policy.priority_rank(child));

            for child in priority {
                this.crawl_child(child, ctx.clone()).await?;
            }

            let mut tasks = JoinSet::new();
            for child in rest {
                tasks.spawn(this.crawl_child(child, ctx.clone()));
            }

            let mut first_error = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            std::panic::resume_unwind(join_error.into_panic());
                        }
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }

            if this.registrar.is_project_root(&path) {
                this.registrar.mark_initialized(&path);
                crate::debug_event!("crawler", "project initialized", "{path}");
            }

            ctx.tick(&path);
            Ok(true)
        })
    }

    /// Register a single file.
    ///
    /// Emits `NewFile` on first sight and `ChangedFile` for watch-driven
    /// updates of a known file.
    pub async fn add_file(
        &self,
        path: &IndexPath,
        stats: Stats,
        ctx: &CrawlContext,
    ) -> FsResult<bool> {
        if !self.index.has_stats_changed(path, &stats) {
            return Ok(false);
        }
        if self.is_ignored(path, StatsKind::File) {
            return Ok(false);
        }

        let previous = match self.index.insert_file(path, stats, &ctx.generation) {
            Insertion::Stale => return Ok(false),
            Insertion::Inserted => None,
            Insertion::Replaced(old) => Some(old),
        };

        self.declare_config_project(path, ctx).await;

        if self.manifests.layout().is_manifest_name(path) {
            let request = DeclareManifest::new(path.clone()).with_generation(ctx.generation.clone());
            self.manifests
                .declare_manifest(request, &ctx.diagnostics)
                .await?;
        }

        // Unwatched while suspended above; the entry is already evicted
        if ctx.is_stale() {
            return Ok(false);
        }

        match previous {
            None => self.index.events().send(FileEvent::NewFile { path: path.clone() }),
            Some(old_stats) if ctx.reason == CrawlReason::Watch => {
                self.index.events().send(FileEvent::ChangedFile {
                    path: path.clone(),
                    old_stats,
                    new_stats: stats,
                })
            }
            Some(_) => {}
        }

        ctx.tick(path);
        Ok(true)
    }

    async fn declare_config_project(&self, path: &IndexPath, ctx: &CrawlContext) {
        let Some(root) = self.policy.project_root_for_config(path) else {
            return;
        };
        if ctx.is_stale() {
            return;
        }
        self.registrar.declare_project(&root, &ctx.diagnostics).await;
    }

    /// Re-stat one path and bring the index in line with the disk.
    ///
    /// Paths whose parent was never crawled are ignored; they are outside
    /// every watched tree or inside an ignored directory.
    pub async fn refresh_path(self: &Arc<Self>, path: &IndexPath, ctx: CrawlContext) -> FsResult<bool> {
        let known = self.index.stats(path).is_some();
        let parent_known = path
            .parent()
            .is_some_and(|parent| self.index.is_directory(&parent));
        if !known && !parent_known {
            crate::debug_event!("crawler", "outside index", "{path}");
            return Ok(false);
        }

        self.crawl_child(path.clone(), ctx).await
    }

    fn crawl_child(self: &Arc<Self>, path: IndexPath, ctx: CrawlContext) -> BoxFuture<'static, FsResult<bool>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            if ctx.is_stale() {
                return Ok(false);
            }

            let stat = {
                let _permit = this.io_permits.acquire().await.ok();
                stats::stat_entry(&path).await
            };

            let stats = match stat {
                Ok(stats) => stats,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Concurrent deletion, not a failure
                    let known = this.index.stats(&path).is_some();
                    return Ok(known && this.remove(&path, &ctx));
                }
                Err(e) => return Err(FsError::io(path.to_path_buf(), e)),
            };

            if let Some(old) = this.index.stats(&path) {
                if old.kind != stats.kind {
                    this.remove(&path, &ctx);
                }
            }

            match stats.kind {
                StatsKind::Directory => this.add_directory(path, stats, ctx).await,
                StatsKind::File => this.add_file(&path, stats, &ctx).await,
                StatsKind::Unknown => Ok(false),
            }
        })
    }

    /// Drop listed children that vanished from disk.
    fn reconcile(&self, dir: &IndexPath, on_disk: &[IndexPath], ctx: &CrawlContext) {
        let present: HashSet<&IndexPath> = on_disk.iter().collect();
        for child in self.index.readdir(dir) {
            if !present.contains(&child) {
                crate::debug_event!("crawler", "vanished", "{child}");
                self.remove(&child, ctx);
            }
        }
    }

    /// Delete `path` and its subtree, reporting removed directories.
    ///
    /// Returns `false` without touching the index if the crawl is stale.
    fn remove(&self, path: &IndexPath, ctx: &CrawlContext) -> bool {
        if ctx.is_stale() {
            return false;
        }
        let was_directory = self.index.is_directory(path);
        self.index.handle_deletion(path);
        if was_directory {
            if let Some(on_removed) = &ctx.on_directory_removed {
                on_removed(path);
            }
        }
        true
    }
}
