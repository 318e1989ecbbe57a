//! Public facade over the index, crawler and watchers.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::crawler::{CrawlPolicy, Crawler};
use crate::diagnostics::Diagnostics;
use crate::error::{FsError, FsResult};
use crate::events::{EventBus, FileEvent};
use crate::globs::{self, GlobOptions};
use crate::index::{Existence, PathIndex};
use crate::manifest::{
    DeclareManifest, ManifestDefinition, ManifestLayout, ManifestNormalizer, ManifestRegistry,
    PackageJsonNormalizer, PartialManifest,
};
use crate::path::IndexPath;
use crate::project::{
    ExtensionHandlers, FileHandlers, InMemoryProjects, ManifestBroadcaster, ProjectRegistrar,
    WorkerBroadcast,
};
use crate::stats::{self, Stats};
use crate::watcher::{WatchBackend, WatchError, WatchOrchestrator, create_backend};

/// In-memory view of every watched project tree.
///
/// Queries are synchronous and answer from the index only. `watch`,
/// `refresh_path` and `exists_hard` touch the disk.
pub struct MemoryFs {
    settings: Arc<Settings>,
    index: Arc<PathIndex>,
    manifests: Arc<ManifestRegistry>,
    watches: Arc<WatchOrchestrator>,
    event_loop: Option<JoinHandle<()>>,
}

impl MemoryFs {
    pub fn builder() -> MemoryFsBuilder {
        MemoryFsBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<PathIndex> {
        &self.index
    }

    pub fn backend_name(&self) -> &'static str {
        self.watches.backend_name()
    }

    /// Receive `NewFile`, `ChangedFile` and `DeletedFile` events.
    pub fn subscribe(&self) -> broadcast::Receiver<FileEvent> {
        self.index.events().subscribe()
    }

    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        self.index.is_file(&IndexPath::new(path))
    }

    pub fn is_directory(&self, path: impl AsRef<Path>) -> bool {
        self.index.is_directory(&IndexPath::new(path))
    }

    /// Soft existence check that never touches the disk.
    ///
    /// `Unknown` proves nothing. Use [`exists_hard`](Self::exists_hard)
    /// when a definite answer matters.
    pub fn exists(&self, path: impl AsRef<Path>) -> Existence {
        let path = IndexPath::new(path);
        self.index.exists(&path, |p| self.watches.is_in_flight(p))
    }

    /// Definite existence check, falling back to a stat when the index
    /// cannot answer.
    pub async fn exists_hard(&self, path: impl AsRef<Path>) -> bool {
        match self.exists(&path) {
            Existence::Exists => true,
            Existence::Missing => false,
            Existence::Unknown => stats::stat_entry(path.as_ref()).await.is_ok(),
        }
    }

    pub fn get_file_stats(&self, path: impl AsRef<Path>) -> FsResult<Stats> {
        let path = IndexPath::new(path);
        self.index.stats(&path).ok_or_else(|| FsError::NotFound {
            path: path.into_path_buf(),
        })
    }

    /// Modification time in milliseconds since the epoch.
    pub fn get_mtime(&self, path: impl AsRef<Path>) -> FsResult<i64> {
        self.get_file_stats(path).map(|stats| stats.mtime)
    }

    /// Direct children of `dir`, sorted.
    pub fn readdir(&self, dir: impl AsRef<Path>) -> Vec<IndexPath> {
        self.index.readdir(&IndexPath::new(dir))
    }

    pub fn get_all_files_in_directory(&self, dir: impl AsRef<Path>) -> Vec<IndexPath> {
        self.index.get_all_files_in_directory(&IndexPath::new(dir))
    }

    /// Every indexed file, sorted.
    pub fn get_files(&self) -> Vec<IndexPath> {
        self.index.files()
    }

    pub fn count_files(&self, dir: impl AsRef<Path>) -> usize {
        self.index.count_files(&IndexPath::new(dir))
    }

    /// Manifest declared directly in `dir`.
    pub fn get_manifest(&self, dir: impl AsRef<Path>) -> Option<Arc<ManifestDefinition>> {
        self.index.get_manifest(&IndexPath::new(dir))
    }

    /// Nearest manifest at or above `path`.
    pub fn get_owned_manifest(&self, path: impl AsRef<Path>) -> Option<Arc<ManifestDefinition>> {
        self.index.get_owned_manifest(&IndexPath::new(path))
    }

    pub fn get_partial_manifest(&self, dir: impl AsRef<Path>) -> Option<PartialManifest> {
        self.get_manifest(dir).map(|definition| definition.partial())
    }

    pub fn manifests(&self) -> Vec<Arc<ManifestDefinition>> {
        self.index.manifests()
    }

    /// Indexed files under `cwd` matching the options, sorted.
    pub fn glob(&self, cwd: impl AsRef<Path>, options: &GlobOptions) -> FsResult<Vec<IndexPath>> {
        globs::glob(&self.index, &IndexPath::new(cwd), options)
    }

    /// Watch `root` and index everything below it.
    ///
    /// Relative roots resolve against the current directory.
    pub async fn watch(&self, root: impl AsRef<Path>) -> FsResult<()> {
        let root = IndexPath::absolute(root.as_ref()).map_err(|e| FsError::io(root.as_ref(), e))?;
        self.watches.watch(root).await
    }

    /// Stop watching `root` and evict its entries. Returns `false` if
    /// `root` was not a watch root.
    pub fn unwatch(&self, root: impl AsRef<Path>) -> bool {
        match IndexPath::absolute(root.as_ref()) {
            Ok(root) => self.watches.unwatch(&root),
            Err(_) => false,
        }
    }

    pub fn unwatch_all(&self) {
        self.watches.unwatch_all();
    }

    pub fn watched_roots(&self) -> Vec<IndexPath> {
        self.watches.watched_roots()
    }

    /// Re-stat `path` and reconcile the index with the disk.
    pub async fn refresh_path(&self, path: impl AsRef<Path>) -> FsResult<bool> {
        self.watches.refresh_path(&IndexPath::new(path)).await
    }

    /// Declare a manifest outside of a crawl, optionally with content the
    /// caller already read.
    pub async fn declare_manifest(
        &self,
        request: DeclareManifest,
    ) -> FsResult<(Option<Arc<ManifestDefinition>>, Diagnostics)> {
        let diagnostics = Diagnostics::new();
        let definition = self.manifests.declare_manifest(request, &diagnostics).await?;
        Ok((definition, diagnostics))
    }
}

impl Drop for MemoryFs {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.abort();
        }
    }
}

impl std::fmt::Debug for MemoryFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryFs")
            .field("files", &self.index.file_count())
            .field("directories", &self.index.directory_count())
            .field("watches", &self.watches)
            .finish()
    }
}

/// Builder for [`MemoryFs`]. Every capability has an in-memory default.
#[derive(Default)]
pub struct MemoryFsBuilder {
    settings: Option<Settings>,
    registrar: Option<Arc<dyn ProjectRegistrar>>,
    handlers: Option<Arc<dyn FileHandlers>>,
    broadcaster: Option<Arc<dyn ManifestBroadcaster>>,
    normalizer: Option<Arc<dyn ManifestNormalizer>>,
    backend: Option<Arc<dyn WatchBackend>>,
}

impl MemoryFsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn registrar(mut self, registrar: Arc<dyn ProjectRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn handlers(mut self, handlers: Arc<dyn FileHandlers>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn ManifestBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<dyn ManifestNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Replace the native watcher. No event loop is started; changes
    /// reach the index only through `refresh_path`.
    pub fn backend(mut self, backend: Arc<dyn WatchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the facade. Must be called from within a tokio runtime when
    /// the native backend is used.
    pub fn build(self) -> FsResult<MemoryFs> {
        let settings = Arc::new(self.settings.unwrap_or_default());

        let events = EventBus::new(settings.watch.event_capacity);
        let index = Arc::new(PathIndex::new(events, settings.project.manifest_filename.clone()));
        let io_permits = Arc::new(Semaphore::new(settings.crawl.max_concurrent_io.max(1)));

        let registrar = self
            .registrar
            .unwrap_or_else(|| Arc::new(InMemoryProjects::new()));
        let handlers = self
            .handlers
            .unwrap_or_else(|| Arc::new(ExtensionHandlers::new(&settings.crawl.extensions)));
        let broadcaster = self
            .broadcaster
            .unwrap_or_else(|| Arc::new(WorkerBroadcast::default()));
        let normalizer = self.normalizer.unwrap_or_else(|| {
            Arc::new(PackageJsonNormalizer::new(
                settings.project.embedded_config_field.clone(),
            ))
        });

        let manifests = Arc::new(ManifestRegistry::new(
            index.clone(),
            ManifestLayout::from_config(&settings.project),
            normalizer,
            registrar.clone(),
            broadcaster,
            io_permits.clone(),
        ));
        let crawler = Arc::new(Crawler::new(
            index.clone(),
            manifests.clone(),
            registrar,
            handlers,
            CrawlPolicy::from_settings(&settings),
            io_permits,
        ));

        let (watches, event_loop) = match self.backend {
            Some(backend) => (Arc::new(WatchOrchestrator::new(crawler, backend)), None),
            None => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(WatchError::InitFailed {
                        reason: "the native watcher needs a tokio runtime".to_string(),
                    }
                    .into());
                }
                let (tx, rx) = mpsc::channel(settings.watch.event_capacity.max(1));
                let backend = create_backend(settings.watch.backend, tx)?;
                let watches = Arc::new(WatchOrchestrator::new(crawler, backend));
                let event_loop = watches.spawn_event_loop(rx);
                (watches, Some(event_loop))
            }
        };

        crate::debug_event!("memory_fs", "built", "backend {}", watches.backend_name());

        Ok(MemoryFs {
            settings,
            index,
            manifests,
            watches,
            event_loop,
        })
    }
}
