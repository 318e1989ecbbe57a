//! Contracts with the rest of the toolchain server.
//!
//! The index never reaches into its host. It receives narrow capabilities
//! at construction:
//! - [`ProjectRegistrar`]: project discovery and bookkeeping
//! - [`FileHandlers`]: which files are worth indexing at all
//! - [`ManifestBroadcaster`]: keeps worker caches in sync
//!
//! Each has a small in-memory implementation used by the binary and tests.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::diagnostics::Diagnostics;
use crate::manifest::{ManifestDefinition, PartialManifest};
use crate::path::IndexPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(NonZeroU32);

impl ProjectId {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn value(&self) -> u32 {
        self.0.get()
    }
}

/// Project manager as seen from the index.
#[async_trait]
pub trait ProjectRegistrar: Send + Sync {
    /// Register `root` as a project root. May load config and report
    /// problems to `diagnostics`.
    async fn declare_project(&self, root: &IndexPath, diagnostics: &Diagnostics);

    /// Project owning `path`, if one loaded successfully.
    fn find_project(&self, path: &IndexPath) -> Option<ProjectId>;

    fn is_project_root(&self, dir: &IndexPath) -> bool;

    /// Called once the crawl of a project root has settled.
    fn mark_initialized(&self, root: &IndexPath);

    fn associate_manifest(&self, project: ProjectId, manifest: &ManifestDefinition);
}

/// Extension recognizers of the parser/linter/bundler handlers.
pub trait FileHandlers: Send + Sync {
    fn handles(&self, path: &IndexPath, project: Option<ProjectId>) -> bool;
}

/// Delivery of manifest updates to worker processes.
#[async_trait]
pub trait ManifestBroadcaster: Send + Sync {
    async fn broadcast(&self, manifest: &PartialManifest);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub root: IndexPath,
    pub initialized: bool,
    pub manifests: Vec<u64>,
}

/// Registrar that keeps projects in a concurrent map keyed by root.
#[derive(Debug)]
pub struct InMemoryProjects {
    projects: DashMap<IndexPath, ProjectRecord>,
    next_id: AtomicU32,
}

impl Default for InMemoryProjects {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProjects {
    pub fn new() -> Self {
        Self {
            projects: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn get(&self, root: &IndexPath) -> Option<ProjectRecord> {
        self.projects.get(root).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn roots(&self) -> Vec<IndexPath> {
        let mut roots: Vec<_> = self.projects.iter().map(|e| e.key().clone()).collect();
        roots.sort();
        roots
    }
}

#[async_trait]
impl ProjectRegistrar for InMemoryProjects {
    async fn declare_project(&self, root: &IndexPath, _diagnostics: &Diagnostics) {
        if self.projects.contains_key(root) {
            return;
        }
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        let Some(id) = ProjectId::new(raw) else {
            return;
        };
        self.projects.entry(root.clone()).or_insert(ProjectRecord {
            id,
            root: root.clone(),
            initialized: false,
            manifests: Vec::new(),
        });
        crate::log_event!("projects", "declared", "{root}");
    }

    fn find_project(&self, path: &IndexPath) -> Option<ProjectId> {
        std::iter::once(path.clone())
            .chain(path.ancestors())
            .find_map(|dir| self.projects.get(&dir).map(|record| record.id))
    }

    fn is_project_root(&self, dir: &IndexPath) -> bool {
        self.projects.contains_key(dir)
    }

    fn mark_initialized(&self, root: &IndexPath) {
        if let Some(mut record) = self.projects.get_mut(root) {
            record.initialized = true;
        }
    }

    fn associate_manifest(&self, project: ProjectId, manifest: &ManifestDefinition) {
        if let Some(mut record) = self.projects.iter_mut().find(|e| e.id == project) {
            record.manifests.push(manifest.id.0);
        }
    }
}

/// Recognizes files by extension, regardless of project.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandlers {
    extensions: HashSet<String>,
}

impl ExtensionHandlers {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl FileHandlers for ExtensionHandlers {
    fn handles(&self, path: &IndexPath, _project: Option<ProjectId>) -> bool {
        Path::extension(path)
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }
}

/// Broadcasts manifest projections to any number of worker receivers.
#[derive(Debug, Clone)]
pub struct WorkerBroadcast {
    sender: broadcast::Sender<PartialManifest>,
}

impl WorkerBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PartialManifest> {
        self.sender.subscribe()
    }
}

impl Default for WorkerBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ManifestBroadcaster for WorkerBroadcast {
    async fn broadcast(&self, manifest: &PartialManifest) {
        match self.sender.send(manifest.clone()) {
            Ok(count) => {
                crate::debug_event!("manifest", "broadcast", "id {} to {count} workers", manifest.id);
            }
            Err(_) => {
                crate::debug_event!("manifest", "broadcast", "no workers for id {}", manifest.id);
            }
        }
    }
}
