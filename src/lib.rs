//! In-memory index of project directory trees.
//!
//! Crawls project roots into a path index, tracks package manifests and
//! keeps everything current through native file watching.

pub mod cli;
pub mod config;
pub mod crawler;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod globs;
pub mod index;
pub mod logging;
pub mod manifest;
pub mod memory_fs;
pub mod path;
pub mod project;
pub mod stats;
pub mod watcher;

pub use config::Settings;
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{FsError, FsResult};
pub use events::{EventBus, FileEvent};
pub use globs::GlobOptions;
pub use index::{Existence, PathIndex};
pub use manifest::{DeclareManifest, Manifest, ManifestDefinition, ManifestId, PartialManifest};
pub use memory_fs::{MemoryFs, MemoryFsBuilder};
pub use path::IndexPath;
pub use project::{
    ExtensionHandlers, FileHandlers, InMemoryProjects, ManifestBroadcaster, ProjectId,
    ProjectRegistrar, WorkerBroadcast,
};
pub use stats::{Stats, StatsKind};
pub use watcher::{ChangeEvent, WatchBackend, WatchError};
