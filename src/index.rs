//! The path index: every fact the server knows about the project tree.
//!
//! All operations here are synchronous and perform no I/O. Tables sit behind
//! a single `RwLock` that is never held across an await point, so a mutation
//! always runs to completion before the next one starts.
//!
//! Invariants after every public call:
//! - every known file and directory (except a crawl root's parent) is listed
//!   in its parent's listing
//! - evicting a directory leaves no descendant in any table
//! - at most one manifest per directory

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, FileEvent};
use crate::manifest::ManifestDefinition;
use crate::path::IndexPath;
use crate::stats::Stats;

/// Answer of a soft existence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Exists,
    Missing,
    /// Not provable either way: the parent was never crawled, or an
    /// ancestor root is still mid-crawl.
    Unknown,
}

/// Outcome of a generation-checked insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The crawl generation was cancelled; nothing was written.
    Stale,
    Inserted,
    Replaced(Stats),
}

impl Existence {
    pub fn is_known(self) -> bool {
        self != Existence::Unknown
    }
}

#[derive(Debug, Default)]
struct Tables {
    directories: HashMap<IndexPath, Stats>,
    files: HashMap<IndexPath, Stats>,
    listings: HashMap<IndexPath, BTreeSet<IndexPath>>,
    manifests: HashMap<IndexPath, Arc<ManifestDefinition>>,
}

impl Tables {
    fn stats(&self, path: &IndexPath) -> Option<&Stats> {
        self.files
            .get(path)
            .or_else(|| self.directories.get(path))
    }

    fn list_child(&mut self, path: &IndexPath) {
        if let Some(parent) = path.parent() {
            self.listings.entry(parent).or_default().insert(path.clone());
        }
    }

    fn unlist_child(&mut self, path: &IndexPath) {
        let Some(parent) = path.parent() else {
            return;
        };
        let parent_known = self.directories.contains_key(&parent);
        if let Some(listing) = self.listings.get_mut(&parent) {
            listing.remove(path);
            // Synthetic listing above a crawl root goes away once empty
            if listing.is_empty() && !parent_known {
                self.listings.remove(&parent);
            }
        }
    }

    fn collect_files(&self, dir: &IndexPath, out: &mut Vec<IndexPath>) {
        let Some(listing) = self.listings.get(dir) else {
            return;
        };
        for child in listing {
            if self.files.contains_key(child) {
                out.push(child.clone());
            } else if self.directories.contains_key(child) {
                self.collect_files(child, out);
            }
        }
    }
}

/// In-memory tables of directories, file stats, listings and manifests.
#[derive(Debug)]
pub struct PathIndex {
    tables: RwLock<Tables>,
    events: EventBus,
    manifest_filename: String,
}

impl PathIndex {
    pub fn new(events: EventBus, manifest_filename: impl Into<String>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            events,
            manifest_filename: manifest_filename.into(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_file(&self, path: &IndexPath) -> bool {
        self.tables.read().files.contains_key(path)
    }

    pub fn is_directory(&self, path: &IndexPath) -> bool {
        self.tables.read().directories.contains_key(path)
    }

    pub fn stats(&self, path: &IndexPath) -> Option<Stats> {
        self.tables.read().stats(path).copied()
    }

    /// Soft existence check.
    ///
    /// `in_flight` reports whether a root covering `path` is still in its
    /// initial crawl. `Unknown` is a heuristic and proves nothing; callers
    /// that need a definite answer must use the hard variant, which falls
    /// back to a stat.
    pub fn exists(&self, path: &IndexPath, in_flight: impl Fn(&IndexPath) -> bool) -> Existence {
        let tables = self.tables.read();
        if tables.files.contains_key(path) || tables.directories.contains_key(path) {
            return Existence::Exists;
        }
        drop(tables);

        if in_flight(path) {
            return Existence::Unknown;
        }

        match path.parent() {
            Some(parent) if self.is_directory(&parent) => Existence::Missing,
            _ => Existence::Unknown,
        }
    }

    /// The single idempotence gate: unknown paths and mtime changes count.
    pub fn has_stats_changed(&self, path: &IndexPath, new_stats: &Stats) -> bool {
        match self.tables.read().stats(path) {
            Some(old) => old.mtime != new_stats.mtime,
            None => true,
        }
    }

    /// Register a directory and list it under its parent.
    ///
    /// The generation is checked under the write lock, so a write can never
    /// land after an eviction that followed the cancellation.
    pub fn insert_directory(
        &self,
        path: &IndexPath,
        stats: Stats,
        generation: &CancellationToken,
    ) -> Insertion {
        let mut tables = self.tables.write();
        if generation.is_cancelled() {
            return Insertion::Stale;
        }
        let previous = tables.directories.insert(path.clone(), stats);
        tables.listings.entry(path.clone()).or_default();
        tables.list_child(path);
        previous.map_or(Insertion::Inserted, Insertion::Replaced)
    }

    /// Register a file and list it under its parent.
    pub fn insert_file(
        &self,
        path: &IndexPath,
        stats: Stats,
        generation: &CancellationToken,
    ) -> Insertion {
        let mut tables = self.tables.write();
        if generation.is_cancelled() {
            return Insertion::Stale;
        }
        let previous = tables.files.insert(path.clone(), stats);
        tables.list_child(path);
        previous.map_or(Insertion::Inserted, Insertion::Replaced)
    }

    /// Direct children, sorted. Empty for unknown directories.
    pub fn readdir(&self, dir: &IndexPath) -> Vec<IndexPath> {
        self.tables
            .read()
            .listings
            .get(dir)
            .map(|listing| listing.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every file below `dir`, at any depth, sorted.
    pub fn get_all_files_in_directory(&self, dir: &IndexPath) -> Vec<IndexPath> {
        let mut files = Vec::new();
        self.tables.read().collect_files(dir, &mut files);
        files.sort();
        files
    }

    pub fn count_files(&self, dir: &IndexPath) -> usize {
        let mut files = Vec::new();
        self.tables.read().collect_files(dir, &mut files);
        files.len()
    }

    pub fn file_count(&self) -> usize {
        self.tables.read().files.len()
    }

    pub fn directory_count(&self) -> usize {
        self.tables.read().directories.len()
    }

    /// All known files, sorted.
    pub fn files(&self) -> Vec<IndexPath> {
        let mut files: Vec<_> = self.tables.read().files.keys().cloned().collect();
        files.sort();
        files
    }

    /// Forget `path` and everything below it, emitting `DeletedFile` for
    /// each file removed.
    pub fn handle_deletion(&self, path: &IndexPath) {
        let deleted = self.evict(path);
        for file in deleted {
            self.events.send(FileEvent::DeletedFile { path: file });
        }
    }

    /// Same removal as [`handle_deletion`](Self::handle_deletion) without
    /// notifications. Returns the files that were removed.
    pub fn evict(&self, path: &IndexPath) -> Vec<IndexPath> {
        let mut deleted = Vec::new();
        let mut tables = self.tables.write();
        self.remove_recursive(&mut tables, path, &mut deleted);
        tables.unlist_child(path);
        drop(tables);

        if !deleted.is_empty() {
            crate::debug_event!("index", "evicted", "{path} ({} files)", deleted.len());
        }
        deleted
    }

    fn remove_recursive(&self, tables: &mut Tables, path: &IndexPath, deleted: &mut Vec<IndexPath>) {
        if tables.directories.remove(path).is_some() {
            // Children first, depth-first
            if let Some(listing) = tables.listings.remove(path) {
                for child in &listing {
                    self.remove_recursive(tables, child, deleted);
                }
            }
            tables.manifests.remove(path);
        } else if tables.files.remove(path).is_some() {
            if path.basename() == Some(self.manifest_filename.as_str()) {
                if let Some(parent) = path.parent() {
                    tables.manifests.remove(&parent);
                }
            }
            deleted.push(path.clone());
        }
    }

    // Manifest table

    /// Install a manifest, replacing whatever its directory held before.
    ///
    /// Returns `false` if the generation was cancelled.
    pub fn set_manifest(
        &self,
        definition: Arc<ManifestDefinition>,
        generation: &CancellationToken,
    ) -> bool {
        let mut tables = self.tables.write();
        if generation.is_cancelled() {
            return false;
        }
        tables
            .manifests
            .insert(definition.directory.clone(), definition);
        true
    }

    pub fn get_manifest(&self, dir: &IndexPath) -> Option<Arc<ManifestDefinition>> {
        self.tables.read().manifests.get(dir).cloned()
    }

    /// Nearest manifest at or above `path`.
    pub fn get_owned_manifest(&self, path: &IndexPath) -> Option<Arc<ManifestDefinition>> {
        let tables = self.tables.read();
        std::iter::once(path.clone())
            .chain(path.ancestors())
            .find_map(|dir| tables.manifests.get(&dir).cloned())
    }

    pub fn manifests(&self) -> Vec<Arc<ManifestDefinition>> {
        let mut manifests: Vec<_> = self.tables.read().manifests.values().cloned().collect();
        manifests.sort_by(|a, b| a.directory.cmp(&b.directory));
        manifests
    }
}
