//! Raw change notifications, reduced to "something happened here".

use std::ffi::OsString;

use notify::{Event, EventKind};

use crate::path::IndexPath;

/// A change reported by a native watcher: the directory it was reported
/// in and the entry name inside it.
///
/// The event kind is deliberately dropped. Whatever happened, the
/// entry is re-stated and the index reconciled against the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub directory: IndexPath,
    pub filename: OsString,
}

impl ChangeEvent {
    pub fn new(directory: impl Into<IndexPath>, filename: impl Into<OsString>) -> Self {
        Self {
            directory: directory.into(),
            filename: filename.into(),
        }
    }

    /// Split an absolute path into directory and entry name.
    pub fn from_path(path: &IndexPath) -> Option<Self> {
        let directory = path.parent()?;
        let filename = path.file_name()?.to_os_string();
        Some(Self {
            directory,
            filename,
        })
    }

    /// The absolute path the event refers to.
    pub fn resolve(&self) -> IndexPath {
        self.directory.join(&self.filename)
    }

    /// Flatten a notify event into one change per affected path.
    ///
    /// Access notifications never change stats and are dropped.
    pub fn from_notify(event: &Event) -> Vec<Self> {
        if matches!(event.kind, EventKind::Access(_)) {
            return Vec::new();
        }
        let mut changes: Vec<Self> = event
            .paths
            .iter()
            .filter_map(|path| Self::from_path(&IndexPath::new(path)))
            .collect();
        changes.dedup();
        changes
    }
}
