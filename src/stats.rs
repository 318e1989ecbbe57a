//! File status snapshots and the blocking-I/O oracle behind them.
//!
//! Every disk access the index performs goes through this module: `stat`,
//! directory listings, and raw file reads. They are the only suspension
//! points of a crawl.

use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsKind {
    Unknown,
    Directory,
    File,
}

/// Immutable snapshot of a path's status.
///
/// Updates replace the cached value; a `Stats` is never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub mtime: i64,
    pub kind: StatsKind,
}

impl Stats {
    pub fn new(kind: StatsKind, size: u64, mtime: i64) -> Self {
        Self { size, mtime, kind }
    }

    pub fn is_file(&self) -> bool {
        self.kind == StatsKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == StatsKind::Directory
    }

    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let file_type = metadata.file_type();
        let kind = if file_type.is_dir() {
            StatsKind::Directory
        } else if file_type.is_file() {
            StatsKind::File
        } else {
            StatsKind::Unknown
        };

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Self {
            size: if kind == StatsKind::Directory {
                0
            } else {
                metadata.len()
            },
            mtime,
            kind,
        }
    }
}

/// Stat a path, following symlinks. Used for watch roots and hard lookups.
pub async fn stat(path: &Path) -> io::Result<Stats> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(Stats::from_metadata(&metadata))
}

/// Stat a crawl entry without following symlinks.
///
/// Links report `StatsKind::Unknown` and are skipped by the crawler, which
/// keeps cyclic links from recursing forever.
pub async fn stat_entry(path: &Path) -> io::Result<Stats> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    Ok(Stats::from_metadata(&metadata))
}

/// List the direct children of a directory.
pub async fn read_dir(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        children.push(entry.path());
    }
    Ok(children)
}

pub async fn read_file(path: &Path) -> io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}
