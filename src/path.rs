//! Normalized absolute path used as the key of every index table.
//!
//! Two spellings of the same location (`/a/./b`, `/a/c/../b`, `/a/b/`) must
//! hash to the same key, so every `IndexPath` is lexically normalized on
//! construction. Normalization never touches the disk: symlinks are not
//! resolved.

use std::fmt;
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexPath(PathBuf);

impl IndexPath {
    /// Normalize `path` lexically.
    ///
    /// `.` components are dropped and `..` pops the previous normal
    /// component. A `..` directly under the root stays at the root.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut normalized = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
                Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    let popped = matches!(normalized.components().next_back(), Some(Component::Normal(_)))
                        && normalized.pop();
                    if !popped && !path.as_ref().has_root() {
                        normalized.push("..");
                    }
                }
                Component::Normal(part) => normalized.push(part),
            }
        }
        if normalized.as_os_str().is_empty() {
            normalized.push(".");
        }
        Self(normalized)
    }

    /// Normalize `path`, anchoring relative paths at the current directory.
    pub fn absolute(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if path.is_absolute() {
            Ok(Self::new(path))
        } else {
            Ok(Self::new(std::path::absolute(path)?))
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    pub fn parent(&self) -> Option<IndexPath> {
        self.0.parent().map(|p| IndexPath(p.to_path_buf()))
    }

    /// Ancestors from the direct parent up to the filesystem root.
    pub fn ancestors(&self) -> impl Iterator<Item = IndexPath> + '_ {
        self.0.ancestors().skip(1).map(|p| IndexPath(p.to_path_buf()))
    }

    /// Strict descendant test: a path is not a descendant of itself.
    pub fn is_descendant_of(&self, other: &IndexPath) -> bool {
        self.0 != other.0 && self.0.starts_with(&other.0)
    }

    pub fn is_ancestor_or_self_of(&self, other: &IndexPath) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn basename(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    /// Normal components, root and prefix excluded.
    pub fn segments(&self) -> Vec<&str> {
        self.0
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect()
    }

    pub fn join(&self, child: impl AsRef<Path>) -> IndexPath {
        IndexPath::new(self.0.join(child))
    }

    /// Path of `self` relative to `base`, if `self` lies under it.
    pub fn relative_to(&self, base: &IndexPath) -> Option<&Path> {
        self.0.strip_prefix(&base.0).ok()
    }
}

impl Deref for IndexPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for IndexPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<&Path> for IndexPath {
    fn from(path: &Path) -> Self {
        IndexPath::new(path)
    }
}

impl From<PathBuf> for IndexPath {
    fn from(path: PathBuf) -> Self {
        IndexPath::new(path)
    }
}

impl From<&str> for IndexPath {
    fn from(path: &str) -> Self {
        IndexPath::new(path)
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}
