//! Crate-level error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::diagnostics::Diagnostic;
use crate::watcher::WatchError;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found in index: {path}")]
    NotFound { path: PathBuf },

    #[error("Not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Crawl of {root} produced {} diagnostic(s)", diagnostics.len())]
    Diagnostics {
        root: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("Watch of {root} failed while another request was waiting on it")]
    WatchFailed { root: PathBuf },

    #[error("{source} ({} diagnostic(s) collected before the failure)", diagnostics.len())]
    Aborted {
        #[source]
        source: Box<FsError>,
        diagnostics: Vec<Diagnostic>,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] ::glob::PatternError),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl FsError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach diagnostics gathered before this error. Returns `self`
    /// unchanged when there are none.
    pub fn with_diagnostics(self, diagnostics: Vec<Diagnostic>) -> Self {
        if diagnostics.is_empty() {
            return self;
        }
        FsError::Aborted {
            source: Box::new(self),
            diagnostics,
        }
    }

    /// Every diagnostic this error carries.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            FsError::Diagnostics { diagnostics, .. } | FsError::Aborted { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }

    /// True when the underlying cause is a path that vanished.
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound { .. } => true,
            FsError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            FsError::Aborted { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_diagnostics_wraps_only_when_needed() {
        let bare = FsError::NotFound {
            path: PathBuf::from("/a"),
        }
        .with_diagnostics(Vec::new());
        assert!(matches!(bare, FsError::NotFound { .. }));

        let wrapped = FsError::io("/a", std::io::Error::from(std::io::ErrorKind::NotFound))
            .with_diagnostics(vec![Diagnostic::warning("watch/subscribe", "/a/b", "denied")]);

        assert!(wrapped.is_not_found());
        assert_eq!(wrapped.diagnostics().len(), 1);
    }
}
