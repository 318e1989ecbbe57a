//! Diagnostics threaded through crawl and refresh operations.
//!
//! Diagnostics are never the primary error channel. Each top-level request
//! owns one sink; every nested operation appends to it.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Short machine-readable origin, e.g. `manifest/parse`.
    pub category: &'static str,
    pub path: PathBuf,
    pub message: String,
}

impl Diagnostic {
    pub fn error(category: &'static str, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn warning(
        category: &'static str,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{level}[{}] {}: {}",
            self.category,
            self.path.display(),
            self.message
        )
    }
}

/// Shared append-only diagnostics sink.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Arc<Mutex<Vec<Diagnostic>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, diagnostic: Diagnostic) {
        self.inner.lock().push(diagnostic);
    }

    pub fn extend(&self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.inner.lock().extend(diagnostics);
    }

    pub fn has_errors(&self) -> bool {
        self.inner.lock().iter().any(Diagnostic::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.inner.lock().clone()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_one_sink() {
        let sink = Diagnostics::new();
        let clone = sink.clone();

        clone.push(Diagnostic::warning("test", "/a", "first"));
        assert!(!sink.has_errors());

        clone.push(Diagnostic::error("test", "/a", "second"));
        assert!(sink.has_errors());
        assert_eq!(sink.len(), 2);

        let taken = sink.take();
        assert_eq!(taken.len(), 2);
        assert!(clone.is_empty());
    }

    #[test]
    fn test_display_format() {
        let diagnostic = Diagnostic::error("manifest/parse", "/p/package.json", "bad json");
        assert_eq!(
            diagnostic.to_string(),
            "error[manifest/parse] /p/package.json: bad json"
        );
    }
}
