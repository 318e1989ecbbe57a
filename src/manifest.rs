//! Manifest discovery, parsing and registration.
//!
//! A manifest (`package.json` by default) marks a package boundary. The
//! registry decides whether a manifest-named file is one we care about,
//! parses and normalizes it, installs it in the path index keyed by its
//! directory, registers embedded project configs, and tells workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ProjectConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{FsError, FsResult};
use crate::index::PathIndex;
use crate::path::IndexPath;
use crate::project::{ManifestBroadcaster, ProjectRegistrar};
use crate::stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestId(pub u64);

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Module,
    CommonJs,
}

/// Normalized manifest contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub module_type: Option<ModuleType>,
    /// `dependencies` merged with `devDependencies`.
    pub dependencies: BTreeMap<String, String>,
    /// Value of the embedded project-config field, if declared.
    pub project_config: Option<Value>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDefinition {
    pub id: ManifestId,
    pub path: IndexPath,
    pub directory: IndexPath,
    pub manifest: Manifest,
    /// Hex SHA-256 of the raw manifest bytes.
    pub hash: String,
}

impl ManifestDefinition {
    pub fn partial(&self) -> PartialManifest {
        PartialManifest {
            id: self.id.0,
            path: self.path.to_path_buf(),
            directory: self.directory.to_path_buf(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            hash: self.hash.clone(),
        }
    }
}

/// Projection of a manifest sent to worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialManifest {
    pub id: u64,
    pub path: PathBuf,
    pub directory: PathBuf,
    pub name: Option<String>,
    pub version: Option<String>,
    pub hash: String,
}

/// Result of running a normalizer: a manifest unless errors occurred,
/// plus whatever it had to say.
#[derive(Debug, Default)]
pub struct Normalized {
    pub manifest: Option<Manifest>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Schema normalizer for parsed manifest JSON.
pub trait ManifestNormalizer: Send + Sync {
    /// `is_dependency` marks third-party manifests, which are normalized
    /// leniently.
    fn normalize(&self, path: &IndexPath, value: Value, is_dependency: bool) -> Normalized;
}

/// Normalizer for npm-style `package.json` files.
#[derive(Debug, Clone)]
pub struct PackageJsonNormalizer {
    embedded_config_field: String,
}

impl PackageJsonNormalizer {
    pub fn new(embedded_config_field: impl Into<String>) -> Self {
        Self {
            embedded_config_field: embedded_config_field.into(),
        }
    }

    fn string_field(
        object: &serde_json::Map<String, Value>,
        key: &str,
        path: &IndexPath,
        strict: bool,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<String> {
        match object.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => {
                if strict {
                    diagnostics.push(Diagnostic::error(
                        "manifest/normalize",
                        path.as_path(),
                        format!("`{key}` must be a non-empty string"),
                    ));
                }
                None
            }
        }
    }
}

impl ManifestNormalizer for PackageJsonNormalizer {
    fn normalize(&self, path: &IndexPath, value: Value, is_dependency: bool) -> Normalized {
        let mut diagnostics = Vec::new();
        let strict = !is_dependency;

        let Value::Object(object) = &value else {
            diagnostics.push(Diagnostic::error(
                "manifest/normalize",
                path.as_path(),
                "expected a JSON object",
            ));
            return Normalized {
                manifest: None,
                diagnostics,
            };
        };

        let name = Self::string_field(object, "name", path, strict, &mut diagnostics);
        let version = Self::string_field(object, "version", path, strict, &mut diagnostics);

        let module_type = match object.get("type") {
            None => None,
            Some(Value::String(s)) if s == "module" => Some(ModuleType::Module),
            Some(Value::String(s)) if s == "commonjs" => Some(ModuleType::CommonJs),
            Some(other) => {
                if strict {
                    diagnostics.push(Diagnostic::error(
                        "manifest/normalize",
                        path.as_path(),
                        format!("`type` must be \"module\" or \"commonjs\", found {other}"),
                    ));
                }
                None
            }
        };

        let mut dependencies = BTreeMap::new();
        for key in ["dependencies", "devDependencies"] {
            match object.get(key) {
                None => {}
                Some(Value::Object(deps)) => {
                    for (dep, range) in deps {
                        match range.as_str() {
                            Some(range) => {
                                dependencies.insert(dep.clone(), range.to_string());
                            }
                            None if strict => diagnostics.push(Diagnostic::warning(
                                "manifest/normalize",
                                path.as_path(),
                                format!("ignoring non-string range for `{dep}` in `{key}`"),
                            )),
                            None => {}
                        }
                    }
                }
                Some(_) if strict => diagnostics.push(Diagnostic::error(
                    "manifest/normalize",
                    path.as_path(),
                    format!("`{key}` must be an object"),
                )),
                Some(_) => {}
            }
        }

        let project_config = match object.get(&self.embedded_config_field) {
            None => None,
            Some(config @ Value::Object(_)) => Some(config.clone()),
            Some(_) => {
                if strict {
                    diagnostics.push(Diagnostic::error(
                        "manifest/normalize",
                        path.as_path(),
                        format!("`{}` must be an object", self.embedded_config_field),
                    ));
                }
                None
            }
        };

        let failed = diagnostics.iter().any(Diagnostic::is_error);
        let manifest = (!failed).then(|| Manifest {
            name,
            version,
            module_type,
            dependencies,
            project_config,
            raw: value.clone(),
        });

        Normalized {
            manifest,
            diagnostics,
        }
    }
}

/// Naming rules that decide which files are manifests of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLayout {
    pub manifest_filename: String,
    pub dependency_dir: String,
}

impl ManifestLayout {
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            manifest_filename: config.manifest_filename.clone(),
            dependency_dir: config.dependency_dir.clone(),
        }
    }

    pub fn is_manifest_name(&self, path: &IndexPath) -> bool {
        path.basename() == Some(self.manifest_filename.as_str())
    }

    pub fn is_dependency(&self, path: &IndexPath) -> bool {
        path.segments().contains(&self.dependency_dir.as_str())
    }

    /// Structural manifest test.
    ///
    /// Inside a dependency directory only `<deps>/<name>/<manifest>` and
    /// `<deps>/@scope/<name>/<manifest>` qualify; nested fixtures and
    /// package internals do not.
    pub fn is_manifest_of_interest(&self, path: &IndexPath) -> bool {
        if !self.is_manifest_name(path) {
            return false;
        }

        let segments = path.segments();
        if !segments.contains(&self.dependency_dir.as_str()) {
            return true;
        }

        let len = segments.len();
        let deps = self.dependency_dir.as_str();
        let unscoped = len >= 3 && segments[len - 3] == deps && !segments[len - 2].starts_with('@');
        let scoped = len >= 4 && segments[len - 4] == deps && segments[len - 3].starts_with('@');
        unscoped || scoped
    }
}

/// A request to (re)declare the manifest at `path`.
#[derive(Debug, Clone)]
pub struct DeclareManifest {
    pub path: IndexPath,
    pub directory: IndexPath,
    /// Supplied bytes for virtual files; read from disk when `None`.
    pub content: Option<Vec<u8>>,
    /// Crawl generation; nothing is installed once cancelled.
    pub generation: CancellationToken,
}

impl DeclareManifest {
    pub fn new(path: IndexPath) -> Self {
        let directory = path.parent().unwrap_or_else(|| path.clone());
        Self {
            path,
            directory,
            content: None,
            generation: CancellationToken::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_generation(mut self, generation: CancellationToken) -> Self {
        self.generation = generation;
        self
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub struct ManifestRegistry {
    index: Arc<PathIndex>,
    layout: ManifestLayout,
    normalizer: Arc<dyn ManifestNormalizer>,
    registrar: Arc<dyn ProjectRegistrar>,
    broadcaster: Arc<dyn ManifestBroadcaster>,
    io_permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl ManifestRegistry {
    pub fn new(
        index: Arc<PathIndex>,
        layout: ManifestLayout,
        normalizer: Arc<dyn ManifestNormalizer>,
        registrar: Arc<dyn ProjectRegistrar>,
        broadcaster: Arc<dyn ManifestBroadcaster>,
        io_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            index,
            layout,
            normalizer,
            registrar,
            broadcaster,
            io_permits,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn layout(&self) -> &ManifestLayout {
        &self.layout
    }

    /// Parse, install and propagate one manifest.
    ///
    /// Invalid manifests are reported to `diagnostics` and yield `Ok(None)`
    /// without touching the previous entry. Only I/O failures other than
    /// the file vanishing are returned as errors.
    pub async fn declare_manifest(
        &self,
        request: DeclareManifest,
        diagnostics: &Diagnostics,
    ) -> FsResult<Option<Arc<ManifestDefinition>>> {
        let DeclareManifest {
            path,
            directory,
            content,
            generation,
        } = request;

        if !self.layout.is_manifest_of_interest(&path) {
            crate::debug_event!("manifest", "skipped", "{path}");
            return Ok(None);
        }

        let bytes = match content {
            Some(bytes) => bytes,
            None => {
                let _permit = self.io_permits.acquire().await.ok();
                match stats::read_file(&path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        crate::debug_event!("manifest", "vanished", "{path}");
                        return Ok(None);
                    }
                    Err(e) => return Err(FsError::io(path.to_path_buf(), e)),
                }
            }
        };

        let hash = content_hash(&bytes);

        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                diagnostics.push(Diagnostic::error(
                    "manifest/parse",
                    path.as_path(),
                    e.to_string(),
                ));
                return Ok(None);
            }
        };

        let is_dependency = self.layout.is_dependency(&path);
        let Normalized {
            manifest,
            diagnostics: found,
        } = self.normalizer.normalize(&path, value, is_dependency);
        diagnostics.extend(found);
        let Some(manifest) = manifest else {
            tracing::warn!("[manifest] invalid manifest {path}");
            return Ok(None);
        };

        let id = ManifestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let definition = Arc::new(ManifestDefinition {
            id,
            path: path.clone(),
            directory: directory.clone(),
            manifest,
            hash,
        });
        if !self.index.set_manifest(definition.clone(), &generation) {
            return Ok(None);
        }
        crate::debug_event!("manifest", "declared", "{path} as {id}");

        if !is_dependency && definition.manifest.project_config.is_some() {
            self.registrar.declare_project(&directory, diagnostics).await;
        }

        match self.registrar.find_project(&path) {
            Some(project) => self.registrar.associate_manifest(project, &definition),
            None => {
                // The surrounding project failed to load; the manifest still stands
                crate::debug_event!("manifest", "unowned", "{path}");
            }
        }

        self.broadcaster.broadcast(&definition.partial()).await;

        Ok(Some(definition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::project::{InMemoryProjects, WorkerBroadcast};

    fn layout() -> ManifestLayout {
        ManifestLayout::from_config(&ProjectConfig::default())
    }

    fn registry() -> (ManifestRegistry, Arc<PathIndex>, Arc<InMemoryProjects>, WorkerBroadcast) {
        let index = Arc::new(PathIndex::new(EventBus::new(8), "package.json"));
        let projects = Arc::new(InMemoryProjects::new());
        let workers = WorkerBroadcast::new(8);
        let registry = ManifestRegistry::new(
            index.clone(),
            layout(),
            Arc::new(PackageJsonNormalizer::new("projfs")),
            projects.clone(),
            Arc::new(workers.clone()),
            Arc::new(Semaphore::new(4)),
        );
        (registry, index, projects, workers)
    }

    #[test]
    fn test_manifest_of_interest_rules() {
        let layout = layout();
        let yes = |p: &str| layout.is_manifest_of_interest(&IndexPath::new(p));

        assert!(yes("/proj/package.json"));
        assert!(yes("/proj/node_modules/react/package.json"));
        assert!(yes("/proj/node_modules/@babel/core/package.json"));
        assert!(yes("/proj/node_modules/a/node_modules/b/package.json"));

        assert!(!yes("/proj/package.jsonc"));
        assert!(!yes("/proj/node_modules/package.json"));
        assert!(!yes("/proj/node_modules/react/test/package.json"));
        assert!(!yes("/proj/node_modules/@babel/package.json"));
        assert!(!yes("/proj/node_modules/@babel/core/fixtures/package.json"));
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_normalizer_strict_vs_lenient() {
        let normalizer = PackageJsonNormalizer::new("projfs");
        let path = IndexPath::new("/p/package.json");
        let value = serde_json::json!({ "name": 42, "type": "esm" });

        let strict = normalizer.normalize(&path, value.clone(), false);
        assert!(strict.manifest.is_none());
        assert_eq!(strict.diagnostics.len(), 2);

        let lenient = normalizer.normalize(&path, value, true);
        let manifest = lenient.manifest.unwrap();
        assert!(lenient.diagnostics.is_empty());
        assert_eq!(manifest.name, None);
        assert_eq!(manifest.module_type, None);
    }

    #[test]
    fn test_normalizer_merges_dependencies() {
        let normalizer = PackageJsonNormalizer::new("projfs");
        let value = serde_json::json!({
            "name": "pkg",
            "type": "module",
            "dependencies": { "a": "^1.0.0" },
            "devDependencies": { "b": "2.0.0" },
            "projfs": { "lint": true }
        });

        let normalized = normalizer.normalize(&IndexPath::new("/p/package.json"), value, false);
        let manifest = normalized.manifest.unwrap();

        assert_eq!(manifest.module_type, Some(ModuleType::Module));
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.project_config.is_some());
    }

    #[tokio::test]
    async fn test_redeclare_replaces_entry_with_new_id_and_hash() {
        let (registry, index, _, _) = registry();
        let path = IndexPath::new("/proj/package.json");
        let sink = Diagnostics::new();

        let first = registry
            .declare_manifest(
                DeclareManifest::new(path.clone()).with_content(r#"{"name":"a"}"#),
                &sink,
            )
            .await
            .unwrap()
            .unwrap();
        let second = registry
            .declare_manifest(
                DeclareManifest::new(path.clone()).with_content(r#"{"name":"b"}"#),
                &sink,
            )
            .await
            .unwrap()
            .unwrap();

        assert!(second.id > first.id);
        assert_ne!(first.hash, second.hash);
        assert_eq!(index.manifests().len(), 1);
        let stored = index.get_manifest(&IndexPath::new("/proj")).unwrap();
        assert_eq!(stored.manifest.name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_invalid_manifest_records_diagnostic_and_keeps_previous() {
        let (registry, index, _, _) = registry();
        let path = IndexPath::new("/proj/package.json");
        let sink = Diagnostics::new();

        registry
            .declare_manifest(
                DeclareManifest::new(path.clone()).with_content(r#"{"name":"ok"}"#),
                &sink,
            )
            .await
            .unwrap();
        let result = registry
            .declare_manifest(DeclareManifest::new(path).with_content("{ not json"), &sink)
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(sink.has_errors());
        assert_eq!(sink.snapshot()[0].category, "manifest/parse");
        let stored = index.get_manifest(&IndexPath::new("/proj")).unwrap();
        assert_eq!(stored.manifest.name.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_embedded_config_registers_project_and_broadcasts() {
        let (registry, _, projects, workers) = registry();
        let mut worker = workers.subscribe();
        let sink = Diagnostics::new();

        let definition = registry
            .declare_manifest(
                DeclareManifest::new(IndexPath::new("/proj/package.json"))
                    .with_content(r#"{"name":"pkg","projfs":{}}"#),
                &sink,
            )
            .await
            .unwrap()
            .unwrap();

        let record = projects.get(&IndexPath::new("/proj")).unwrap();
        assert_eq!(record.manifests, vec![definition.id.0]);

        let partial = worker.try_recv().unwrap();
        assert_eq!(partial.id, definition.id.0);
        assert_eq!(partial.name.as_deref(), Some("pkg"));
    }

    #[tokio::test]
    async fn test_dependency_manifest_never_registers_project() {
        let (registry, index, projects, _) = registry();
        let sink = Diagnostics::new();

        registry
            .declare_manifest(
                DeclareManifest::new(IndexPath::new("/proj/node_modules/dep/package.json"))
                    .with_content(r#"{"name":"dep","projfs":{}}"#),
                &sink,
            )
            .await
            .unwrap();

        assert!(projects.is_empty());
        // Unowned manifests still install
        assert!(index.get_manifest(&IndexPath::new("/proj/node_modules/dep")).is_some());
    }

    #[tokio::test]
    async fn test_cancelled_generation_installs_nothing() {
        let (registry, index, _, _) = registry();
        let generation = CancellationToken::new();
        generation.cancel();

        let result = registry
            .declare_manifest(
                DeclareManifest::new(IndexPath::new("/proj/package.json"))
                    .with_content("{}")
                    .with_generation(generation),
                &Diagnostics::new(),
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(index.manifests().is_empty());
    }
}
