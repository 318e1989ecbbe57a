//! Project discovery runs before ordinary siblings are looked at.

use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use projfs::manifest::ManifestDefinition;
use projfs::{
    Diagnostics, FileHandlers, InMemoryProjects, IndexPath, MemoryFs, ProjectId, ProjectRegistrar,
};
use tempfile::TempDir;

type Log = Arc<Mutex<Vec<String>>>;

struct RecordingProjects {
    inner: InMemoryProjects,
    log: Log,
}

#[async_trait]
impl ProjectRegistrar for RecordingProjects {
    async fn declare_project(&self, root: &IndexPath, diagnostics: &Diagnostics) {
        self.log.lock().unwrap().push(format!("declare {root}"));
        self.inner.declare_project(root, diagnostics).await;
    }

    fn find_project(&self, path: &IndexPath) -> Option<ProjectId> {
        self.inner.find_project(path)
    }

    fn is_project_root(&self, dir: &IndexPath) -> bool {
        self.inner.is_project_root(dir)
    }

    fn mark_initialized(&self, root: &IndexPath) {
        self.log.lock().unwrap().push(format!("initialized {root}"));
        self.inner.mark_initialized(root);
    }

    fn associate_manifest(&self, project: ProjectId, manifest: &ManifestDefinition) {
        self.log
            .lock()
            .unwrap()
            .push(format!("associate {}", manifest.directory));
        self.inner.associate_manifest(project, manifest);
    }
}

struct RecordingHandlers {
    log: Log,
}

impl FileHandlers for RecordingHandlers {
    fn handles(&self, path: &IndexPath, project: Option<ProjectId>) -> bool {
        let owner = if project.is_some() { "owned" } else { "orphan" };
        self.log
            .lock()
            .unwrap()
            .push(format!("handles {} {owner}", path.basename().unwrap_or_default()));
        path.extension().is_some_and(|ext| ext == "js")
    }
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|line| line == entry)
        .unwrap_or_else(|| panic!("missing {entry:?} in {log:#?}"))
}

#[tokio::test]
async fn test_priority_children_settle_before_siblings() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(
        root.join("package.json"),
        r#"{"name":"app","version":"1.0.0","projfs":{"strict":true}}"#,
    )
    .unwrap();
    fs::write(root.join("a.js"), "").unwrap();
    fs::write(root.join("src/b.js"), "").unwrap();

    let log: Log = Arc::default();
    let projects = Arc::new(RecordingProjects {
        inner: InMemoryProjects::new(),
        log: log.clone(),
    });
    let fs_index = MemoryFs::builder()
        .registrar(projects.clone())
        .handlers(Arc::new(RecordingHandlers { log: log.clone() }))
        .backend(Arc::new(NoopBackend))
        .build()
        .unwrap();
    let root = IndexPath::new(root);

    fs_index.watch(&root).await.unwrap();

    let log = log.lock().unwrap().clone();
    let declared = position(&log, &format!("declare {root}"));
    let associated = position(&log, &format!("associate {root}"));
    let first_handled = log
        .iter()
        .position(|line| line.starts_with("handles"))
        .unwrap();
    assert!(declared < associated);
    assert!(associated < first_handled);

    // Every ordinary file was judged with the project already known
    assert!(position(&log, "handles a.js owned") > associated);
    assert!(position(&log, "handles b.js owned") > associated);
    assert!(position(&log, &format!("initialized {root}")) > first_handled);

    let record = projects.inner.get(&root).unwrap();
    assert!(record.initialized);
    assert_eq!(record.manifests.len(), 1);
}

#[tokio::test]
async fn test_config_dir_declares_project() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::create_dir_all(root.join(".config")).unwrap();
    fs::write(root.join(".config/projfs.json"), "{}").unwrap();
    fs::write(root.join("package.json"), r#"{"name":"app"}"#).unwrap();
    fs::write(root.join("a.js"), "").unwrap();

    let projects = Arc::new(InMemoryProjects::new());
    let fs_index = MemoryFs::builder()
        .registrar(projects.clone())
        .backend(Arc::new(NoopBackend))
        .build()
        .unwrap();
    let root = IndexPath::new(root);

    fs_index.watch(&root).await.unwrap();

    let record = projects.get(&root).unwrap();
    assert!(record.initialized);
    // Manifest crawled after the config dir, so it found its project
    assert_eq!(record.manifests.len(), 1);
}

struct NoopBackend;

impl projfs::WatchBackend for NoopBackend {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn open_root(&self, _root: &IndexPath) -> Result<(), projfs::WatchError> {
        Ok(())
    }

    fn watch_directory(&self, _dir: &IndexPath) -> Result<(), projfs::WatchError> {
        Ok(())
    }

    fn close_root(&self, _root: &IndexPath) {}
}
