//! Watch lifecycle behavior, driven through a backend that records calls
//! instead of talking to the OS.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use projfs::manifest::ManifestDefinition;
use projfs::{
    Diagnostics, Existence, FileEvent, FsError, InMemoryProjects, IndexPath, MemoryFs, ProjectId,
    ProjectRegistrar, WatchBackend, WatchError,
};
use tempfile::TempDir;
use tokio::sync::broadcast::error::TryRecvError;

#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<String>>,
}

impl RecordingBackend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl WatchBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn open_root(&self, root: &IndexPath) -> Result<(), WatchError> {
        self.record(format!("open {root}"));
        Ok(())
    }

    fn watch_directory(&self, dir: &IndexPath) -> Result<(), WatchError> {
        self.record(format!("dir {dir}"));
        Ok(())
    }

    fn close_root(&self, root: &IndexPath) {
        self.record(format!("close {root}"));
    }

    fn release_root(&self, root: &IndexPath) {
        self.record(format!("release {root}"));
    }

    fn forget_directory(&self, dir: &IndexPath) {
        self.record(format!("forget {dir}"));
    }
}

/// Registrar that holds the crawl inside `declare_project` for a while.
struct SlowProjects {
    inner: InMemoryProjects,
    delay: Duration,
}

#[async_trait]
impl ProjectRegistrar for SlowProjects {
    async fn declare_project(&self, root: &IndexPath, diagnostics: &Diagnostics) {
        tokio::time::sleep(self.delay).await;
        self.inner.declare_project(root, diagnostics).await;
    }

    fn find_project(&self, path: &IndexPath) -> Option<ProjectId> {
        self.inner.find_project(path)
    }

    fn is_project_root(&self, dir: &IndexPath) -> bool {
        self.inner.is_project_root(dir)
    }

    fn mark_initialized(&self, root: &IndexPath) {
        self.inner.mark_initialized(root);
    }

    fn associate_manifest(&self, project: ProjectId, manifest: &ManifestDefinition) {
        self.inner.associate_manifest(project, manifest);
    }
}

fn project() -> (TempDir, IndexPath) {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    fs::create_dir_all(root.join("src/nested")).unwrap();
    fs::create_dir_all(root.join(".git/objects")).unwrap();
    fs::write(root.join("src/a.js"), "export const a = 1;").unwrap();
    fs::write(root.join("src/nested/b.js"), "").unwrap();
    let root = IndexPath::new(root);
    (temp_dir, root)
}

fn build() -> (MemoryFs, Arc<RecordingBackend>) {
    let backend = Arc::new(RecordingBackend::default());
    let fs_index = MemoryFs::builder().backend(backend.clone()).build().unwrap();
    (fs_index, backend)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<FileEvent>) -> Vec<FileEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_every_crawled_directory_is_reported() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();

    fs_index.watch(&root).await.unwrap();

    let calls = backend.calls();
    assert_eq!(calls.first(), Some(&format!("open {root}")));
    assert!(calls.contains(&format!("dir {root}")));
    assert!(calls.contains(&format!("dir {}", root.join("src/nested"))));
    assert!(!calls.iter().any(|call| call.contains(".git")));
    assert_eq!(fs_index.watched_roots(), vec![root]);
}

#[tokio::test]
async fn test_watch_inside_active_root_is_a_no_op() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    fs_index.watch(&root).await.unwrap();
    let mut rx = fs_index.subscribe();
    let calls_before = backend.calls().len();

    fs_index.watch(root.join("src")).await.unwrap();
    fs_index.watch(&root).await.unwrap();

    assert_eq!(backend.calls().len(), calls_before);
    assert_eq!(fs_index.watched_roots(), vec![root]);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_ancestor_watch_absorbs_descendant_root() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    let src = root.join("src");

    fs_index.watch(&src).await.unwrap();
    fs_index.watch(&root).await.unwrap();

    assert_eq!(fs_index.watched_roots(), vec![root.clone()]);
    assert!(backend.calls().contains(&format!("release {src}")));
    assert!(fs_index.is_file(src.join("a.js")));
    assert_eq!(fs_index.count_files(&root), 2);
}

#[tokio::test]
async fn test_concurrent_watches_of_one_root_share_a_crawl() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();

    let (first, second) = tokio::join!(fs_index.watch(&root), fs_index.watch(&root));

    first.unwrap();
    second.unwrap();
    assert_eq!(backend.count("open "), 1);
    assert_eq!(fs_index.watched_roots(), vec![root]);
}

#[tokio::test]
async fn test_concurrent_nested_watches_leave_one_root() {
    let (_temp_dir, root) = project();
    let (fs_index, _backend) = build();

    let (outer, inner) = tokio::join!(fs_index.watch(&root), fs_index.watch(root.join("src/nested")));

    outer.unwrap();
    inner.unwrap();
    assert_eq!(fs_index.watched_roots(), vec![root]);
}

#[tokio::test]
async fn test_unwatch_evicts_without_events() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    fs_index.watch(&root).await.unwrap();
    let mut rx = fs_index.subscribe();

    assert!(fs_index.unwatch(&root));

    assert!(!fs_index.is_file(root.join("src/a.js")));
    assert!(!fs_index.is_directory(&root));
    assert_eq!(fs_index.get_files(), Vec::<IndexPath>::new());
    assert!(fs_index.watched_roots().is_empty());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(backend.calls().contains(&format!("close {root}")));

    // Not a root any more
    assert!(!fs_index.unwatch(&root));
}

#[tokio::test]
async fn test_rewatch_after_unwatch_reports_files_again() {
    let (_temp_dir, root) = project();
    let (fs_index, _backend) = build();
    fs_index.watch(&root).await.unwrap();
    fs_index.unwatch(&root);
    let mut rx = fs_index.subscribe();

    fs_index.watch(&root).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(e, FileEvent::NewFile { .. })));
}

#[tokio::test]
async fn test_watch_fails_with_collected_diagnostics() {
    let (_temp_dir, root) = project();
    fs::write(root.join("package.json"), "{ not json").unwrap();
    let (fs_index, _backend) = build();

    let err = fs_index.watch(&root).await.unwrap_err();

    match &err {
        FsError::Diagnostics { diagnostics, .. } => {
            assert!(diagnostics.iter().any(|d| d.category == "manifest/parse"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // The tree itself is still indexed
    assert!(fs_index.is_file(root.join("package.json")));
    assert!(fs_index.get_manifest(&root).is_none());
}

#[tokio::test]
async fn test_refresh_path_reconciles_changes() {
    let (_temp_dir, root) = project();
    let (fs_index, _backend) = build();
    fs_index.watch(&root).await.unwrap();
    let mut rx = fs_index.subscribe();

    fs::write(root.join("src/c.js"), "").unwrap();
    fs::remove_file(root.join("src/a.js")).unwrap();
    assert!(fs_index.refresh_path(root.join("src/c.js")).await.unwrap());
    assert!(fs_index.refresh_path(root.join("src/a.js")).await.unwrap());

    assert_eq!(
        drain(&mut rx),
        vec![
            FileEvent::NewFile {
                path: root.join("src/c.js")
            },
            FileEvent::DeletedFile {
                path: root.join("src/a.js")
            },
        ]
    );
    assert_eq!(
        fs_index.readdir(root.join("src")),
        vec![root.join("src/c.js"), root.join("src/nested")]
    );
}

#[tokio::test]
async fn test_refresh_outside_watched_roots_is_ignored() {
    let (_temp_dir, root) = project();
    let (fs_index, _backend) = build();

    assert!(!fs_index.refresh_path(root.join("src/a.js")).await.unwrap());
    assert!(!fs_index.is_file(root.join("src/a.js")));
}

#[tokio::test]
async fn test_new_directory_is_subscribed_on_refresh() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    fs_index.watch(&root).await.unwrap();

    fs::create_dir(root.join("lib")).unwrap();
    fs::write(root.join("lib/d.js"), "").unwrap();
    fs_index.refresh_path(root.join("lib")).await.unwrap();

    assert!(backend.calls().contains(&format!("dir {}", root.join("lib"))));
    assert!(fs_index.is_file(root.join("lib/d.js")));
}

#[tokio::test]
async fn test_unwatch_during_initial_crawl_discards_its_writes() {
    let (_temp_dir, root) = project();
    fs::create_dir(root.join(".config")).unwrap();
    fs::write(root.join(".config/projfs.json"), "{}").unwrap();
    fs::write(root.join("package.json"), r#"{"name":"app"}"#).unwrap();

    let fs_index = MemoryFs::builder()
        .registrar(Arc::new(SlowProjects {
            inner: InMemoryProjects::new(),
            delay: Duration::from_millis(300),
        }))
        .backend(Arc::new(RecordingBackend::default()))
        .build()
        .unwrap();
    let mut rx = fs_index.subscribe();

    let (watched, (existence, unwatched)) = tokio::join!(fs_index.watch(&root), async {
        // The crawl is parked in declare_project by now
        tokio::time::sleep(Duration::from_millis(50)).await;
        let existence = fs_index.exists(root.join("not-yet-seen.js"));
        (existence, fs_index.unwatch(&root))
    });

    watched.unwrap();
    assert_eq!(existence, Existence::Unknown);
    assert!(unwatched);
    assert!(fs_index.get_files().is_empty());
    assert!(!fs_index.is_directory(&root));
    assert!(fs_index.manifests().is_empty());
    assert!(fs_index.watched_roots().is_empty());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_recreated_directory_is_subscribed_again() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    fs_index.watch(&root).await.unwrap();
    let nested = root.join("src/nested");

    fs::remove_dir_all(&nested).unwrap();
    fs_index.refresh_path(&nested).await.unwrap();
    assert!(backend.calls().contains(&format!("forget {nested}")));

    fs::create_dir(&nested).unwrap();
    fs_index.refresh_path(&nested).await.unwrap();

    assert!(fs_index.is_directory(&nested));
    assert_eq!(backend.count(&format!("dir {nested}")), 2);
}

#[tokio::test]
async fn test_ancestor_watch_waits_for_pending_descendant() {
    let (_temp_dir, root) = project();
    let (fs_index, backend) = build();
    let nested = root.join("src/nested");

    let (inner, outer) = tokio::join!(fs_index.watch(&nested), fs_index.watch(&root));

    inner.unwrap();
    outer.unwrap();
    let calls = backend.calls();
    let position = |call: String| calls.iter().position(|c| *c == call).unwrap();
    // The nested crawl finished before the ancestor started its own
    assert!(position(format!("dir {nested}")) < position(format!("open {root}")));
    assert_eq!(backend.count(&format!("dir {nested}")), 1);
    assert!(calls.contains(&format!("release {nested}")));
    assert_eq!(fs_index.watched_roots(), vec![root]);
}
