//! End-to-end puller scenarios against an in-memory source and a real
//! temp-dir file system.

use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bridge_traits::destination::{
    Collection, CreateCollection, CreateDocument, DestinationProvider, Document, DocumentNode,
    MoveDocument, UpdateDocument, User,
};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse};
use bridge_traits::source::{
    ExportFormat, ExportJob, ExportStatus, Listing, PageExport, SourceDoc, SourcePage,
    SourceProvider,
};
use bridge_traits::storage::{FileMetadata, FileSystemAccess};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use core_runtime::config::MoverConfig;
use core_runtime::events::{EventBus, ItemState};
use core_sync::{ItemStore, SourcePuller, StatusBus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test doubles
// ============================================================================

struct NoHttp;

#[async_trait]
impl HttpClient for NoHttp {
    async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
        Err(BridgeError::NotAvailable("no network in tests".into()))
    }
}

/// Delegates to the real file system and counts renames.
struct CountingFs {
    inner: TokioFileSystem,
    renames: AtomicUsize,
}

#[async_trait]
impl FileSystemAccess for CountingFs {
    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        self.inner.exists(path).await
    }
    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        self.inner.metadata(path).await
    }
    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        self.inner.create_dir_all(path).await
    }
    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.inner.read_file(path).await
    }
    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.inner.write_file(path, data).await
    }
    async fn rename(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.inner.rename(from, to).await
    }
    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        self.inner.delete_file(path).await
    }
}

#[derive(Default)]
struct SourceState {
    docs: Vec<SourceDoc>,
    pages: HashMap<String, Vec<SourcePage>>,
    markdown: HashMap<String, String>,
    html: HashMap<String, String>,
    exports: HashMap<String, (String, ExportFormat)>,
    export_requests: Vec<(String, ExportFormat)>,
    downloads: usize,
    rate_limits_left: usize,
    polls_before_ready: usize,
    /// Artificial latency of markdown downloads, per page id
    slow_downloads: HashMap<String, Duration>,
}

#[derive(Default, Clone)]
struct MockSource {
    state: Arc<Mutex<SourceState>>,
}

impl MockSource {
    fn add_doc(&self, id: &str, name: &str, updated_at: DateTime<Utc>) {
        self.state.lock().unwrap().docs.push(SourceDoc {
            id: id.into(),
            name: name.into(),
            created_at: at(2024, 1, 1),
            updated_at,
        });
    }

    fn add_page(&self, doc_id: &str, id: &str, name: &str, parent: Option<&str>, body: &str) {
        self.add_typed_page(doc_id, id, name, parent, "canvas");
        self.state
            .lock()
            .unwrap()
            .markdown
            .insert(id.into(), body.into());
    }

    fn add_typed_page(
        &self,
        doc_id: &str,
        id: &str,
        name: &str,
        parent: Option<&str>,
        content_type: &str,
    ) {
        self.state
            .lock()
            .unwrap()
            .pages
            .entry(doc_id.into())
            .or_default()
            .push(SourcePage {
                id: id.into(),
                name: name.into(),
                content_type: content_type.into(),
                parent_id: parent.map(String::from),
                created_at: at(2024, 1, 1),
                updated_at: at(2024, 2, 1),
            });
    }

    fn rename_doc(&self, id: &str, name: &str, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(doc) = state.docs.iter_mut().find(|d| d.id == id) {
            doc.name = name.into();
            doc.updated_at = updated_at;
        }
    }

    fn rename_page(&self, doc_id: &str, id: &str, name: &str, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(page) = state
            .pages
            .get_mut(doc_id)
            .and_then(|pages| pages.iter_mut().find(|p| p.id == id))
        {
            page.name = name.into();
            page.updated_at = updated_at;
        }
    }

    fn markdown_exports(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .export_requests
            .iter()
            .filter(|(_, f)| *f == ExportFormat::Markdown)
            .count()
    }

    fn exports_for(&self, page_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .export_requests
            .iter()
            .filter(|(p, f)| p == page_id && *f == ExportFormat::Markdown)
            .count()
    }

    fn downloads(&self) -> usize {
        self.state.lock().unwrap().downloads
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    async fn list_docs(&self, page_token: Option<&str>) -> BridgeResult<Listing<SourceDoc>> {
        let docs = self.state.lock().unwrap().docs.clone();
        // Two docs per listing page to exercise pagination.
        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (start + 2).min(docs.len());
        Ok(Listing {
            items: docs[start..end].to_vec(),
            next_page_token: (end < docs.len()).then(|| end.to_string()),
        })
    }

    async fn list_pages_for_doc(
        &self,
        doc_id: &str,
        _page_token: Option<&str>,
    ) -> BridgeResult<Listing<SourcePage>> {
        let pages = self
            .state
            .lock()
            .unwrap()
            .pages
            .get(doc_id)
            .cloned()
            .unwrap_or_default();
        Ok(Listing::last(pages))
    }

    async fn export_page(
        &self,
        _doc_id: &str,
        page_id: &str,
        format: ExportFormat,
    ) -> BridgeResult<ExportJob> {
        let mut state = self.state.lock().unwrap();
        if state.rate_limits_left > 0 {
            state.rate_limits_left -= 1;
            return Err(BridgeError::RateLimited {
                retry_after_seconds: None,
            });
        }

        let id = format!("exp-{}", state.exports.len());
        state
            .exports
            .insert(id.clone(), (page_id.to_string(), format));
        state.export_requests.push((page_id.to_string(), format));
        Ok(ExportJob {
            id,
            status: "inProgress".into(),
        })
    }

    async fn get_page_export(
        &self,
        _doc_id: &str,
        _page_id: &str,
        export_id: &str,
    ) -> BridgeResult<PageExport> {
        let mut state = self.state.lock().unwrap();
        if !state.exports.contains_key(export_id) {
            return Ok(PageExport::not_found());
        }
        if state.polls_before_ready > 0 {
            state.polls_before_ready -= 1;
            return Ok(PageExport {
                status: ExportStatus::InProgress,
                download_link: None,
            });
        }
        Ok(PageExport {
            status: ExportStatus::Complete,
            download_link: Some(format!("mem://{}", export_id)),
        })
    }

    async fn download(&self, url: &str) -> BridgeResult<Bytes> {
        let (body, delay) = {
            let mut state = self.state.lock().unwrap();
            state.downloads += 1;
            let export_id = url.trim_start_matches("mem://");
            let (page_id, format) = state
                .exports
                .get(export_id)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(url.to_string()))?;
            let body = match format {
                ExportFormat::Markdown => state.markdown.get(&page_id),
                ExportFormat::Html => state.html.get(&page_id),
            };
            let delay = match format {
                ExportFormat::Markdown => state.slow_downloads.get(&page_id).copied(),
                ExportFormat::Html => None,
            };
            (body.cloned().unwrap_or_default(), delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Bytes::from(body))
    }
}

/// Destination that can only resolve users.
struct Directory {
    users: Vec<User>,
}

#[async_trait]
impl DestinationProvider for Directory {
    async fn list_collections(&self, _offset: usize) -> BridgeResult<Vec<Collection>> {
        unimplemented!()
    }
    async fn search_documents(&self, _c: &str, _q: &str) -> BridgeResult<Vec<Document>> {
        unimplemented!()
    }
    async fn create_collection(&self, _input: CreateCollection) -> BridgeResult<Collection> {
        unimplemented!()
    }
    async fn create_document(&self, _input: CreateDocument) -> BridgeResult<Document> {
        unimplemented!()
    }
    async fn get_document(&self, _id: &str) -> BridgeResult<Document> {
        unimplemented!()
    }
    async fn archive_document(&self, _id: &str) -> BridgeResult<()> {
        unimplemented!()
    }
    async fn import_document_by_file(
        &self,
        _collection_id: &str,
        _file_path: &Path,
        _parent_document_id: Option<&str>,
    ) -> BridgeResult<Document> {
        unimplemented!()
    }
    async fn update_document(&self, _input: UpdateDocument) -> BridgeResult<Document> {
        unimplemented!()
    }
    async fn get_collection_tree(&self, _id: &str) -> BridgeResult<Vec<DocumentNode>> {
        unimplemented!()
    }
    async fn move_document(&self, _input: MoveDocument) -> BridgeResult<()> {
        unimplemented!()
    }
    async fn list_users(&self, emails: &[String]) -> BridgeResult<Vec<User>> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.email.as_ref().is_some_and(|e| emails.contains(e)))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Harness
// ============================================================================

fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

struct Harness {
    dir: TempDir,
    fs: Arc<CountingFs>,
    source: MockSource,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let fs = Arc::new(CountingFs {
            inner: TokioFileSystem::with_data_directory(dir.path().to_path_buf()),
            renames: AtomicUsize::new(0),
        });
        Self {
            dir,
            fs,
            source: MockSource::default(),
        }
    }

    fn config(&self) -> MoverConfig {
        MoverConfig::builder()
            .data_dir(self.dir.path())
            .http_client(Arc::new(NoHttp))
            .file_system(self.fs.clone())
            .export_throttle_ms(0)
            .rate_limit_retry_delay_ms(5)
            .puller_concurrency(3)
            .build()
            .unwrap()
    }

    fn docs_dir(&self) -> PathBuf {
        self.dir.path().join("docs")
    }

    fn store(&self) -> Arc<ItemStore> {
        Arc::new(ItemStore::new(self.fs.clone(), self.config().snapshot_path()))
    }

    /// Fresh puller and store, as after an application restart.
    fn puller(&self, destination: Option<Arc<dyn DestinationProvider>>) -> (SourcePuller, Arc<StatusBus>) {
        self.puller_on(self.store(), destination)
    }

    /// Puller over an existing store, as when the source token changes.
    fn puller_on(
        &self,
        store: Arc<ItemStore>,
        destination: Option<Arc<dyn DestinationProvider>>,
    ) -> (SourcePuller, Arc<StatusBus>) {
        let config = self.config();
        let status = Arc::new(StatusBus::new(EventBus::new(256)));
        let puller = SourcePuller::new(
            &config,
            Arc::new(self.source.clone()),
            destination,
            store,
            status.clone(),
        );
        (puller, status)
    }

    async fn sync(&self) -> (SourcePuller, Arc<StatusBus>) {
        let (puller, status) = self.puller(None);
        puller.sync_docs().await.unwrap();
        puller.wait_idle().await;
        (puller, status)
    }

    fn snapshot(&self) -> Vec<u8> {
        std::fs::read(self.dir.path().join("coda.json")).unwrap()
    }
}

fn state(status: &StatusBus, id: &str) -> Option<ItemState> {
    status.status_of(id).map(|s| s.status)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_new_doc_exported_and_synced_doc_skipped() {
    let h = Harness::new();
    h.source.add_doc("b", "B", at(2024, 1, 1));
    h.source.add_page("b", "b1", "Notes", None, "# Notes");
    h.sync().await;
    assert_eq!(h.source.exports_for("b1"), 1);

    h.source.add_doc("a", "A", at(2024, 1, 1));
    h.source.add_page("a", "a1", "Intro", None, "# Intro");
    h.source.add_page("a", "a2", "Child", Some("a1"), "# Child");
    let (puller, status) = h.sync().await;

    assert_eq!(h.source.exports_for("a1"), 1);
    assert_eq!(h.source.exports_for("a2"), 1);
    assert_eq!(h.source.exports_for("b1"), 1);
    assert_eq!(state(&status, "b1"), Some(ItemState::Skipped));
    assert_eq!(state(&status, "a2"), Some(ItemState::Done));

    let child = h.docs_dir().join("A").join("Intro").join("Child.md");
    assert_eq!(std::fs::read_to_string(&child).unwrap(), "# Child");

    let stored = puller.store().get("a2").await.unwrap();
    assert_eq!(stored.tree_path, "/a/a1/");
    assert_eq!(stored.file_path, Some(child));
    assert!(stored.synced_at.is_some());
}

#[tokio::test]
async fn test_second_sync_is_idempotent() {
    let h = Harness::new();
    for i in 0..3 {
        let doc = format!("d{}", i);
        h.source.add_doc(&doc, &format!("Doc {}", i), at(2024, 1, 1));
        h.source
            .add_page(&doc, &format!("{}-p", doc), "Page", None, "body");
    }

    h.sync().await;
    let first = h.snapshot();
    let downloads = h.source.downloads();

    h.sync().await;

    assert_eq!(h.source.downloads(), downloads);
    assert_eq!(h.source.markdown_exports(), 3);
    assert_eq!(h.snapshot(), first);
}

#[tokio::test]
async fn test_renamed_doc_moves_folder_once() {
    let h = Harness::new();
    h.source.add_doc("d", "Old", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Intro", None, "intro");
    h.source.add_page("d", "p2", "Deep", Some("p1"), "deep");
    h.source.add_page("d", "p3", "Other", None, "other");
    h.sync().await;
    let renames_before = h.fs.renames.load(Ordering::SeqCst);

    h.source.rename_doc("d", "New", Utc::now() + chrono::Duration::days(1));
    let (puller, _) = h.sync().await;

    assert_eq!(h.fs.renames.load(Ordering::SeqCst) - renames_before, 1);
    assert!(!h.docs_dir().join("Old").exists());
    assert!(h.docs_dir().join("New").join("Intro").join("Deep.md").exists());
    assert_eq!(
        puller.store().get("p2").await.unwrap().file_path,
        Some(h.docs_dir().join("New").join("Intro").join("Deep.md"))
    );
    assert_eq!(puller.store().get("d").await.unwrap().name, "New");
    // Pages themselves were unchanged, so nothing was exported again.
    assert_eq!(h.source.markdown_exports(), 3);
}

#[tokio::test]
async fn test_renamed_page_moves_children_before_their_exports() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Old", None, "parent");
    h.source.add_page("d", "c1", "First", Some("p1"), "one");
    h.source.add_page("d", "c2", "Second", Some("p1"), "two");
    h.sync().await;

    h.source
        .rename_page("d", "p1", "New", Utc::now() + chrono::Duration::days(1));
    h.source.state.lock().unwrap().polls_before_ready = 1;
    let (puller, status) = h.sync().await;

    let doc_dir = h.docs_dir().join("Doc");
    assert_eq!(state(&status, "p1"), Some(ItemState::Done));
    assert_eq!(
        puller.store().get("p1").await.unwrap().file_path,
        Some(doc_dir.join("New.md"))
    );
    assert_eq!(std::fs::read_to_string(doc_dir.join("New.md")).unwrap(), "parent");
    assert!(!doc_dir.join("Old.md").exists());
    assert!(!doc_dir.join("Old").exists());
    for (id, name) in [("c1", "First"), ("c2", "Second")] {
        let moved = doc_dir.join("New").join(format!("{}.md", name));
        assert!(moved.exists());
        assert_eq!(puller.store().get(id).await.unwrap().file_path, Some(moved));
        assert_eq!(h.source.exports_for(id), 1);
    }
    assert_eq!(h.source.exports_for("p1"), 2);
}

#[tokio::test]
async fn test_replacement_puller_keeps_exports_finished_during_dispose() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Fast", None, "fast");
    h.source.add_page("d", "p2", "Slow", None, "slow");
    h.source
        .state
        .lock()
        .unwrap()
        .slow_downloads
        .insert("p2".into(), Duration::from_millis(300));

    let store = h.store();
    let (first, _) = h.puller_on(store.clone(), None);
    first.sync_docs().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.dispose().await;

    let in_memory = store.get("p2").await.and_then(|item| item.synced_at);
    let on_disk = h.store();
    on_disk.load().await.unwrap();
    assert_eq!(
        on_disk.get("p2").await.and_then(|item| item.synced_at),
        in_memory
    );

    let (second, status) = h.puller_on(store.clone(), None);
    second.sync_docs().await.unwrap();
    second.wait_idle().await;

    assert_eq!(h.source.exports_for("p2"), 1);
    assert_eq!(state(&status, "p2"), Some(ItemState::Skipped));
    assert!(store.get("p2").await.unwrap().synced_at.is_some());
}

#[tokio::test]
async fn test_rate_limited_export_reaches_done() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Page", None, "body");
    h.source.state.lock().unwrap().rate_limits_left = 1;

    let (_, status) = h.sync().await;

    assert_eq!(state(&status, "p1"), Some(ItemState::Done));
    assert_eq!(h.source.exports_for("p1"), 1);
    assert!(h.docs_dir().join("Doc").join("Page.md").exists());
}

#[tokio::test]
async fn test_pending_export_is_polled_not_re_requested() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Page", None, "body");
    h.source.state.lock().unwrap().polls_before_ready = 3;

    let (_, status) = h.sync().await;

    assert_eq!(h.source.exports_for("p1"), 1);
    assert_eq!(state(&status, "p1"), Some(ItemState::Done));
}

#[tokio::test]
async fn test_non_canvas_pages_are_indexed_not_exported() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_typed_page("d", "t1", "Table", None, "table");
    h.source.add_page("d", "p1", "Page", None, "body");

    let (puller, status) = h.sync().await;

    assert_eq!(h.source.exports_for("t1"), 0);
    assert_eq!(state(&status, "t1"), Some(ItemState::Skipped));
    let table = puller.store().get("t1").await.unwrap();
    assert!(!table.is_exportable());
    assert_eq!(table.tree_path, "/d/");

    let children: Vec<String> = puller
        .store()
        .children_of("d")
        .await
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(children, vec!["t1", "p1"]);
}

#[tokio::test]
async fn test_unknown_parent_fails_only_that_page() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "orphan", "Orphan", Some("ghost"), "x");
    h.source.add_page("d", "p1", "Page", None, "body");

    let (puller, status) = h.sync().await;

    let orphan = status.status_of("orphan").unwrap();
    assert_eq!(orphan.status, ItemState::Error);
    assert!(orphan.message.unwrap().contains("ghost"));
    assert!(puller.store().get("orphan").await.is_none());
    assert_eq!(state(&status, "p1"), Some(ItemState::Done));
}

#[tokio::test]
async fn test_children_listed_before_parent_are_placed() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "child", "Child", Some("parent"), "c");
    h.source.add_page("d", "parent", "Parent", None, "p");

    let (puller, _) = h.sync().await;

    assert_eq!(
        puller.store().get("child").await.unwrap().tree_path,
        "/d/parent/"
    );
    assert!(h.docs_dir().join("Doc").join("Parent").join("Child.md").exists());
}

#[tokio::test]
async fn test_images_are_spliced_from_html_rendition() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Page", None, "Before\n\n\nAfter");
    h.source.state.lock().unwrap().html.insert(
        "p1".into(),
        r#"<p>Before</p><img src="https://img.example/1.png"><p>After</p>"#.into(),
    );

    h.sync().await;

    let body = std::fs::read_to_string(h.docs_dir().join("Doc").join("Page.md")).unwrap();
    assert_eq!(body, "Before\n\n![](https://img.example/1.png)\n\nAfter");
}

#[tokio::test]
async fn test_mentions_are_rewritten() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page(
        "d",
        "p1",
        "Page",
        None,
        "Owner: [@Ann](mailto:ann@x.io), reviewer: [@Bo](mailto:bo@x.io)",
    );

    let directory: Arc<dyn DestinationProvider> = Arc::new(Directory {
        users: vec![User {
            id: "user-ann".into(),
            name: "Ann".into(),
            email: Some("ann@x.io".into()),
        }],
    });
    let (puller, _) = h.puller(Some(directory));
    puller.sync_docs().await.unwrap();
    puller.wait_idle().await;

    let body = std::fs::read_to_string(h.docs_dir().join("Doc").join("Page.md")).unwrap();
    assert!(body.contains("@[Ann](mention://"));
    assert!(body.contains("/user/user-ann)"));
    assert!(body.ends_with("reviewer: @Bo"));
}

#[tokio::test]
async fn test_tree_path_invariant_holds_after_sync() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "One", None, "1");
    h.source.add_page("d", "p2", "Two", Some("p1"), "2");
    h.source.add_page("d", "p3", "Three", Some("p2"), "3");
    h.source.add_page("d", "p4", "Four", Some("p1"), "4");

    let (puller, _) = h.sync().await;
    let store = puller.store();

    for item in store.all().await {
        let expected = item.child_tree_path();
        let children = store.children_of(&item.id).await;
        let by_scan: Vec<String> = store
            .all()
            .await
            .into_iter()
            .filter(|i| i.tree_path == expected)
            .map(|i| i.id)
            .collect();
        let mut listed: Vec<String> = children.into_iter().map(|i| i.id).collect();
        listed.sort();
        assert_eq!(listed, by_scan);
    }
}

#[tokio::test]
async fn test_dispose_stops_new_work() {
    let h = Harness::new();
    h.source.add_doc("d", "Doc", at(2024, 1, 1));
    h.source.add_page("d", "p1", "Page", None, "body");

    let (puller, _) = h.puller(None);
    puller.dispose().await;

    assert!(puller.sync_docs().await.is_err());
    assert_eq!(h.source.markdown_exports(), 0);
}
