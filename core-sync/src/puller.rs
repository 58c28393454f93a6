//! # Source Puller
//!
//! Incrementally mirrors the source hierarchy into the local docs directory.
//!
//! ## Workflow
//!
//! 1. Hydrate the [`ItemStore`] from the persisted snapshot (once per store)
//! 2. Page through the root doc listing at `Instant` priority, forwarding
//!    each batch together with already-indexed pages of those docs
//! 3. For every doc, a `High` priority *materialize* task creates or
//!    revalidates the doc folder, then queues a `Normal` *list pages* task
//! 4. Listing resolves each page's parent, computes its tree path and
//!    canonical file path, and queues an *export* for canvas pages
//! 5. Export skips up-to-date artifacts, otherwise requests an export,
//!    polls it at `Low` priority until a link is ready, downloads it and
//!    post-processes the content (image splice, mention rewrite)
//! 6. The item snapshot is saved at `Idle` priority every few exports and
//!    whenever the queue is nearly drained
//!
//! ## Revalidation
//!
//! When a doc's remote `updated_at` is newer than its local `synced_at` and
//! its canonical folder changed, the folder is renamed once and every
//! descendant's `file_path` is rebased onto the new folder.

use bridge_traits::destination::DestinationProvider;
use bridge_traits::source::{ExportFormat, ExportStatus, SourceDoc, SourcePage, SourceProvider};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bytes::Bytes;
use core_runtime::config::{MoverConfig, PullerSettings};
use core_runtime::events::{ItemPayload, ItemState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::content;
use crate::error::{Result, SyncError};
use crate::item::{sanitize_name, Item};
use crate::item_store::ItemStore;
use crate::scheduler::{Priority, Scheduler, Task};
use crate::status::{StatusBus, SYNC_DOCS_STATUS_ID};

/// Attempts at polling the HTML rendition used to recover images.
const HTML_POLL_ATTEMPTS: usize = 10;

/// Decrements the in-flight export counter when the initiation ends,
/// successfully or not.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PullerInner {
    source: Arc<dyn SourceProvider>,
    destination: Option<Arc<dyn DestinationProvider>>,
    store: Arc<ItemStore>,
    status: Arc<StatusBus>,
    file_system: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    settings: PullerSettings,
    docs_dir: PathBuf,
    exports_in_flight: AtomicUsize,
    exports_completed: AtomicUsize,
    snapshot_queued: AtomicBool,
    /// Export ids already requested per page, reused by retries and polls
    pending_exports: Mutex<HashMap<String, String>>,
}

/// Cloneable handle to a running source mirror.
#[derive(Clone)]
pub struct SourcePuller {
    inner: Arc<PullerInner>,
}

impl SourcePuller {
    /// `destination` is only used to resolve people mentions.
    pub fn new(
        config: &MoverConfig,
        source: Arc<dyn SourceProvider>,
        destination: Option<Arc<dyn DestinationProvider>>,
        store: Arc<ItemStore>,
        status: Arc<StatusBus>,
    ) -> Self {
        let scheduler = Scheduler::new(config.puller.scheduler, status.clone());

        Self {
            inner: Arc::new(PullerInner {
                source,
                destination,
                store,
                status,
                file_system: config.file_system.clone(),
                clock: config.clock.clone(),
                scheduler,
                settings: config.puller,
                docs_dir: config.docs_dir(),
                exports_in_flight: AtomicUsize::new(0),
                exports_completed: AtomicUsize::new(0),
                snapshot_queued: AtomicBool::new(false),
                pending_exports: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Start mirroring. Returns once the first listing task is queued; use
    /// [`wait_idle`](Self::wait_idle) to await the whole sync.
    #[instrument(skip(self))]
    pub async fn sync_docs(&self) -> Result<()> {
        let inner = &self.inner;
        inner.status.set(SYNC_DOCS_STATUS_ID, ItemState::Listing);

        let hydrate = async {
            inner.file_system.create_dir_all(&inner.docs_dir).await?;
            inner.store.hydrate().await
        };
        if let Err(e) = hydrate.await {
            inner
                .status
                .set_with_message(SYNC_DOCS_STATUS_ID, ItemState::Error, e.to_string());
            return Err(e);
        }

        inner.scheduler.add(PullerInner::list_docs_task(inner, None))
    }

    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    /// Stop accepting work, drop what is queued and await running tasks.
    ///
    /// A hydrated store is saved once the running tasks are over, since
    /// their idle-priority snapshot can no longer be scheduled.
    pub async fn dispose(&self) {
        self.inner.scheduler.dispose().await;
        if !self.inner.store.is_hydrated().await {
            return;
        }
        if let Err(e) = self.inner.store.save().await {
            warn!(error = %e, "Could not save item snapshot on dispose");
        }
    }
}

impl std::fmt::Debug for SourcePuller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePuller")
            .field("docs_dir", &self.inner.docs_dir)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

impl PullerInner {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    // ========================================================================
    // Task constructors
    // ========================================================================

    fn list_docs_task(self: &Arc<Self>, page_token: Option<String>) -> Task {
        let inner = Arc::clone(self);
        Task::new("list docs", Priority::Instant, move || {
            let inner = inner.clone();
            let page_token = page_token.clone();
            async move { inner.list_docs_page(page_token).await }
        })
        .with_context(SYNC_DOCS_STATUS_ID)
    }

    fn materialize_task(self: &Arc<Self>, doc: SourceDoc) -> Task {
        let inner = Arc::clone(self);
        let id = doc.id.clone();
        Task::new(format!("materialize:{}", id), Priority::High, move || {
            let inner = inner.clone();
            let doc = doc.clone();
            async move { inner.materialize(doc).await }
        })
        .with_context(id)
    }

    fn list_pages_task(self: &Arc<Self>, doc: SourceDoc) -> Task {
        let inner = Arc::clone(self);
        let id = doc.id.clone();
        Task::new(format!("list pages:{}", id), Priority::Normal, move || {
            let inner = inner.clone();
            let doc = doc.clone();
            async move { inner.list_pages(doc).await }
        })
        .with_context(id)
    }

    fn export_task(self: &Arc<Self>, doc_id: String, page: SourcePage, target: PathBuf) -> Task {
        let inner = Arc::clone(self);
        let id = page.id.clone();
        Task::new(format!("export:{}", id), Priority::Normal, move || {
            let inner = inner.clone();
            let doc_id = doc_id.clone();
            let page = page.clone();
            let target = target.clone();
            async move { inner.export(doc_id, page, target).await }
        })
        .with_context(id)
    }

    fn request_snapshot(self: &Arc<Self>, force: bool) {
        let completed = self.exports_completed.load(Ordering::SeqCst);
        let every = self.settings.snapshot_every_exports.max(1);
        let nearly_drained = self.scheduler.pending() < self.scheduler.concurrency();
        let due = force || nearly_drained || (completed > 0 && completed % every == 0);

        if !due || self.snapshot_queued.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        let task = Task::new("save snapshot", Priority::Idle, move || {
            let inner = inner.clone();
            async move {
                inner.snapshot_queued.store(false, Ordering::SeqCst);
                inner.store.save().await
            }
        });

        if self.scheduler.add(task).is_err() {
            self.snapshot_queued.store(false, Ordering::SeqCst);
            debug!("Scheduler closed, snapshot skipped");
        }
    }

    // ========================================================================
    // Docs
    // ========================================================================

    async fn list_docs_page(self: &Arc<Self>, page_token: Option<String>) -> Result<()> {
        let listing = self.source.list_docs(page_token.as_deref()).await?;
        debug!(
            count = listing.items.len(),
            has_more = listing.next_page_token.is_some(),
            "Listed source docs"
        );

        let mut docs = Vec::with_capacity(listing.items.len());
        for doc in &listing.items {
            let synced_at = self.store.get(&doc.id).await.and_then(|i| i.synced_at);
            let mut item = Item::doc(&doc.id, &doc.name);
            item.synced_at = synced_at;
            docs.push(item.to_payload());
        }
        self.status.docs(docs);

        // Pages indexed by an earlier run are shown before their doc is relisted.
        let doc_ids: Vec<String> = listing.items.iter().map(|d| d.id.clone()).collect();
        let known_pages: Vec<ItemPayload> = self
            .store
            .descendants_of_any(&doc_ids)
            .await
            .iter()
            .map(Item::to_payload)
            .collect();
        self.status.pages(known_pages);

        for doc in listing.items {
            self.scheduler.add(self.materialize_task(doc))?;
        }

        match listing.next_page_token {
            Some(token) => self.scheduler.add(self.list_docs_task(Some(token)))?,
            None => {
                info!("Doc listing complete");
                self.status.set(SYNC_DOCS_STATUS_ID, ItemState::Done);
                self.request_snapshot(true);
            }
        }
        Ok(())
    }

    fn doc_dir(&self, name: &str) -> PathBuf {
        self.docs_dir.join(sanitize_name(name))
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn materialize(self: &Arc<Self>, doc: SourceDoc) -> Result<()> {
        let target = self.doc_dir(&doc.name);
        let prior = self.store.get(&doc.id).await;

        match prior {
            Some(prior) if prior.file_path.is_some() => {
                if prior.is_stale(doc.updated_at) {
                    self.status.set(&doc.id, ItemState::Validating);
                    if let Some(old) = prior.file_path.as_deref() {
                        self.relocate(&doc.id, old, &target).await?;
                    }
                    let mut revalidated = prior;
                    revalidated.name = doc.name.clone();
                    revalidated.file_path = Some(target.clone());
                    revalidated.synced_at = Some(self.now());
                    self.store.put(revalidated).await?;
                    info!("Revalidated doc");
                }
            }
            _ => {
                self.status.set(&doc.id, ItemState::Saving);
                let item = Item::doc(&doc.id, &doc.name)
                    .with_file_path(&target)
                    .with_synced_at(self.now());
                self.store.put(item).await?;
            }
        }

        self.file_system.create_dir_all(&target).await?;
        self.scheduler.add(self.list_pages_task(doc))?;
        Ok(())
    }

    /// Move a folder (and the paths recorded below it) to a new location.
    ///
    /// Performs at most one rename regardless of how many descendants exist.
    async fn relocate(&self, item_id: &str, old: &Path, new: &Path) -> Result<bool> {
        if old == new {
            return Ok(false);
        }

        if self.file_system.exists(old).await? {
            self.file_system.rename(old, new).await?;
        }
        let rebased = self.store.rebase_descendants(item_id, old, new).await;

        info!(item_id, from = ?old, to = ?new, rebased, "Relocated folder");
        Ok(true)
    }

    // ========================================================================
    // Pages
    // ========================================================================

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn list_pages(self: &Arc<Self>, doc: SourceDoc) -> Result<()> {
        let doc_item = self
            .store
            .get(&doc.id)
            .await
            .ok_or_else(|| SyncError::ItemNotFound(doc.id.clone()))?;
        self.status.set(&doc.id, ItemState::Listing);

        let mut pages: Vec<SourcePage> = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let listing = self
                .source
                .list_pages_for_doc(&doc.id, page_token.as_deref())
                .await?;
            pages.extend(listing.items);
            match listing.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(count = pages.len(), "Listed source pages");

        let doc_dir = doc_item
            .children_dir()
            .unwrap_or_else(|| self.doc_dir(&doc.name));
        let mut placed: HashMap<String, (String, PathBuf)> = HashMap::new();
        placed.insert(doc.id.clone(), (doc_item.child_tree_path(), doc_dir));

        let listed: HashMap<&str, &SourcePage> =
            pages.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut payloads = Vec::new();
        let mut remaining: Vec<&SourcePage> = pages.iter().collect();

        // Parents may be listed after their children; place in waves.
        while !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();

            for page in remaining {
                let parent_id = page.parent_id.as_deref().unwrap_or(&doc.id);
                let parent = match placed.get(parent_id) {
                    Some(parent) => parent.clone(),
                    None if listed.contains_key(parent_id) => {
                        deferred.push(page);
                        continue;
                    }
                    None => match self.store.get(parent_id).await {
                        Some(known) if known.root_id() == doc.id => {
                            let dir = known
                                .children_dir()
                                .unwrap_or_else(|| self.doc_dir(&doc.name));
                            (known.child_tree_path(), dir)
                        }
                        _ => {
                            let error = SyncError::MissingParent {
                                item_id: page.id.clone(),
                                parent_id: parent_id.to_string(),
                            };
                            warn!(page_id = %page.id, error = %error, "Cannot place page");
                            self.status
                                .set_with_message(&page.id, ItemState::Error, error.to_string());
                            continue;
                        }
                    },
                };

                let position = positions.entry(parent_id.to_string()).or_insert(0);
                let index = *position;
                *position += 1;

                match self.index_page(&doc.id, page, &parent, index).await {
                    Ok(Some((item, target))) => {
                        payloads.push(item.to_payload());
                        placed.insert(
                            page.id.clone(),
                            (item.child_tree_path(), target.with_extension("")),
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(page_id = %page.id, error = %e, "Failed to index page");
                        self.status
                            .set_with_message(&page.id, ItemState::Error, e.to_string());
                    }
                }
            }

            if deferred.len() == before {
                for page in deferred {
                    let parent_id = page.parent_id.clone().unwrap_or_default();
                    let error = SyncError::MissingParent {
                        item_id: page.id.clone(),
                        parent_id,
                    };
                    self.status
                        .set_with_message(&page.id, ItemState::Error, error.to_string());
                }
                break;
            }
            remaining = deferred;
        }

        self.status.pages(payloads);
        self.status.set(&doc.id, ItemState::Done);
        self.request_snapshot(false);
        Ok(())
    }

    /// Record one listed page and queue its export when it is a canvas.
    ///
    /// Returns the stored item and its canonical artifact path, or `None`
    /// when a former canvas record was dropped.
    async fn index_page(
        self: &Arc<Self>,
        doc_id: &str,
        page: &SourcePage,
        parent: &(String, PathBuf),
        position: usize,
    ) -> Result<Option<(Item, PathBuf)>> {
        let (tree_path, parent_dir) = parent;
        let target = parent_dir.join(format!(
            "{}.{}",
            sanitize_name(&page.name),
            self.settings.export_format.extension()
        ));
        let prior = self.store.get(&page.id).await;

        if !page.is_canvas() {
            if prior.as_ref().is_some_and(Item::is_exportable) {
                self.store.remove(&page.id).await;
                debug!(page_id = %page.id, "Dropped page that is no longer a canvas");
                self.status
                    .set_with_message(&page.id, ItemState::Skipped, "no longer a canvas");
                return Ok(None);
            }
            let item = Item::page(&page.id, &page.name, &page.content_type, tree_path.clone())
                .with_position(position);
            self.store.put(item.clone()).await?;
            self.status
                .set_with_message(&page.id, ItemState::Skipped, "not a canvas");
            return Ok(Some((item, target)));
        }

        let mut item = Item::page(&page.id, &page.name, &page.content_type, tree_path.clone())
            .with_position(position);
        if let Some(prior) = prior {
            item.file_path = prior.file_path;
            item.synced_at = prior.synced_at;
        }
        // Children are indexed after their parent, so the folder is in place
        // before any child export is queued.
        if let Some(old) = item.file_path.clone().filter(|old| *old != target) {
            self.move_page(&page.id, &old, &target).await?;
            item.file_path = Some(target.clone());
        }
        self.store.put(item.clone()).await?;

        self.status.set(&page.id, ItemState::Pending);
        self.scheduler.add(self.export_task(
            doc_id.to_string(),
            page.clone(),
            target.clone(),
        ))?;
        Ok(Some((item, target)))
    }

    /// Move a renamed page's artifact and its children folder.
    ///
    /// An artifact of another format is dropped instead, so the export
    /// writes a fresh one.
    async fn move_page(&self, page_id: &str, old: &Path, new: &Path) -> Result<()> {
        self.relocate(page_id, &old.with_extension(""), &new.with_extension(""))
            .await?;

        if self.file_system.exists(old).await? {
            if old.extension() == new.extension() {
                self.file_system.rename(old, new).await?;
            } else {
                self.file_system.delete_file(old).await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Export
    // ========================================================================

    async fn is_up_to_date(&self, item: &Item, page: &SourcePage, target: &Path) -> Result<bool> {
        if item.file_path.as_deref() != Some(target)
            || item.is_stale(page.updated_at)
            || item.is_stale(page.created_at)
        {
            return Ok(false);
        }
        Ok(self.file_system.exists(target).await?)
    }

    /// Request an export, throttled by the number of requests in flight.
    async fn initiate_export(
        &self,
        doc_id: &str,
        page_id: &str,
        format: ExportFormat,
    ) -> Result<String> {
        let in_flight = self.exports_in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(&self.exports_in_flight);

        let delay = self.settings.export_throttle * in_flight as u32;
        if !delay.is_zero() {
            debug!(page_id, in_flight, delay_ms = delay.as_millis() as u64, "Throttling export");
            tokio::time::sleep(delay).await;
        }

        let job = self.source.export_page(doc_id, page_id, format).await?;
        debug!(page_id, export_id = %job.id, "Export requested");
        Ok(job.id)
    }

    #[instrument(skip(self, page, target), fields(page_id = %page.id))]
    async fn export(self: &Arc<Self>, doc_id: String, page: SourcePage, target: PathBuf) -> Result<()> {
        let item = self
            .store
            .get(&page.id)
            .await
            .ok_or_else(|| SyncError::ItemNotFound(page.id.clone()))?;

        let known_export = self.pending_exports.lock().await.get(&page.id).cloned();
        let export_id = match known_export {
            Some(export_id) => export_id,
            None => {
                if self.is_up_to_date(&item, &page, &target).await? {
                    self.status
                        .set_with_message(&page.id, ItemState::Skipped, "up to date");
                    return Ok(());
                }

                self.status.set(&page.id, ItemState::Exporting);
                let format = self.settings.export_format;
                let export_id = self.initiate_export(&doc_id, &page.id, format).await?;
                self.pending_exports
                    .lock()
                    .await
                    .insert(page.id.clone(), export_id.clone());
                export_id
            }
        };

        let export = self
            .source
            .get_page_export(&doc_id, &page.id, &export_id)
            .await?;

        if export.status == ExportStatus::Failed {
            self.pending_exports.lock().await.remove(&page.id);
            return Err(SyncError::ExportFailed {
                page_id: page.id.clone(),
                export_id,
            });
        }

        let Some(link) = export.ready_link() else {
            debug!(export_id = %export_id, status = ?export.status, "Export not ready");
            self.status
                .set_with_message(&page.id, ItemState::Waiting, "export not ready");
            let retry = self
                .export_task(doc_id, page, target)
                .with_priority(Priority::Low);
            return self
                .scheduler
                .add_after(retry, self.settings.scheduler.rate_limit_retry_delay);
        };

        self.status.set(&page.id, ItemState::Downloading);
        let data = self.source.download(link).await?;
        let data = self.post_process(&doc_id, &page.id, data).await?;

        let size = data.len();
        self.file_system.write_file(&target, data).await?;

        let synced_at = self.now();
        let target_path = target.clone();
        self.store
            .update(&page.id, move |item| {
                item.file_path = Some(target_path);
                item.synced_at = Some(synced_at);
            })
            .await?;
        self.pending_exports.lock().await.remove(&page.id);

        info!(size, path = ?target, "Page exported");
        self.status.set(&page.id, ItemState::Done);
        self.exports_completed.fetch_add(1, Ordering::SeqCst);
        self.request_snapshot(false);
        Ok(())
    }

    /// Restore stripped images and rewrite mentions in a markdown export.
    async fn post_process(&self, doc_id: &str, page_id: &str, data: Bytes) -> Result<Bytes> {
        if self.settings.export_format != ExportFormat::Markdown {
            return Ok(data);
        }

        let mut text = String::from_utf8_lossy(&data).into_owned();
        let mut changed = false;

        if content::has_image_placeholders(&text) {
            match self.fetch_image_sources(doc_id, page_id).await {
                Ok(images) if !images.is_empty() => {
                    self.status.set(page_id, ItemState::ReplacingImages);
                    text = content::splice_images(&text, &images);
                    changed = true;
                }
                Ok(_) => {}
                Err(e) if e.is_rate_limited() => return Err(e),
                Err(e) => warn!(page_id, error = %e, "Could not recover images"),
            }
        }

        let emails = content::mention_emails(&text);
        if !emails.is_empty() {
            let users = match &self.destination {
                Some(destination) => destination.list_users(&emails).await?,
                None => Vec::new(),
            };
            debug!(page_id, mentions = emails.len(), resolved = users.len(), "Rewriting mentions");
            text = content::rewrite_mentions(&text, &users);
            changed = true;
        }

        Ok(if changed { Bytes::from(text) } else { data })
    }

    /// Export the HTML rendition and pull image sources out of it.
    async fn fetch_image_sources(&self, doc_id: &str, page_id: &str) -> Result<Vec<String>> {
        self.status.set(page_id, ItemState::FetchingImages);
        let export_id = self
            .initiate_export(doc_id, page_id, ExportFormat::Html)
            .await?;

        for attempt in 0..HTML_POLL_ATTEMPTS {
            let export = self
                .source
                .get_page_export(doc_id, page_id, &export_id)
                .await?;

            if let Some(link) = export.ready_link() {
                self.status.set(page_id, ItemState::DownloadingImages);
                let html = self.source.download(link).await?;
                return Ok(content::extract_image_sources(&String::from_utf8_lossy(
                    &html,
                )));
            }
            if export.status == ExportStatus::Failed {
                break;
            }

            debug!(page_id, attempt, "HTML rendition not ready");
            tokio::time::sleep(self.settings.scheduler.rate_limit_retry_delay).await;
        }

        warn!(page_id, "HTML rendition unavailable, keeping blank lines");
        Ok(Vec::new())
    }
}
