//! # Destination Importer
//!
//! Two-phase migration of selected items into the destination wiki.
//!
//! ## Validate
//!
//! Read-only reconciliation. Root docs are matched to destination collections
//! by name, pages to destination documents by title inside the mapped
//! collection. The result is an instruction plan plus a list of issues, and
//! the job waits in `confirming` until the caller confirms or rejects it.
//!
//! ## Process
//!
//! Instructions are grouped per item into *units* that run sequentially
//! (archive before re-import). Root units are queued first; a unit's children
//! are queued only after the unit succeeded, so a destination parent always
//! exists before anything nests beneath it. A failed unit retires itself and
//! every unit below it.
//!
//! Completion is tracked with an explicit count of outstanding work (units,
//! ordering checks and move batches). The job is `done` when it drops to zero,
//! after which an audit snapshot is written at idle priority.
//!
//! ## Enhanced mode
//!
//! Artifacts above the upload limit are flagged during validation. After all
//! children of a parent are processed, the destination tree is compared with
//! the source order and out-of-order siblings are moved at idle priority.

use bridge_traits::destination::{
    Collection, CreateCollection, DestinationProvider, MoveDocument, UpdateDocument,
};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::time::Clock;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::config::{ImporterSettings, MoverConfig};
use core_runtime::events::{ImportLogEntry, ItemState};
use core_runtime::logging::strip_path;
use core_sync::{job_status_id, Item, ItemStore, Priority, Scheduler, StatusBus, Task};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ImportError, Result};
use crate::job::{ImportJob, Instruction, InstructionKind, JobState};
use crate::ordering::{plan_moves, sibling_ids};

/// Page size of the destination collection listing.
const COLLECTION_PAGE_SIZE: usize = 100;

/// Processing bookkeeping of a confirmed job.
#[derive(Debug, Default)]
struct Progress {
    /// Nearest planned ancestor of each unit
    parents: HashMap<String, Option<String>>,
    /// Planned children of each unit, in source order
    children: HashMap<String, Vec<String>>,
    /// Children of a finished unit that are still being processed
    children_left: HashMap<String, usize>,
    /// Queued work not yet finished
    outstanding: usize,
    /// Instructions already executed, skipped when a unit is retried
    executed: HashSet<u32>,
    /// Pages uploaded whose title may still need restoring, by item id
    imported: HashMap<String, String>,
    failed: usize,
}

impl Progress {
    fn plan(job: &ImportJob) -> Self {
        let units: HashSet<&str> = job
            .instructions
            .iter()
            .map(|i| i.item_id.as_str())
            .collect();

        let mut progress = Progress::default();
        for item in job.items.iter().filter(|i| units.contains(i.id.as_str())) {
            let parent = item
                .ancestor_ids()
                .into_iter()
                .rev()
                .find(|id| units.contains(id))
                .map(String::from);

            if let Some(parent) = &parent {
                progress
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(item.id.clone());
            }
            progress.parents.insert(item.id.clone(), parent);
        }
        progress
    }

    fn roots(&self, job: &ImportJob) -> Vec<String> {
        job.items
            .iter()
            .filter(|item| matches!(self.parents.get(&item.id), Some(None)))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Every planned unit below `item_id`, at any depth.
    fn descendants(&self, item_id: &str) -> Vec<String> {
        let mut found = Vec::new();
        let mut stack = vec![item_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.children.get(&id) {
                found.extend(children.iter().cloned());
                stack.extend(children.iter().cloned());
            }
        }
        found
    }
}

struct JobEntry {
    job: ImportJob,
    progress: Progress,
}

struct ImporterInner {
    destination: Arc<dyn DestinationProvider>,
    store: Arc<ItemStore>,
    status: Arc<StatusBus>,
    file_system: Arc<dyn FileSystemAccess>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    settings: ImporterSettings,
    imports_dir: PathBuf,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

/// Cloneable handle to the destination importer.
#[derive(Clone)]
pub struct DestinationImporter {
    inner: Arc<ImporterInner>,
}

impl DestinationImporter {
    pub fn new(
        config: &MoverConfig,
        destination: Arc<dyn DestinationProvider>,
        store: Arc<ItemStore>,
        status: Arc<StatusBus>,
    ) -> Self {
        let scheduler = Scheduler::new(config.importer.scheduler, status.clone());

        Self {
            inner: Arc::new(ImporterInner {
                destination,
                store,
                status,
                file_system: config.file_system.clone(),
                clock: config.clock.clone(),
                scheduler,
                settings: config.importer,
                imports_dir: config.imports_dir(),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Create a job for `item_ids` and start validating it.
    ///
    /// Root docs of selected pages join the selection so every page has a
    /// collection to land in. Returns the job id right away; the plan is
    /// reported through the status bus.
    #[instrument(skip(self, item_ids), fields(selected = item_ids.len()))]
    pub async fn start(&self, item_ids: &[String]) -> Result<String> {
        let inner = &self.inner;
        let mut items: Vec<Item> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();

        for id in item_ids {
            if items.iter().any(|i| &i.id == id) {
                continue;
            }
            match inner.store.get(id).await {
                Some(item) => items.push(item),
                None => unknown.push(id.clone()),
            }
        }

        let roots: Vec<String> = items
            .iter()
            .map(|i| i.root_id().to_string())
            .filter(|root| !items.iter().any(|i| &i.id == root))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for root in roots {
            match inner.store.get(&root).await {
                Some(doc) => items.push(doc),
                None => unknown.push(root),
            }
        }

        let mut job = ImportJob::new(items, inner.clock.now());
        let job_id = job.id.clone();
        job.log(ImportLogEntry::info(format!(
            "Validating {} items",
            job.items.len()
        )));
        for id in &unknown {
            warn!(job_id = %job_id, item_id = %id, "Selected item is not indexed");
            job.log(ImportLogEntry::error(format!("Item {} is not indexed", id)));
        }

        inner.status.set(&job_status_id(&job_id), ItemState::Validating);
        inner.status.logs(&job_id, job.logs.clone());
        inner.jobs.lock().await.insert(
            job_id.clone(),
            JobEntry {
                job,
                progress: Progress::default(),
            },
        );

        inner.scheduler.add(ImporterInner::validate_task(inner, job_id.clone()))?;
        info!(job_id = %job_id, "Import job created");
        Ok(job_id)
    }

    /// Execute a validated plan.
    #[instrument(skip(self))]
    pub async fn confirm(&self, job_id: &str) -> Result<()> {
        let inner = &self.inner;
        let mut jobs = inner.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;

        entry.job.start_import()?;
        entry.progress = Progress::plan(&entry.job);
        entry.job.log(ImportLogEntry::info(format!(
            "Import confirmed, {} instructions",
            entry.job.instructions.len()
        )));
        inner.status.set(&job_status_id(job_id), ItemState::Importing);
        inner.status.logs(job_id, entry.job.logs.clone());

        let roots = entry.progress.roots(&entry.job);
        if roots.is_empty() {
            inner.finish(entry);
            return Ok(());
        }

        entry.progress.outstanding = roots.len();
        for root in roots {
            inner.scheduler.add(inner.unit_task(job_id, &root, Priority::High))?;
        }
        Ok(())
    }

    /// Discard a plan that is waiting for confirmation.
    #[instrument(skip(self))]
    pub async fn reject(&self, job_id: &str) -> Result<()> {
        let inner = &self.inner;
        let mut jobs = inner.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;

        if entry.job.state != JobState::Confirming {
            return Err(ImportError::InvalidStateTransition {
                from: entry.job.state.to_string(),
                to: JobState::Cancelled.to_string(),
                reason: "Only a plan awaiting confirmation can be rejected".to_string(),
            });
        }

        entry.job.cancel(inner.clock.now())?;
        entry.job.log(ImportLogEntry::info("Import rejected"));
        inner.close(entry, ItemState::Cancelled, "rejected");
        Ok(())
    }

    /// Stop a job in any non-terminal state. Units already running finish;
    /// queued ones are retired as cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let inner = &self.inner;
        let mut jobs = inner.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;

        entry.job.cancel(inner.clock.now())?;
        entry.job.log(ImportLogEntry::info("Import cancelled"));
        inner.close(entry, ItemState::Cancelled, "cancelled");
        Ok(())
    }

    /// Current copy of a job.
    pub async fn job(&self, job_id: &str) -> Option<ImportJob> {
        self.inner
            .jobs
            .lock()
            .await
            .get(job_id)
            .map(|entry| entry.job.clone())
    }

    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await;
    }

    pub async fn dispose(&self) {
        self.inner.scheduler.dispose().await;
    }
}

impl std::fmt::Debug for DestinationImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationImporter")
            .field("settings", &self.inner.settings)
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}

/// Destination copy predates the last local sync. A page that was never
/// synced has nothing newer to offer, so its destination copy stands.
fn is_outdated(
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    synced_at: Option<DateTime<Utc>>,
) -> bool {
    synced_at.is_some_and(|synced_at| created_at < synced_at || updated_at < synced_at)
}

/// Turn a panic in `work` into a handler error so the job's outstanding
/// count still settles.
async fn contain_panic<T>(label: String, work: impl Future<Output = Result<T>>) -> Result<T> {
    AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(ImportError::Handler(format!("{} panicked", label))))
}

impl ImporterInner {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========================================================================
    // Task constructors
    // ========================================================================

    fn validate_task(self: &Arc<Self>, job_id: String) -> Task {
        let inner = Arc::clone(self);
        let context = job_status_id(&job_id);
        Task::new(format!("validate:{}", job_id), Priority::Instant, move || {
            let inner = inner.clone();
            let job_id = job_id.clone();
            async move { inner.run_validation(&job_id).await }
        })
        .with_context(context)
    }

    fn unit_task(self: &Arc<Self>, job_id: &str, item_id: &str, priority: Priority) -> Task {
        let inner = Arc::clone(self);
        let (job, item) = (job_id.to_string(), item_id.to_string());
        Task::new(format!("import:{}:{}", job_id, item_id), priority, move || {
            let inner = inner.clone();
            let (job, item) = (job.clone(), item.clone());
            async move { inner.run_unit(&job, &item).await }
        })
        .with_context(item_id)
    }

    fn ordering_task(self: &Arc<Self>, job_id: &str, parent_id: &str) -> Task {
        let inner = Arc::clone(self);
        let (job, parent) = (job_id.to_string(), parent_id.to_string());
        Task::new(format!("order:{}:{}", job_id, parent_id), Priority::Low, move || {
            let inner = inner.clone();
            let (job, parent) = (job.clone(), parent.clone());
            async move { inner.run_ordering(&job, &parent).await }
        })
        .with_context(parent_id)
    }

    fn moves_task(self: &Arc<Self>, job_id: &str, parent_id: &str, instructions: Vec<u32>) -> Task {
        let inner = Arc::clone(self);
        let job = job_id.to_string();
        Task::new(format!("move:{}:{}", job_id, parent_id), Priority::Idle, move || {
            let inner = inner.clone();
            let job = job.clone();
            let instructions = instructions.clone();
            async move { inner.run_moves(&job, &instructions).await }
        })
        .with_context(parent_id)
    }

    fn schedule_audit(self: &Arc<Self>, job: ImportJob) {
        let inner = Arc::clone(self);
        let task = Task::new(format!("audit:{}", job.id), Priority::Idle, move || {
            let inner = inner.clone();
            let job = job.clone();
            async move {
                let path = inner.imports_dir.join(job.audit_file_name());
                let data = serde_json::to_vec_pretty(&job)?;
                inner.file_system.write_file(&path, Bytes::from(data)).await?;
                info!(
                    job_id = %job.id,
                    file = %strip_path(&path.to_string_lossy()),
                    "Import audit saved"
                );
                Ok::<(), core_sync::SyncError>(())
            }
        });

        if self.scheduler.add(task).is_err() {
            debug!("Scheduler closed, audit skipped");
        }
    }

    // ========================================================================
    // Job bookkeeping
    // ========================================================================

    fn emit_logs(&self, job: &ImportJob) {
        self.status.logs(&job.id, job.logs.clone());
    }

    /// Mark a finished import done and persist its audit snapshot.
    fn finish(self: &Arc<Self>, entry: &mut JobEntry) {
        if entry.job.finish(self.now()).is_err() {
            return;
        }

        let failed = entry.progress.failed;
        let message = if failed == 0 {
            entry.job.log(ImportLogEntry::success("Import finished"));
            "finished".to_string()
        } else {
            entry.job.log(ImportLogEntry::error(format!(
                "Import finished with {} failed items",
                failed
            )));
            format!("{} failed", failed)
        };

        info!(job_id = %entry.job.id, failed, "Import job done");
        self.close(entry, ItemState::Done, message);
    }

    /// Report a terminal job state and write the audit snapshot.
    fn close(self: &Arc<Self>, entry: &JobEntry, state: ItemState, message: impl Into<String>) {
        self.status
            .set_with_message(&job_status_id(&entry.job.id), state, message);
        self.emit_logs(&entry.job);
        self.schedule_audit(entry.job.clone());
    }

    /// One piece of outstanding work is over.
    fn settle(self: &Arc<Self>, entry: &mut JobEntry) {
        entry.progress.outstanding = entry.progress.outstanding.saturating_sub(1);
        if entry.progress.outstanding == 0 && entry.job.state == JobState::Importing {
            self.finish(entry);
        }
    }

    // ========================================================================
    // Validate
    // ========================================================================

    async fn run_validation(self: &Arc<Self>, job_id: &str) -> core_sync::Result<()> {
        match self.validate(job_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_rate_limited() => Err(e.into_sync()),
            Err(e) => {
                error!(job_id, error = %e, "Validation failed");
                let mut jobs = self.jobs.lock().await;
                if let Some(entry) = jobs.get_mut(job_id) {
                    if entry.job.fail(self.now()).is_ok() {
                        entry
                            .job
                            .log(ImportLogEntry::error(format!("Validation failed: {}", e)));
                        self.close(entry, ItemState::Error, e.to_string());
                    }
                }
                Ok(())
            }
        }
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let mut collections = Vec::new();
        loop {
            let page = self.destination.list_collections(collections.len()).await?;
            let last = page.len() < COLLECTION_PAGE_SIZE;
            collections.extend(page);
            if last {
                break;
            }
        }
        debug!(count = collections.len(), "Listed destination collections");
        Ok(collections)
    }

    #[instrument(skip(self))]
    async fn validate(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let mut draft = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
            if entry.job.state != JobState::Validating {
                return Ok(());
            }
            let mut draft = entry.job.clone();
            draft.reset_plan();
            draft
        };

        let collections = self.list_collections().await?;
        let items = draft.items.clone();

        for doc in items.iter().filter(|i| i.is_doc()) {
            match collections.iter().find(|c| c.name == doc.name) {
                None => {
                    draft.push(Instruction::new(
                        InstructionKind::CreateCollectionAsPrivate,
                        &doc.id,
                    ));
                }
                Some(collection) => {
                    if !collection.is_private() {
                        draft.issue(format!("Collection {} exists and not private", doc.name));
                    }
                    draft.map_id(&doc.id, &collection.id);
                    draft.push(
                        Instruction::new(InstructionKind::Skip, &doc.id)
                            .with_collection(&collection.id)
                            .with_reason("collection exists"),
                    );
                }
            }
        }

        let mut excluded: HashSet<String> = HashSet::new();
        for page in items.iter().filter(|i| !i.is_doc()) {
            if let Some(ancestor) = page
                .ancestor_ids()
                .into_iter()
                .find(|id| excluded.contains(*id))
            {
                draft.issue(format!(
                    "Page {} ({}) skipped, parent {} cannot be imported",
                    page.name, page.id, ancestor
                ));
                excluded.insert(page.id.clone());
                continue;
            }

            let Some(path) = page.file_path.as_deref() else {
                draft.issue(format!("Page {} ({}) missing file", page.name, page.id));
                excluded.insert(page.id.clone());
                continue;
            };
            if !self.file_system.exists(path).await? {
                draft.issue(format!("Page {} ({}) missing file", page.name, page.id));
                excluded.insert(page.id.clone());
                continue;
            }

            if self.settings.enhanced {
                let size = self.file_system.metadata(path).await?.size;
                if size > self.settings.max_upload_bytes {
                    draft.issue(format!(
                        "Page {} ({}) is {} bytes, above the {} byte upload limit",
                        page.name, page.id, size, self.settings.max_upload_bytes
                    ));
                    excluded.insert(page.id.clone());
                    continue;
                }
            }

            let Some(collection_id) = draft.destination_id(page.root_id()).map(String::from)
            else {
                draft.push(Instruction::new(InstructionKind::ImportAndPublishPage, &page.id));
                continue;
            };

            let existing = self
                .destination
                .search_documents(&collection_id, &page.name)
                .await?
                .into_iter()
                .find(|d| d.title == page.name);

            match existing {
                None => {
                    draft.push(Instruction::new(InstructionKind::ImportAndPublishPage, &page.id));
                }
                Some(document) if is_outdated(document.created_at, document.updated_at, page.synced_at) => {
                    draft.push(
                        Instruction::new(InstructionKind::ArchiveOutdatedPage, &page.id)
                            .with_document(&document.id)
                            .with_collection(&collection_id),
                    );
                    draft.push(Instruction::new(InstructionKind::ImportAndPublishPage, &page.id));
                    draft.issue(format!(
                        "Document {} ({}) is outdated and will be archived",
                        document.title, document.id
                    ));
                }
                Some(document) => {
                    draft.map_id(&page.id, &document.id);
                    draft.push(
                        Instruction::new(InstructionKind::Skip, &page.id)
                            .with_document(&document.id)
                            .with_reason("document up to date"),
                    );
                }
            }
        }

        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
        if entry.job.state != JobState::Validating {
            debug!(job_id, state = %entry.job.state, "Job left validation, plan dropped");
            return Ok(());
        }

        let job = &mut entry.job;
        job.issues = draft.issues;
        job.instructions = draft.instructions;
        job.item_id_map = draft.item_id_map;
        job.log(ImportLogEntry::info(format!(
            "Validation finished: {} instructions, {} issues",
            job.instructions.len(),
            job.issues.len()
        )));
        job.await_confirmation()?;

        info!(
            job_id,
            instructions = job.instructions.len(),
            issues = job.issues.len(),
            "Import plan ready"
        );
        self.status.set(&job_status_id(job_id), ItemState::Confirming);
        self.status.issues(job_id, job.issues.clone());
        self.emit_logs(job);
        Ok(())
    }

    // ========================================================================
    // Process
    // ========================================================================

    async fn run_unit(self: &Arc<Self>, job_id: &str, item_id: &str) -> core_sync::Result<()> {
        let cancelled = {
            let jobs = self.jobs.lock().await;
            jobs.get(job_id)
                .map_or(true, |entry| entry.job.state != JobState::Importing)
        };
        if cancelled {
            self.status.set(item_id, ItemState::Cancelled);
            self.unit_finished(job_id, item_id, None).await;
            return Ok(());
        }

        let outcome = contain_panic(
            format!("import of {}", item_id),
            self.execute_unit(job_id, item_id),
        )
        .await;
        match outcome {
            Ok(state) => {
                self.status.set(item_id, state);
                self.unit_finished(job_id, item_id, Some(Ok(()))).await;
                Ok(())
            }
            Err(e) if e.is_rate_limited() => Err(e.into_sync()),
            Err(e) => {
                error!(job_id, item_id, error = %e, "Import unit failed");
                self.status
                    .set_with_message(item_id, ItemState::Error, e.to_string());
                self.unit_finished(job_id, item_id, Some(Err(e))).await;
                Ok(())
            }
        }
    }

    /// Run the not-yet-executed instructions of one item in order.
    async fn execute_unit(&self, job_id: &str, item_id: &str) -> Result<ItemState> {
        let (item, instructions) = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
            let item = entry
                .job
                .item(item_id)
                .cloned()
                .ok_or_else(|| ImportError::Handler(format!("Item {} is not part of the job", item_id)))?;
            let instructions: Vec<Instruction> = entry
                .job
                .instructions_for(item_id)
                .into_iter()
                .filter(|i| !entry.progress.executed.contains(&i.id))
                .collect();
            (item, instructions)
        };

        let mut outcome = ItemState::Skipped;
        for instruction in instructions {
            let (state, message) = self.dispatch(job_id, &item, &instruction).await?;
            if state != ItemState::Skipped {
                outcome = state;
            }

            let mut jobs = self.jobs.lock().await;
            if let Some(entry) = jobs.get_mut(job_id) {
                entry.progress.executed.insert(instruction.id);
                let entry_log = match state {
                    ItemState::Skipped => ImportLogEntry::info(message),
                    _ => ImportLogEntry::success(message),
                };
                entry.job.log(entry_log);
                self.emit_logs(&entry.job);
            }
        }
        Ok(outcome)
    }

    /// Bookkeeping after a unit ends. `None` means it was cancelled.
    async fn unit_finished(self: &Arc<Self>, job_id: &str, item_id: &str, outcome: Option<Result<()>>) {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };

        match outcome {
            Some(Ok(())) => {
                let children = entry
                    .progress
                    .children
                    .get(item_id)
                    .cloned()
                    .unwrap_or_default();
                if !children.is_empty() {
                    entry
                        .progress
                        .children_left
                        .insert(item_id.to_string(), children.len());
                }
                for child in children {
                    if self
                        .scheduler
                        .add(self.unit_task(job_id, &child, Priority::Normal))
                        .is_ok()
                    {
                        entry.progress.outstanding += 1;
                    }
                }
            }
            Some(Err(e)) => {
                entry.progress.failed += 1;
                let name = entry
                    .job
                    .item(item_id)
                    .map_or_else(|| item_id.to_string(), |i| i.name.clone());
                entry
                    .job
                    .log(ImportLogEntry::error(format!("{}: {}", name, e)));

                for descendant in entry.progress.descendants(item_id) {
                    entry.progress.failed += 1;
                    self.status.set_with_message(
                        &descendant,
                        ItemState::Error,
                        format!("ancestor {} failed", name),
                    );
                }
                self.emit_logs(&entry.job);
            }
            None => {
                for descendant in entry.progress.descendants(item_id) {
                    self.status.set(&descendant, ItemState::Cancelled);
                }
            }
        }

        let parent = entry.progress.parents.get(item_id).cloned().flatten();
        if let Some(parent) = parent {
            if let Some(left) = entry.progress.children_left.get_mut(&parent) {
                *left = left.saturating_sub(1);
                if *left == 0
                    && self.settings.enhanced
                    && entry.job.state == JobState::Importing
                    && self
                        .scheduler
                        .add(self.ordering_task(job_id, &parent))
                        .is_ok()
                {
                    entry.progress.outstanding += 1;
                }
            }
        }

        self.settle(entry);
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Dispatch table: instruction kind → handler.
    ///
    /// Returns the item state reached and a log line.
    async fn dispatch(
        &self,
        job_id: &str,
        item: &Item,
        instruction: &Instruction,
    ) -> Result<(ItemState, String)> {
        debug!(job_id, item_id = %item.id, kind = %instruction.kind, "Executing instruction");
        match instruction.kind {
            InstructionKind::CreateCollectionAsPrivate => {
                self.create_collection_as_private(job_id, item).await
            }
            InstructionKind::ArchiveOutdatedPage => self.archive_outdated_page(item, instruction).await,
            InstructionKind::ImportAndPublishPage => self.import_and_publish_page(job_id, item).await,
            InstructionKind::Skip => Ok(self.skip(item, instruction)),
            InstructionKind::MoveDocument => self.move_document(item, instruction).await,
        }
    }

    async fn create_collection_as_private(&self, job_id: &str, doc: &Item) -> Result<(ItemState, String)> {
        self.status.set(&doc.id, ItemState::Importing);
        let collection = self
            .destination
            .create_collection(CreateCollection {
                name: doc.name.clone(),
                private: true,
            })
            .await?;

        self.record_mapping(job_id, &doc.id, &collection.id).await;
        info!(item_id = %doc.id, collection_id = %collection.id, "Created private collection");
        Ok((
            ItemState::Done,
            format!("Created private collection {}", doc.name),
        ))
    }

    async fn archive_outdated_page(&self, page: &Item, instruction: &Instruction) -> Result<(ItemState, String)> {
        let document_id = instruction.document_id.as_deref().ok_or_else(|| {
            ImportError::Handler(format!("No destination document to archive for {}", page.name))
        })?;

        self.status.set(&page.id, ItemState::Archiving);
        self.destination.archive_document(document_id).await?;

        info!(item_id = %page.id, document_id, "Archived outdated document");
        Ok((
            ItemState::Done,
            format!("Archived outdated document {} ({})", page.name, document_id),
        ))
    }

    async fn import_and_publish_page(&self, job_id: &str, page: &Item) -> Result<(ItemState, String)> {
        let (collection_id, parent_document_id, uploaded) = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;

            let collection_id = entry
                .job
                .destination_id(page.root_id())
                .map(String::from)
                .ok_or_else(|| {
                    ImportError::Handler(format!("No destination collection for {}", page.name))
                })?;

            let parent = entry.progress.parents.get(&page.id).cloned().flatten();
            let parent_document_id = match parent {
                Some(parent) if parent != page.root_id() => Some(
                    entry
                        .job
                        .destination_id(&parent)
                        .map(String::from)
                        .ok_or_else(|| {
                            ImportError::Handler(format!(
                                "Parent {} of {} has no destination document",
                                parent, page.name
                            ))
                        })?,
                ),
                _ => None,
            };
            let uploaded = entry.progress.imported.get(&page.id).cloned();
            (collection_id, parent_document_id, uploaded)
        };

        let path = page
            .file_path
            .as_deref()
            .ok_or_else(|| ImportError::Handler(format!("Page {} has no local file", page.name)))?;

        self.status.set(&page.id, ItemState::Importing);
        let (document_id, needs_title) = match uploaded {
            // A retry after the upload went through only restores the title.
            Some(document_id) => (document_id, true),
            None => {
                let document = self
                    .destination
                    .import_document_by_file(&collection_id, path, parent_document_id.as_deref())
                    .await?;
                self.record_upload(job_id, &page.id, &document.id).await;
                let needs_title = document.title != page.name;
                if needs_title {
                    debug!(item_id = %page.id, generated = %document.title, "Restoring source title");
                }
                (document.id, needs_title)
            }
        };

        let document_id = if needs_title {
            let document = self
                .destination
                .update_document(UpdateDocument {
                    id: document_id,
                    title: page.name.clone(),
                })
                .await?;
            document.id
        } else {
            document_id
        };

        self.record_mapping(job_id, &page.id, &document_id).await;
        info!(
            item_id = %page.id,
            document_id = %document_id,
            file = %strip_path(&path.to_string_lossy()),
            "Imported page"
        );
        Ok((ItemState::Done, format!("Imported {}", page.name)))
    }

    fn skip(&self, item: &Item, instruction: &Instruction) -> (ItemState, String) {
        let reason = instruction.reason.as_deref().unwrap_or("nothing to do");
        (ItemState::Skipped, format!("Skipped {}: {}", item.name, reason))
    }

    async fn move_document(&self, item: &Item, instruction: &Instruction) -> Result<(ItemState, String)> {
        let (Some(id), Some(collection_id), Some(index)) = (
            instruction.document_id.clone(),
            instruction.collection_id.clone(),
            instruction.index,
        ) else {
            return Err(ImportError::Handler(format!(
                "Incomplete move instruction {}",
                instruction.id
            )));
        };

        self.destination
            .move_document(MoveDocument {
                id,
                collection_id,
                parent_document_id: instruction.parent_document_id.clone(),
                index,
            })
            .await?;

        Ok((
            ItemState::Done,
            format!("Moved {} to position {}", item.name, index),
        ))
    }

    /// Remember an uploaded page before anything else can fail, so a retried
    /// unit never uploads it twice.
    async fn record_upload(&self, job_id: &str, item_id: &str, document_id: &str) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.job.map_id(item_id, document_id);
            entry
                .progress
                .imported
                .insert(item_id.to_string(), document_id.to_string());
        }
    }

    async fn record_mapping(&self, job_id: &str, item_id: &str, destination_id: &str) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.job.map_id(item_id, destination_id);
        }
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    async fn run_ordering(self: &Arc<Self>, job_id: &str, parent_id: &str) -> core_sync::Result<()> {
        let outcome = contain_panic(
            format!("ordering below {}", parent_id),
            self.reorder_children(job_id, parent_id),
        )
        .await;
        match outcome {
            Ok(()) => {}
            Err(e) if e.is_rate_limited() => return Err(e.into_sync()),
            Err(e) => {
                warn!(job_id, parent_id, error = %e, "Could not check sibling order");
                self.log_error(job_id, format!("Ordering below {} failed: {}", parent_id, e))
                    .await;
            }
        }

        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            self.settle(entry);
        }
        Ok(())
    }

    /// Compare the destination order of `parent_id`'s children with the
    /// source order and queue the moves that fix it.
    async fn reorder_children(self: &Arc<Self>, job_id: &str, parent_id: &str) -> Result<()> {
        let (collection_id, parent_document_id, desired) = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| ImportError::JobNotFound(job_id.to_string()))?;
            if entry.job.state != JobState::Importing {
                return Ok(());
            }
            let job = &entry.job;
            let parent = job
                .item(parent_id)
                .ok_or_else(|| ImportError::Handler(format!("Unknown parent {}", parent_id)))?;

            let collection_id = job
                .destination_id(parent.root_id())
                .map(String::from)
                .ok_or_else(|| ImportError::Handler(format!("No collection for {}", parent.name)))?;
            let parent_document_id = if parent.is_doc() {
                None
            } else {
                job.destination_id(parent_id).map(String::from)
            };

            let mut children: Vec<&Item> = entry
                .progress
                .children
                .get(parent_id)
                .map(|ids| ids.iter().filter_map(|id| job.item(id)).collect())
                .unwrap_or_default();
            children.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));

            // Pages matched to the same destination document are ordered once.
            let mut seen = HashSet::new();
            let desired: Vec<(String, String)> = children
                .into_iter()
                .filter_map(|child| {
                    job.destination_id(&child.id)
                        .map(|dest| (dest.to_string(), child.id.clone()))
                })
                .filter(|(dest, _)| seen.insert(dest.clone()))
                .collect();
            (collection_id, parent_document_id, desired)
        };

        if desired.len() < 2 {
            return Ok(());
        }

        let tree = self.destination.get_collection_tree(&collection_id).await?;
        let siblings = sibling_ids(&tree, parent_document_id.as_deref());
        let order: Vec<String> = desired.iter().map(|(dest, _)| dest.clone()).collect();
        let moves = plan_moves(&order, &siblings);
        if moves.is_empty() {
            debug!(job_id, parent_id, "Sibling order matches source");
            return Ok(());
        }

        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return Ok(());
        };

        let mut ids = Vec::with_capacity(moves.len());
        for m in moves {
            let item_id = desired
                .iter()
                .find(|(dest, _)| *dest == m.document_id)
                .map(|(_, item)| item.clone())
                .unwrap_or_else(|| m.document_id.clone());
            ids.push(
                entry.job.push(
                    Instruction::new(InstructionKind::MoveDocument, item_id)
                        .with_document(m.document_id)
                        .with_collection(&collection_id)
                        .with_reason("restore source order")
                        .moved_to(parent_document_id.clone(), m.index),
                ),
            );
        }

        info!(job_id, parent_id, moves = ids.len(), "Queued sibling moves");
        if self
            .scheduler
            .add(self.moves_task(job_id, parent_id, ids))
            .is_ok()
        {
            entry.progress.outstanding += 1;
        }
        Ok(())
    }

    /// Moves depend on each other's indices, so one task runs them in order.
    async fn run_moves(self: &Arc<Self>, job_id: &str, instruction_ids: &[u32]) -> core_sync::Result<()> {
        for instruction_id in instruction_ids {
            let next = {
                let jobs = self.jobs.lock().await;
                jobs.get(job_id).and_then(|entry| {
                    if entry.progress.executed.contains(instruction_id) {
                        return None;
                    }
                    let instruction = entry
                        .job
                        .instructions
                        .iter()
                        .find(|i| i.id == *instruction_id)?
                        .clone();
                    let item = entry.job.item(&instruction.item_id)?.clone();
                    Some((instruction, item))
                })
            };
            let Some((instruction, item)) = next else {
                continue;
            };

            match self.dispatch(job_id, &item, &instruction).await {
                Ok((_, message)) => {
                    let mut jobs = self.jobs.lock().await;
                    if let Some(entry) = jobs.get_mut(job_id) {
                        entry.progress.executed.insert(instruction.id);
                        entry.job.log(ImportLogEntry::success(message));
                        self.emit_logs(&entry.job);
                    }
                }
                Err(e) if e.is_rate_limited() => return Err(e.into_sync()),
                Err(e) => {
                    warn!(job_id, item_id = %item.id, error = %e, "Move failed");
                    self.log_error(job_id, format!("Moving {} failed: {}", item.name, e))
                        .await;
                    break;
                }
            }
        }

        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            self.settle(entry);
        }
        Ok(())
    }

    async fn log_error(&self, job_id: &str, message: String) {
        if let Some(entry) = self.jobs.lock().await.get_mut(job_id) {
            entry.job.log(ImportLogEntry::error(message));
            self.emit_logs(&entry.job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_destination_older_than_sync_is_outdated() {
        assert!(is_outdated(at(1), at(2), Some(at(3))));
        assert!(is_outdated(at(1), at(5), Some(at(3))));
        assert!(!is_outdated(at(4), at(5), Some(at(3))));
    }

    #[test]
    fn test_never_synced_page_is_not_outdated() {
        assert!(!is_outdated(at(1), at(2), None));
    }
}
