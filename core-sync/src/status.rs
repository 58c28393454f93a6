//! # Status Bus
//!
//! Coalesces per-item status updates and forwards them to the UI as
//! [`ServerEvent`]s.
//!
//! Updates are kept in a map keyed by id (last write wins) and flushed as a
//! single `ItemStatuses` batch. Transient states are dropped at flush time;
//! errors are always forwarded. Listing batches, issues and logs bypass
//! coalescing and are emitted immediately.

use core_runtime::events::{
    EventBus, ImportLogEntry, ItemPayload, ItemState, ServerEvent, StatusPayload,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::SyncError;
use crate::scheduler::SchedulerObserver;

/// Status id used for the doc listing request.
pub const SYNC_DOCS_STATUS_ID: &str = "sync docs";

/// Status id of an import job.
pub fn job_status_id(job_id: &str) -> String {
    format!("import:{}", job_id)
}

#[derive(Default)]
struct Buffers {
    pending: HashMap<String, StatusPayload>,
    latest: HashMap<String, StatusPayload>,
}

pub struct StatusBus {
    events: EventBus,
    buffers: Mutex<Buffers>,
}

impl StatusBus {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn set(&self, id: &str, status: ItemState) {
        self.report(StatusPayload::new(id, status));
    }

    pub fn set_with_message(&self, id: &str, status: ItemState, message: impl Into<String>) {
        self.report(StatusPayload::new(id, status).with_message(message));
    }

    pub fn report(&self, payload: StatusPayload) {
        match &payload.message {
            Some(message) if payload.status == ItemState::Error => {
                error!(item_id = %payload.id, %message, "Item failed")
            }
            Some(message) => {
                info!(item_id = %payload.id, status = %payload.status, %message, "Item status")
            }
            None => info!(item_id = %payload.id, status = %payload.status, "Item status"),
        }

        let mut buffers = self.buffers();
        buffers
            .latest
            .insert(payload.id.clone(), payload.clone());
        buffers.pending.insert(payload.id.clone(), payload);
    }

    /// Most recent status reported for `id`, transient or not.
    pub fn status_of(&self, id: &str) -> Option<StatusPayload> {
        self.buffers().latest.get(id).cloned()
    }

    /// Forward coalesced updates, minus transient states.
    ///
    /// Returns the number of forwarded statuses.
    pub fn flush(&self) -> usize {
        let mut statuses: Vec<StatusPayload> = {
            let mut buffers = self.buffers();
            buffers
                .pending
                .drain()
                .map(|(_, payload)| payload)
                .filter(|payload| !payload.status.is_transient())
                .collect()
        };

        if statuses.is_empty() {
            return 0;
        }

        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        let count = statuses.len();
        self.emit(ServerEvent::ItemStatuses { statuses });
        count
    }

    /// Flush on a fixed interval until the returned handle is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                bus.flush();
            }
        })
    }

    pub fn docs(&self, docs: Vec<ItemPayload>) {
        if !docs.is_empty() {
            self.emit(ServerEvent::DocsBatch { docs });
        }
    }

    pub fn pages(&self, pages: Vec<ItemPayload>) {
        if !pages.is_empty() {
            self.emit(ServerEvent::PagesBatch { pages });
        }
    }

    pub fn issues(&self, job_id: &str, issues: Vec<String>) {
        self.emit(ServerEvent::ImportIssues {
            job_id: job_id.to_string(),
            issues,
        });
    }

    pub fn logs(&self, job_id: &str, logs: Vec<ImportLogEntry>) {
        self.emit(ServerEvent::ImportLogs {
            job_id: job_id.to_string(),
            logs,
        });
    }

    fn emit(&self, event: ServerEvent) {
        if self.events.emit(event).is_err() {
            debug!("No status subscribers");
        }
    }
}

impl SchedulerObserver for StatusBus {
    fn on_error(&self, _task_id: &str, context: &str, error: &SyncError) {
        self.set_with_message(context, ItemState::Error, error.to_string());
    }

    fn on_retry(&self, _task_id: &str, context: &str) {
        self.set_with_message(context, ItemState::Retrying, "rate limited");
    }
}

impl std::fmt::Debug for StatusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBus")
            .field("pending", &self.buffers().pending.len())
            .finish()
    }
}
