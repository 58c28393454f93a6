use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Parent {parent_id} of item {item_id} is not indexed")]
    MissingParent { item_id: String, parent_id: String },

    #[error("Item {0} not found")]
    ItemNotFound(String),

    #[error("Invalid tree path {tree_path:?} for item {item_id}")]
    InvalidTreePath { item_id: String, tree_path: String },

    #[error("Export {export_id} of page {page_id} failed")]
    ExportFailed { page_id: String, export_id: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Scheduler is closed")]
    SchedulerClosed,

    #[error("Task {0} panicked")]
    TaskPanicked(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Remote 429s are retried at lowered priority instead of failing the item.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::Bridge(e) if e.is_rate_limited())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
