//! # Source Sync Engine
//!
//! Mirrors the source document hierarchy onto the local file system.
//!
//! ## Components
//!
//! - **Scheduler** (`scheduler`): Priority-ordered, concurrency-bounded task
//!   runner with rate-limit demotion; shared with the importer
//! - **Item Store** (`item_store`): Id-keyed index of docs and pages that
//!   enforces the tree-path invariant and persists to a JSON snapshot
//! - **Status Bus** (`status`): Coalesces per-item statuses and forwards them,
//!   with listing batches, issues and logs, to the UI event bus
//! - **Content** (`content`): Image re-alignment and mention rewriting for
//!   markdown exports
//! - **Source Puller** (`puller`): Lists docs and pages, revalidates renamed
//!   folders and exports stale canvas pages

pub mod content;
pub mod error;
pub mod item;
pub mod item_store;
pub mod puller;
pub mod scheduler;
pub mod status;

pub use error::{Result, SyncError};
pub use item::{Item, ItemKind, ROOT_TREE_PATH};
pub use item_store::ItemStore;
pub use puller::SourcePuller;
pub use scheduler::{Priority, Scheduler, SchedulerObserver, Task};
pub use status::{job_status_id, StatusBus, SYNC_DOCS_STATUS_ID};
