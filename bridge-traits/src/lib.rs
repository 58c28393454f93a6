//! # Host Bridge Traits
//!
//! Capability traits the migration engine depends on but does not implement.
//!
//! ## Overview
//!
//! The engine (puller, importer, scheduler) only talks to the outside world
//! through these traits. Desktop implementations live in `bridge-desktop`;
//! the vendor REST bindings live in `provider-coda` and `provider-outline`.
//!
//! ## Traits
//!
//! ### Networking & I/O
//! - [`HttpClient`](http::HttpClient) - Async HTTP with JSON and multipart bodies
//! - [`FileSystemAccess`](storage::FileSystemAccess) - Local mirror and snapshot I/O
//!
//! ### Remote platforms
//! - [`SourceProvider`](source::SourceProvider) - Doc/page listing and export
//! - [`DestinationProvider`](destination::DestinationProvider) - Collections, documents, users
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations should:
//!
//! - Map HTTP 429 to `BridgeError::RateLimited` so the scheduler can demote the task
//! - Map HTTP 404 to `BridgeError::NotFound` unless the operation defines a sentinel
//! - Include context (ids, paths) in messages
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so implementations can be shared
//! across scheduler tasks behind an `Arc`.

pub mod destination;
pub mod error;
pub mod http;
pub mod source;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use destination::{
    Collection, CreateCollection, CreateDocument, DestinationProvider, Document, DocumentNode,
    MoveDocument, UpdateDocument, User,
};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartPart, RetryPolicy};
pub use source::{
    ExportFormat, ExportJob, ExportStatus, Listing, PageExport, SourceDoc, SourcePage,
    SourceProvider,
};
pub use storage::{FileMetadata, FileSystemAccess};
pub use time::{Clock, ConsoleLogger, FixedClock, LogEntry, LogLevel, LoggerSink, SystemClock};
