//! # Message Protocol and Event Bus
//!
//! Closed, typed protocol between the migration engine and its UI collaborator,
//! carried over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **[`ClientRequest`]**: everything the UI can ask of the engine
//! - **[`ServerEvent`]**: everything the engine streams back
//! - **[`EventBus`]**: broadcast channel for `ServerEvent`s
//! - **[`EventStream`]**: receiver wrapper with optional filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     emit      ┌───────────┐
//! │   Puller    ├──────────────>│           │
//! └─────────────┘               │ EventBus  │     subscribe    ┌────────────┐
//! ┌─────────────┐     emit      │ (broadcast├─────────────────>│ UI bridge  │
//! │ Status Bus  ├──────────────>│  channel) │                  └────────────┘
//! └─────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, ServerEvent, ItemState, StatusPayload};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(ServerEvent::ItemStatuses {
//!     statuses: vec![StatusPayload::new("doc-1", ItemState::Done)],
//! })
//! .ok();
//!
//! let event = rx.recv().await.unwrap();
//! assert_eq!(event.description(), "Item statuses");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: subscriber missed `n` events; it can keep receiving.
//! - **`RecvError::Closed`**: every sender was dropped; treat as shutdown.
//!
//! Emitting with no subscribers returns `Err`; producers ignore it with `.ok()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Client Requests
// ============================================================================

/// Requests accepted from the UI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Start (or restart) a source sync with the given source API token.
    #[serde(rename_all = "camelCase")]
    ListDocs {
        token: String,
        /// Enables mention rewriting during export
        #[serde(default)]
        destination_token: Option<String>,
    },
    /// Validate a migration of the selected items into the destination.
    #[serde(rename_all = "camelCase")]
    Import { token: String, item_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ImportConfirm { job_id: String },
    #[serde(rename_all = "camelCase")]
    ImportReject { job_id: String },
    #[serde(rename_all = "camelCase")]
    ImportCancel { job_id: String },
}

impl ClientRequest {
    /// Parse a raw JSON message from the UI collaborator.
    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::ListDocs { .. } => "listDocs",
            ClientRequest::Import { .. } => "import",
            ClientRequest::ImportConfirm { .. } => "importConfirm",
            ClientRequest::ImportReject { .. } => "importReject",
            ClientRequest::ImportCancel { .. } => "importCancel",
        }
    }
}

// ============================================================================
// Item States
// ============================================================================

/// Per-item lifecycle state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "listing")]
    Listing,
    #[serde(rename = "saving")]
    Saving,
    #[serde(rename = "exporting")]
    Exporting,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "fetching images")]
    FetchingImages,
    #[serde(rename = "downloading images")]
    DownloadingImages,
    #[serde(rename = "replacing images")]
    ReplacingImages,
    #[serde(rename = "validating")]
    Validating,
    #[serde(rename = "confirming")]
    Confirming,
    #[serde(rename = "importing")]
    Importing,
    #[serde(rename = "archiving")]
    Archiving,
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "skipped")]
    Skipped,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Listing => "listing",
            ItemState::Saving => "saving",
            ItemState::Exporting => "exporting",
            ItemState::Downloading => "downloading",
            ItemState::FetchingImages => "fetching images",
            ItemState::DownloadingImages => "downloading images",
            ItemState::ReplacingImages => "replacing images",
            ItemState::Validating => "validating",
            ItemState::Confirming => "confirming",
            ItemState::Importing => "importing",
            ItemState::Archiving => "archiving",
            ItemState::Waiting => "waiting",
            ItemState::Retrying => "retrying",
            ItemState::Skipped => "skipped",
            ItemState::Done => "done",
            ItemState::Error => "error",
            ItemState::Cancelled => "cancelled",
        }
    }

    /// High-churn states that are recorded but never forwarded to the UI.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ItemState::Pending | ItemState::Exporting | ItemState::Downloading
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Done | ItemState::Error | ItemState::Skipped | ItemState::Cancelled
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ItemState; 18] = [
            ItemState::Pending,
            ItemState::Listing,
            ItemState::Saving,
            ItemState::Exporting,
            ItemState::Downloading,
            ItemState::FetchingImages,
            ItemState::DownloadingImages,
            ItemState::ReplacingImages,
            ItemState::Validating,
            ItemState::Confirming,
            ItemState::Importing,
            ItemState::Archiving,
            ItemState::Waiting,
            ItemState::Retrying,
            ItemState::Skipped,
            ItemState::Done,
            ItemState::Error,
            ItemState::Cancelled,
        ];
        ALL.into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid item state: {}", s))
    }
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKindTag {
    Doc,
    Page,
}

/// Item as displayed in the UI tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    pub id: String,
    pub name: String,
    pub kind: ItemKindTag,
    pub tree_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    pub exportable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub id: String,
    pub status: ItemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusPayload {
    pub fn new(id: impl Into<String>, status: ItemState) -> Self {
        Self {
            id: id.into(),
            status,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportLogLevel {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportLogEntry {
    pub level: ImportLogLevel,
    pub message: String,
}

impl ImportLogEntry {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: ImportLogLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: ImportLogLevel::Error,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: ImportLogLevel::Info,
            message: message.into(),
        }
    }
}

// ============================================================================
// Server Events
// ============================================================================

/// Events streamed from the engine to the UI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Root docs from one listing page.
    DocsBatch { docs: Vec<ItemPayload> },
    /// Pages, either freshly listed or restored from the snapshot.
    PagesBatch { pages: Vec<ItemPayload> },
    /// Coalesced status changes since the previous flush.
    ItemStatuses { statuses: Vec<StatusPayload> },
    /// Full ordered issue list of an import job.
    #[serde(rename_all = "camelCase")]
    ImportIssues { job_id: String, issues: Vec<String> },
    /// Full ordered log of an import job.
    #[serde(rename_all = "camelCase")]
    ImportLogs {
        job_id: String,
        logs: Vec<ImportLogEntry>,
    },
}

impl ServerEvent {
    pub fn description(&self) -> &str {
        match self {
            ServerEvent::DocsBatch { .. } => "Docs listed",
            ServerEvent::PagesBatch { .. } => "Pages listed",
            ServerEvent::ItemStatuses { .. } => "Item statuses",
            ServerEvent::ImportIssues { .. } => "Import issues",
            ServerEvent::ImportLogs { .. } => "Import logs",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            ServerEvent::ItemStatuses { statuses }
                if statuses.iter().any(|s| s.status == ItemState::Error) =>
            {
                EventSeverity::Error
            }
            ServerEvent::ImportLogs { logs, .. }
                if logs.iter().any(|l| l.level == ImportLogLevel::Error) =>
            {
                EventSeverity::Error
            }
            ServerEvent::ImportIssues { issues, .. } if !issues.is_empty() => {
                EventSeverity::Warning
            }
            ServerEvent::DocsBatch { .. } | ServerEvent::PagesBatch { .. } => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing [`ServerEvent`]s.
///
/// Cloning the bus clones the sender; every `subscribe()` gets an
/// independent receiver that sees all future events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: ServerEvent) -> Result<usize, SendError<ServerEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&ServerEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{EventBus, EventStream, ServerEvent};
///
/// let bus = EventBus::new(100);
/// let job_logs = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, ServerEvent::ImportLogs { .. }));
/// ```
pub struct EventStream {
    receiver: Receiver<ServerEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<ServerEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ServerEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &ServerEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Next event that passes the filter. Lagging is reported, not skipped.
    pub async fn recv(&mut self) -> Result<ServerEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv); `None` when nothing
    /// matching is buffered.
    pub fn try_recv(&mut self) -> Option<Result<ServerEvent, RecvError>> {
        use broadcast::error::TryRecvError;

        loop {
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            };
            if self.accepts(&event) {
                return Some(Ok(event));
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
