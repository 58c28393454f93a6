//! Source Platform Contract
//!
//! Operations the puller needs from the source document platform. The
//! concrete REST binding lives in `provider-coda`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Listing<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

/// Root-level source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDoc {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Nested page inside a doc. `parent_id` is `None` for top-level pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePage {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourcePage {
    pub const CANVAS: &'static str = "canvas";

    /// Only canvas pages can be exported.
    pub fn is_canvas(&self) -> bool {
        self.content_type == Self::CANVAS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Markdown,
    Html,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "markdown",
            ExportFormat::Html => "html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Html => "html",
        }
    }
}

/// Handle returned when an export is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportJob {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    InProgress,
    Complete,
    Failed,
    /// The export id is unknown to the source (HTTP 404).
    NotFound,
}

impl ExportStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "complete" => ExportStatus::Complete,
            "failed" => ExportStatus::Failed,
            "not found" => ExportStatus::NotFound,
            _ => ExportStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageExport {
    pub status: ExportStatus,
    pub download_link: Option<String>,
}

impl PageExport {
    pub fn not_found() -> Self {
        Self {
            status: ExportStatus::NotFound,
            download_link: None,
        }
    }

    /// A link is only usable once the export reports completion.
    pub fn ready_link(&self) -> Option<&str> {
        match (&self.status, &self.download_link) {
            (ExportStatus::Complete, Some(link)) if !link.is_empty() => Some(link),
            _ => None,
        }
    }
}

/// Source document platform.
///
/// Rate-limited responses must surface as
/// [`BridgeError::RateLimited`](crate::BridgeError::RateLimited).
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn list_docs(&self, page_token: Option<&str>) -> Result<Listing<SourceDoc>>;

    async fn list_pages_for_doc(
        &self,
        doc_id: &str,
        page_token: Option<&str>,
    ) -> Result<Listing<SourcePage>>;

    async fn export_page(
        &self,
        doc_id: &str,
        page_id: &str,
        format: ExportFormat,
    ) -> Result<ExportJob>;

    /// A 404 maps to [`PageExport::not_found`], never to an error.
    async fn get_page_export(
        &self,
        doc_id: &str,
        page_id: &str,
        export_id: &str,
    ) -> Result<PageExport>;

    /// Fetch the exported artifact behind a download link.
    async fn download(&self, url: &str) -> Result<Bytes>;
}
