//! Coda API response types
//!
//! See: https://coda.io/developers/apis/v1

use serde::{Deserialize, Serialize};

/// Paginated list envelope shared by `/docs` and `/docs/{id}/pages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,

    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Coda doc resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodaDoc {
    pub id: String,
    pub name: String,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageReference {
    pub id: String,
}

/// Coda page resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodaPage {
    pub id: String,
    pub name: String,
    /// `canvas` or `embed`
    pub content_type: String,
    #[serde(default)]
    pub parent: Option<PageReference>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest<'a> {
    pub output_format: &'a str,
}

/// Response of `POST .../export`
#[derive(Debug, Deserialize)]
pub struct ExportResponse {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Response of `GET .../export/{exportId}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStatusResponse {
    pub status: String,
    #[serde(default)]
    pub download_link: Option<String>,
}
