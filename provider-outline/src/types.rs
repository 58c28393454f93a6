//! Outline API request and response types
//!
//! See: https://www.getoutline.com/developers

use serde::{Deserialize, Serialize};

/// `{ "data": ... }` response envelope
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineCollection {
    pub id: String,
    pub name: String,
    /// `read`, `read_write`, or null for private collections
    #[serde(default)]
    pub permission: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineDocument {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub parent_document_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchResult {
    pub document: OutlineDocument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineTreeNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub children: Vec<OutlineTreeNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlineUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListCollectionsRequest {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocumentsRequest<'a> {
    pub collection_id: &'a str,
    pub query: &'a str,
    pub limit: usize,
    pub include_archived: bool,
    pub include_drafts: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateCollectionRequest<'a> {
    pub name: &'a str,
    pub private: bool,
    pub icon: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest<'a> {
    pub collection_id: &'a str,
    pub title: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<&'a str>,
    pub publish: bool,
}

#[derive(Debug, Serialize)]
pub struct IdRequest<'a> {
    pub id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct UpdateDocumentRequest<'a> {
    pub id: &'a str,
    pub title: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveDocumentRequest<'a> {
    pub id: &'a str,
    pub collection_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<&'a str>,
    pub index: usize,
}

#[derive(Debug, Serialize)]
pub struct ListUsersRequest<'a> {
    pub emails: &'a [String],
}
