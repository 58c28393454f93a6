//! Destination Wiki Contract
//!
//! Operations the importer needs from the destination wiki. The concrete
//! REST binding lives in `provider-outline`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Destination top-level container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    /// `None` means only explicitly added members can see it.
    pub permission: Option<String>,
}

impl Collection {
    pub fn is_private(&self) -> bool {
        self.permission.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub collection_id: String,
    pub parent_document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Node of a collection's document tree, children in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub children: Vec<DocumentNode>,
}

impl DocumentNode {
    pub fn find(&self, id: &str) -> Option<&DocumentNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCollection {
    pub name: String,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDocument {
    pub collection_id: String,
    pub title: String,
    pub text: String,
    pub parent_document_id: Option<String>,
    pub publish: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDocument {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveDocument {
    pub id: String,
    pub collection_id: String,
    pub parent_document_id: Option<String>,
    pub index: usize,
}

/// Destination wiki platform.
#[async_trait]
pub trait DestinationProvider: Send + Sync {
    /// One page of collections starting at `offset`.
    async fn list_collections(&self, offset: usize) -> Result<Vec<Collection>>;

    async fn search_documents(&self, collection_id: &str, query: &str) -> Result<Vec<Document>>;

    async fn create_collection(&self, input: CreateCollection) -> Result<Collection>;

    async fn create_document(&self, input: CreateDocument) -> Result<Document>;

    async fn get_document(&self, id: &str) -> Result<Document>;

    async fn archive_document(&self, id: &str) -> Result<()>;

    /// Upload a local artifact. The document is published on import.
    async fn import_document_by_file(
        &self,
        collection_id: &str,
        file_path: &Path,
        parent_document_id: Option<&str>,
    ) -> Result<Document>;

    async fn update_document(&self, input: UpdateDocument) -> Result<Document>;

    /// Top-level documents of a collection, each with nested children.
    async fn get_collection_tree(&self, collection_id: &str) -> Result<Vec<DocumentNode>>;

    async fn move_document(&self, input: MoveDocument) -> Result<()>;

    async fn list_users(&self, emails: &[String]) -> Result<Vec<User>>;
}
