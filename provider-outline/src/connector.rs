//! Outline API connector implementation

use async_trait::async_trait;
use bridge_traits::destination::{
    Collection, CreateCollection, CreateDocument, DestinationProvider, Document, DocumentNode,
    MoveDocument, UpdateDocument, User,
};
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartPart};
use bridge_traits::storage::FileSystemAccess;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::OutlineError;
use crate::types::{
    CreateCollectionRequest, CreateDocumentRequest, Envelope, IdRequest, ListCollectionsRequest,
    ListUsersRequest, MoveDocumentRequest, OutlineCollection, OutlineDocument, OutlineTreeNode,
    OutlineUser, SearchDocumentsRequest, SearchResult, UpdateDocumentRequest,
};

/// Outline cloud API base URL
pub const OUTLINE_API_BASE: &str = "https://app.getoutline.com/api";

const COLLECTIONS_PAGE_SIZE: usize = 100;
const SEARCH_LIMIT: usize = 25;
const COLLECTION_ICON: &str = "truck";

/// Outline API connector
///
/// Uploads read the local artifact through [`FileSystemAccess`], so the
/// connector works against whatever mirror the host provides.
pub struct OutlineConnector {
    http_client: Arc<dyn HttpClient>,
    file_system: Arc<dyn FileSystemAccess>,
    api_token: String,
    base_url: String,
}

impl OutlineConnector {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        file_system: Arc<dyn FileSystemAccess>,
        api_token: String,
    ) -> Self {
        Self::with_base_url(http_client, file_system, api_token, OUTLINE_API_BASE)
    }

    pub fn with_base_url(
        http_client: Arc<dyn HttpClient>,
        file_system: Arc<dyn FileSystemAccess>,
        api_token: String,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            file_system,
            api_token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn parse_timestamp(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| {
                warn!(value, "Unparseable Outline timestamp");
                DateTime::<Utc>::default()
            })
    }

    fn convert_document(doc: OutlineDocument) -> Document {
        Document {
            created_at: Self::parse_timestamp(&doc.created_at),
            updated_at: Self::parse_timestamp(&doc.updated_at),
            id: doc.id,
            title: doc.title,
            collection_id: doc.collection_id.unwrap_or_default(),
            parent_document_id: doc.parent_document_id,
        }
    }

    fn convert_collection(collection: OutlineCollection) -> Collection {
        Collection {
            id: collection.id,
            name: collection.name,
            permission: collection.permission,
        }
    }

    fn convert_node(node: OutlineTreeNode) -> DocumentNode {
        DocumentNode {
            id: node.id,
            title: node.title,
            children: node.children.into_iter().map(Self::convert_node).collect(),
        }
    }

    fn convert_user(user: OutlineUser) -> User {
        User {
            id: user.id,
            name: user.name,
            email: user.email,
        }
    }

    fn content_type_for(path: &Path) -> &'static str {
        match path.extension().and_then(|e| e.to_str()) {
            Some("html") | Some("htm") => "text/html",
            _ => "text/markdown",
        }
    }

    fn request(&self, method: &str) -> HttpRequest {
        HttpRequest::new(HttpMethod::Post, format!("{}/{}", self.base_url, method))
            .bearer_token(&self.api_token)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(30))
    }

    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, OutlineError> {
        let response = self.http_client.execute(request).await?;

        if response.is_success() {
            debug!(status = response.status, "Outline request succeeded");
            return Ok(response);
        }

        warn!(status = response.status, "Outline request failed");
        Err(OutlineError::from_status(
            response.status,
            String::from_utf8_lossy(&response.body).to_string(),
            response.retry_after_seconds(),
        ))
    }

    /// POST a JSON body to an RPC method and unwrap the `data` envelope.
    async fn call<B, T>(&self, method: &str, body: &B) -> std::result::Result<T, OutlineError>
    where
        B: Serialize,
        T: serde::de::DeserializeOwned,
    {
        let request = self.request(method).json(body)?;
        let response = self.send(request).await?;
        Self::parse(&response, method)
    }

    fn parse<T: serde::de::DeserializeOwned>(
        response: &HttpResponse,
        method: &str,
    ) -> std::result::Result<T, OutlineError> {
        serde_json::from_slice::<Envelope<T>>(&response.body)
            .map(|envelope| envelope.data)
            .map_err(|e| OutlineError::ParseError(format!("Failed to parse {}: {}", method, e)))
    }
}

#[async_trait]
impl DestinationProvider for OutlineConnector {
    #[instrument(skip(self))]
    async fn list_collections(&self, offset: usize) -> Result<Vec<Collection>> {
        let collections: Vec<OutlineCollection> = self
            .call(
                "collections.list",
                &ListCollectionsRequest {
                    offset,
                    limit: COLLECTIONS_PAGE_SIZE,
                },
            )
            .await?;

        debug!(count = collections.len(), "Listed Outline collections");
        Ok(collections
            .into_iter()
            .map(Self::convert_collection)
            .collect())
    }

    #[instrument(skip(self), fields(collection_id = %collection_id))]
    async fn search_documents(&self, collection_id: &str, query: &str) -> Result<Vec<Document>> {
        let results: Vec<SearchResult> = self
            .call(
                "documents.search",
                &SearchDocumentsRequest {
                    collection_id,
                    query,
                    limit: SEARCH_LIMIT,
                    include_archived: false,
                    include_drafts: false,
                },
            )
            .await?;

        Ok(results
            .into_iter()
            .map(|r| Self::convert_document(r.document))
            .collect())
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    async fn create_collection(&self, input: CreateCollection) -> Result<Collection> {
        if input.name.trim().is_empty() {
            return Err(OutlineError::InvalidInput("collection name is empty".into()).into());
        }

        let collection: OutlineCollection = self
            .call(
                "collections.create",
                &CreateCollectionRequest {
                    name: &input.name,
                    private: input.private,
                    icon: COLLECTION_ICON,
                },
            )
            .await?;

        info!(collection_id = %collection.id, "Created Outline collection");
        Ok(Self::convert_collection(collection))
    }

    #[instrument(skip(self, input), fields(title = %input.title))]
    async fn create_document(&self, input: CreateDocument) -> Result<Document> {
        let document: OutlineDocument = self
            .call(
                "documents.create",
                &CreateDocumentRequest {
                    collection_id: &input.collection_id,
                    title: &input.title,
                    text: &input.text,
                    parent_document_id: input.parent_document_id.as_deref(),
                    publish: input.publish,
                },
            )
            .await?;

        info!(document_id = %document.id, "Created Outline document");
        Ok(Self::convert_document(document))
    }

    #[instrument(skip(self))]
    async fn get_document(&self, id: &str) -> Result<Document> {
        let document: OutlineDocument = self.call("documents.info", &IdRequest { id }).await?;
        Ok(Self::convert_document(document))
    }

    #[instrument(skip(self))]
    async fn archive_document(&self, id: &str) -> Result<()> {
        let request = self.request("documents.archive").json(&IdRequest { id })?;
        self.send(request).await?;

        info!("Archived Outline document");
        Ok(())
    }

    #[instrument(skip(self), fields(collection_id = %collection_id, path = ?file_path))]
    async fn import_document_by_file(
        &self,
        collection_id: &str,
        file_path: &Path,
        parent_document_id: Option<&str>,
    ) -> Result<Document> {
        let data = self.file_system.read_file(file_path).await?;
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| OutlineError::InvalidInput(format!("{:?} has no file name", file_path)))?
            .to_string();

        let mut parts = vec![
            MultipartPart::Text {
                name: "collectionId".to_string(),
                value: collection_id.to_string(),
            },
            MultipartPart::File {
                name: "file".to_string(),
                file_name,
                content_type: Self::content_type_for(file_path).to_string(),
                data,
            },
            MultipartPart::Text {
                name: "publish".to_string(),
                value: "true".to_string(),
            },
        ];
        if let Some(parent) = parent_document_id {
            parts.push(MultipartPart::Text {
                name: "parentDocumentId".to_string(),
                value: parent.to_string(),
            });
        }

        let request = self
            .request("documents.import")
            .timeout(Duration::from_secs(120))
            .multipart(parts);
        let response = self.send(request).await?;
        let document: OutlineDocument = Self::parse(&response, "documents.import")?;

        info!(document_id = %document.id, "Imported Outline document");
        Ok(Self::convert_document(document))
    }

    #[instrument(skip(self, input), fields(id = %input.id))]
    async fn update_document(&self, input: UpdateDocument) -> Result<Document> {
        let document: OutlineDocument = self
            .call(
                "documents.update",
                &UpdateDocumentRequest {
                    id: &input.id,
                    title: &input.title,
                },
            )
            .await?;
        Ok(Self::convert_document(document))
    }

    #[instrument(skip(self))]
    async fn get_collection_tree(&self, collection_id: &str) -> Result<Vec<DocumentNode>> {
        let nodes: Vec<OutlineTreeNode> = self
            .call("collections.documents", &IdRequest { id: collection_id })
            .await?;
        Ok(nodes.into_iter().map(Self::convert_node).collect())
    }

    #[instrument(skip(self, input), fields(id = %input.id, index = input.index))]
    async fn move_document(&self, input: MoveDocument) -> Result<()> {
        let request = self.request("documents.move").json(&MoveDocumentRequest {
            id: &input.id,
            collection_id: &input.collection_id,
            parent_document_id: input.parent_document_id.as_deref(),
            index: input.index,
        })?;
        self.send(request).await?;

        debug!("Moved Outline document");
        Ok(())
    }

    #[instrument(skip(self, emails), fields(count = emails.len()))]
    async fn list_users(&self, emails: &[String]) -> Result<Vec<User>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let users: Vec<OutlineUser> = self
            .call("users.list", &ListUsersRequest { emails })
            .await?;
        Ok(users.into_iter().map(Self::convert_user).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::storage::FileMetadata;
    use bridge_traits::BridgeError;
    use bytes::Bytes;
    use mockall::mock;
    use std::collections::HashMap;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    mock! {
        FileSystem {}

        #[async_trait]
        impl FileSystemAccess for FileSystem {
            async fn exists(&self, path: &Path) -> Result<bool>;
            async fn metadata(&self, path: &Path) -> Result<FileMetadata>;
            async fn create_dir_all(&self, path: &Path) -> Result<()>;
            async fn read_file(&self, path: &Path) -> Result<Bytes>;
            async fn write_file(&self, path: &Path, data: Bytes) -> Result<()>;
            async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
            async fn delete_file(&self, path: &Path) -> Result<()>;
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    fn body_json(req: &HttpRequest) -> serde_json::Value {
        serde_json::from_slice(req.body.as_ref().unwrap()).unwrap()
    }

    fn connector(http: MockHttpClient) -> OutlineConnector {
        OutlineConnector::new(
            Arc::new(http),
            Arc::new(MockFileSystem::new()),
            "token".to_string(),
        )
    }

    const DOC_JSON: &str = r#"{
        "id": "d1",
        "title": "Intro",
        "collectionId": "c1",
        "parentDocumentId": null,
        "createdAt": "2024-01-01T00:00:00.000Z",
        "updatedAt": "2024-01-02T00:00:00.000Z"
    }"#;

    #[tokio::test]
    async fn test_list_collections_pages_by_offset() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Post);
            assert_eq!(req.url, "https://app.getoutline.com/api/collections.list");
            let body = body_json(&req);
            assert_eq!(body["offset"], 100);
            assert_eq!(body["limit"], 100);
            Ok(response(
                200,
                r#"{"data": [
                    {"id": "c1", "name": "Handbook", "permission": null},
                    {"id": "c2", "name": "Shared", "permission": "read_write"}
                ]}"#,
            ))
        });

        let collections = connector(mock_http).list_collections(100).await.unwrap();

        assert_eq!(collections.len(), 2);
        assert!(collections[0].is_private());
        assert!(!collections[1].is_private());
    }

    #[tokio::test]
    async fn test_search_unwraps_document() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            let body = body_json(&req);
            assert_eq!(body["collectionId"], "c1");
            assert_eq!(body["query"], "Intro");
            assert_eq!(body["includeArchived"], false);
            Ok(response(
                200,
                &format!(r#"{{"data": [{{"document": {}}}]}}"#, DOC_JSON),
            ))
        });

        let docs = connector(mock_http)
            .search_documents("c1", "Intro")
            .await
            .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].collection_id, "c1");
        assert!(docs[0].updated_at > docs[0].created_at);
    }

    #[tokio::test]
    async fn test_create_collection_is_private_with_icon() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            let body = body_json(&req);
            assert_eq!(body["private"], true);
            assert_eq!(body["icon"], "truck");
            Ok(response(
                200,
                r#"{"data": {"id": "c9", "name": "Handbook", "permission": null}}"#,
            ))
        });

        let collection = connector(mock_http)
            .create_collection(CreateCollection {
                name: "Handbook".into(),
                private: true,
            })
            .await
            .unwrap();

        assert_eq!(collection.id, "c9");
    }

    #[tokio::test]
    async fn test_create_collection_rejects_blank_name() {
        let err = connector(MockHttpClient::new())
            .create_collection(CreateCollection {
                name: "  ".into(),
                private: true,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::OperationFailed(_)));
    }

    #[tokio::test]
    async fn test_import_sends_multipart_with_parent() {
        let mut mock_http = MockHttpClient::new();
        let mut mock_fs = MockFileSystem::new();

        mock_fs
            .expect_read_file()
            .times(1)
            .returning(|_| Ok(Bytes::from("# Child")));

        mock_http.expect_execute().times(1).returning(|req| {
            assert!(req.url.ends_with("/documents.import"));
            assert!(req.body.is_none());
            let parts = req.multipart.clone().unwrap();
            let names: Vec<&str> = parts.iter().map(|p| p.name()).collect();
            assert_eq!(
                names,
                vec!["collectionId", "file", "publish", "parentDocumentId"]
            );
            match &parts[1] {
                MultipartPart::File {
                    file_name,
                    content_type,
                    ..
                } => {
                    assert_eq!(file_name, "Child.md");
                    assert_eq!(content_type, "text/markdown");
                }
                other => panic!("unexpected part {:?}", other),
            }
            Ok(response(200, &format!(r#"{{"data": {}}}"#, DOC_JSON)))
        });

        let connector = OutlineConnector::new(
            Arc::new(mock_http),
            Arc::new(mock_fs),
            "token".to_string(),
        );
        let doc = connector
            .import_document_by_file("c1", Path::new("/docs/A/Child.md"), Some("d0"))
            .await
            .unwrap();

        assert_eq!(doc.id, "d1");
    }

    #[tokio::test]
    async fn test_collection_tree_nested() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|_| {
            Ok(response(
                200,
                r#"{"data": [
                    {"id": "a", "title": "A", "children": [
                        {"id": "b", "title": "B", "children": []}
                    ]}
                ]}"#,
            ))
        });

        let tree = connector(mock_http).get_collection_tree("c1").await.unwrap();

        assert_eq!(tree.len(), 1);
        assert!(tree[0].find("b").is_some());
    }

    #[tokio::test]
    async fn test_move_omits_missing_parent() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            let body = body_json(&req);
            assert_eq!(body["index"], 2);
            assert!(body.get("parentDocumentId").is_none());
            Ok(response(200, r#"{"data": {}}"#))
        });

        connector(mock_http)
            .move_document(MoveDocument {
                id: "d1".into(),
                collection_id: "c1".into(),
                parent_document_id: None,
                index: 2,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_users_empty_skips_request() {
        let users = connector(MockHttpClient::new())
            .list_users(&[])
            .await
            .unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_and_not_found() {
        let mut mock_http = MockHttpClient::new();
        let mut calls = 0;

        mock_http.expect_execute().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(response(429, "slow down"))
            } else {
                Ok(response(404, "missing"))
            }
        });

        let connector = connector(mock_http);
        let err = connector.get_document("d1").await.unwrap_err();
        assert!(err.is_rate_limited());

        let err = connector.get_document("d1").await.unwrap_err();
        assert!(matches!(err, BridgeError::NotFound(_)));
    }
}
