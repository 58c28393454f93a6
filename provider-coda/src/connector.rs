//! Coda API connector implementation

use async_trait::async_trait;
use bridge_traits::error::Result;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use bridge_traits::source::{
    ExportFormat, ExportJob, ExportStatus, Listing, PageExport, SourceDoc, SourcePage,
    SourceProvider,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::CodaError;
use crate::types::{
    CodaDoc, CodaPage, ExportRequest, ExportResponse, ExportStatusResponse, ListResponse,
};

/// Coda API base URL
pub const CODA_API_BASE: &str = "https://coda.io/apis/v1";

const DOCS_PAGE_SIZE: u32 = 100;
const PAGES_PAGE_SIZE: u32 = 50;

/// Coda API connector
///
/// # Example
///
/// ```ignore
/// use provider_coda::CodaConnector;
/// use bridge_traits::SourceProvider;
///
/// let connector = CodaConnector::new(http_client, api_token);
/// let listing = connector.list_docs(None).await?;
/// ```
pub struct CodaConnector {
    http_client: Arc<dyn HttpClient>,
    api_token: String,
    base_url: String,
}

impl CodaConnector {
    /// Create a connector against the public Coda API
    pub fn new(http_client: Arc<dyn HttpClient>, api_token: String) -> Self {
        Self::with_base_url(http_client, api_token, CODA_API_BASE)
    }

    pub fn with_base_url(
        http_client: Arc<dyn HttpClient>,
        api_token: String,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            api_token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Timestamps that fail to parse fall back to the epoch so a bad value
    /// makes the item look stale rather than fresh.
    fn parse_timestamp(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| {
                warn!(value = rfc3339, "Unparseable Coda timestamp");
                DateTime::<Utc>::default()
            })
    }

    fn convert_doc(doc: CodaDoc) -> SourceDoc {
        SourceDoc {
            created_at: Self::parse_timestamp(&doc.created_at),
            updated_at: Self::parse_timestamp(&doc.updated_at),
            id: doc.id,
            name: doc.name,
        }
    }

    fn convert_page(page: CodaPage) -> SourcePage {
        SourcePage {
            created_at: Self::parse_timestamp(&page.created_at),
            updated_at: Self::parse_timestamp(&page.updated_at),
            parent_id: page.parent.map(|p| p.id),
            id: page.id,
            name: page.name,
            content_type: page.content_type,
        }
    }

    fn list_url(&self, path: &str, page_token: Option<&str>, limit: u32) -> String {
        match page_token {
            Some(token) => format!(
                "{}{}?pageToken={}",
                self.base_url,
                path,
                urlencoding::encode(token)
            ),
            None => format!("{}{}?limit={}", self.base_url, path, limit),
        }
    }

    fn request(&self, method: HttpMethod, url: String) -> HttpRequest {
        HttpRequest::new(method, url)
            .bearer_token(&self.api_token)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(30))
    }

    /// Send a request and classify non-2xx responses.
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, CodaError> {
        let response = self.http_client.execute(request).await?;

        if response.is_success() {
            debug!(status = response.status, "Coda request succeeded");
            return Ok(response);
        }

        warn!(status = response.status, "Coda request failed");
        Err(CodaError::from_status(
            response.status,
            String::from_utf8_lossy(&response.body).to_string(),
            response.retry_after_seconds(),
        ))
    }

    fn parse<T: serde::de::DeserializeOwned>(
        response: &HttpResponse,
        what: &str,
    ) -> std::result::Result<T, CodaError> {
        serde_json::from_slice(&response.body)
            .map_err(|e| CodaError::ParseError(format!("Failed to parse {}: {}", what, e)))
    }
}

#[async_trait]
impl SourceProvider for CodaConnector {
    #[instrument(skip(self))]
    async fn list_docs(&self, page_token: Option<&str>) -> Result<Listing<SourceDoc>> {
        let url = self.list_url("/docs", page_token, DOCS_PAGE_SIZE);
        let response = self.send(self.request(HttpMethod::Get, url)).await?;
        let list: ListResponse<CodaDoc> = Self::parse(&response, "docs list")?;

        info!(count = list.items.len(), "Listed Coda docs");

        Ok(Listing {
            items: list.items.into_iter().map(Self::convert_doc).collect(),
            next_page_token: list.next_page_token,
        })
    }

    #[instrument(skip(self), fields(doc_id = %doc_id))]
    async fn list_pages_for_doc(
        &self,
        doc_id: &str,
        page_token: Option<&str>,
    ) -> Result<Listing<SourcePage>> {
        let path = format!("/docs/{}/pages", doc_id);
        let url = self.list_url(&path, page_token, PAGES_PAGE_SIZE);
        let response = self.send(self.request(HttpMethod::Get, url)).await?;
        let list: ListResponse<CodaPage> = Self::parse(&response, "pages list")?;

        info!(count = list.items.len(), "Listed Coda pages");

        Ok(Listing {
            items: list.items.into_iter().map(Self::convert_page).collect(),
            next_page_token: list.next_page_token,
        })
    }

    #[instrument(skip(self), fields(doc_id = %doc_id, page_id = %page_id, format = format.as_str()))]
    async fn export_page(
        &self,
        doc_id: &str,
        page_id: &str,
        format: ExportFormat,
    ) -> Result<ExportJob> {
        let url = format!("{}/docs/{}/pages/{}/export", self.base_url, doc_id, page_id);
        let request = self
            .request(HttpMethod::Post, url)
            .json(&ExportRequest {
                output_format: format.as_str(),
            })?;

        let response = self.send(request).await?;
        let export: ExportResponse = Self::parse(&response, "export response")?;

        debug!(export_id = %export.id, "Requested page export");

        Ok(ExportJob {
            id: export.id,
            status: export.status,
        })
    }

    #[instrument(skip(self), fields(doc_id = %doc_id, page_id = %page_id, export_id = %export_id))]
    async fn get_page_export(
        &self,
        doc_id: &str,
        page_id: &str,
        export_id: &str,
    ) -> Result<PageExport> {
        let url = format!(
            "{}/docs/{}/pages/{}/export/{}",
            self.base_url, doc_id, page_id, export_id
        );

        let response = match self.send(self.request(HttpMethod::Get, url)).await {
            Ok(response) => response,
            Err(CodaError::NotFound(_)) => {
                debug!("Export not found");
                return Ok(PageExport::not_found());
            }
            Err(e) => return Err(e.into()),
        };

        let status: ExportStatusResponse = Self::parse(&response, "export status")?;

        Ok(PageExport {
            status: ExportStatus::parse(&status.status),
            download_link: status.download_link.filter(|link| !link.is_empty()),
        })
    }

    #[instrument(skip(self, url))]
    async fn download(&self, url: &str) -> Result<Bytes> {
        // Export links are pre-signed; the API token must not be sent along.
        let request = HttpRequest::new(HttpMethod::Get, url).timeout(Duration::from_secs(60));
        let response = self.send(request).await?;

        info!(size = response.body.len(), "Downloaded export");
        Ok(response.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::BridgeError;
    use mockall::mock;
    use std::collections::HashMap;

    mock! {
        HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
        }
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn test_convert_page_with_parent() {
        let page = CodaPage {
            id: "canvas-2".to_string(),
            name: "Child".to_string(),
            content_type: "canvas".to_string(),
            parent: Some(crate::types::PageReference {
                id: "canvas-1".to_string(),
            }),
            created_at: "2024-01-01T00:00:00.000Z".to_string(),
            updated_at: "2024-02-01T00:00:00.000Z".to_string(),
        };

        let converted = CodaConnector::convert_page(page);

        assert_eq!(converted.parent_id.as_deref(), Some("canvas-1"));
        assert!(converted.is_canvas());
        assert!(converted.updated_at > converted.created_at);
    }

    #[test]
    fn test_bad_timestamp_is_epoch() {
        assert_eq!(
            CodaConnector::parse_timestamp("yesterday"),
            DateTime::<Utc>::default()
        );
    }

    #[tokio::test]
    async fn test_list_docs_first_page_uses_limit() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.url, "https://coda.io/apis/v1/docs?limit=100");
            assert_eq!(
                req.headers.get("Authorization"),
                Some(&"Bearer secret".to_string())
            );
            Ok(response(
                200,
                r#"{
                    "items": [
                        {
                            "id": "doc1",
                            "name": "Handbook",
                            "createdAt": "2024-01-01T00:00:00.000Z",
                            "updatedAt": "2024-03-01T00:00:00.000Z"
                        }
                    ],
                    "nextPageToken": "next"
                }"#,
            ))
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let listing = connector.list_docs(None).await.unwrap();

        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.items[0].name, "Handbook");
        assert_eq!(listing.next_page_token.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_list_pages_with_token() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(
                req.url,
                "https://coda.io/apis/v1/docs/doc1/pages?pageToken=a%2Bb"
            );
            Ok(response(200, r#"{"items": []}"#))
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let listing = connector
            .list_pages_for_doc("doc1", Some("a+b"))
            .await
            .unwrap();

        assert!(listing.items.is_empty());
        assert!(listing.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_export_page_posts_format() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert_eq!(req.method, HttpMethod::Post);
            assert!(req.url.ends_with("/docs/doc1/pages/p1/export"));
            let body: serde_json::Value =
                serde_json::from_slice(req.body.as_ref().unwrap()).unwrap();
            assert_eq!(body["outputFormat"], "markdown");
            Ok(response(200, r#"{"id": "exp-1", "status": "inProgress"}"#))
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let job = connector
            .export_page("doc1", "p1", ExportFormat::Markdown)
            .await
            .unwrap();

        assert_eq!(job.id, "exp-1");
    }

    #[tokio::test]
    async fn test_export_rate_limited() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|_| {
            let mut res = response(429, "slow down");
            res.headers.insert("retry-after".to_string(), "2".to_string());
            Ok(res)
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let err = connector
            .export_page("doc1", "p1", ExportFormat::Markdown)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BridgeError::RateLimited {
                retry_after_seconds: Some(2)
            }
        ));
    }

    #[tokio::test]
    async fn test_get_page_export_not_found_is_sentinel() {
        let mut mock_http = MockHttpClient::new();

        mock_http
            .expect_execute()
            .times(1)
            .returning(|_| Ok(response(404, "gone")));

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let export = connector
            .get_page_export("doc1", "p1", "exp-1")
            .await
            .unwrap();

        assert_eq!(export, PageExport::not_found());
    }

    #[tokio::test]
    async fn test_get_page_export_complete() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|_| {
            Ok(response(
                200,
                r#"{"status": "complete", "downloadLink": "https://files.example/x.md"}"#,
            ))
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let export = connector
            .get_page_export("doc1", "p1", "exp-1")
            .await
            .unwrap();

        assert_eq!(export.ready_link(), Some("https://files.example/x.md"));
    }

    #[tokio::test]
    async fn test_download_sends_no_token() {
        let mut mock_http = MockHttpClient::new();

        mock_http.expect_execute().times(1).returning(|req| {
            assert!(!req.headers.contains_key("Authorization"));
            Ok(response(200, "# Page"))
        });

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let data = connector
            .download("https://files.example/x.md")
            .await
            .unwrap();

        assert_eq!(&data[..], b"# Page");
    }

    #[tokio::test]
    async fn test_api_error_handling() {
        let mut mock_http = MockHttpClient::new();

        mock_http
            .expect_execute()
            .times(1)
            .returning(|_| Ok(response(500, "boom")));

        let connector = CodaConnector::new(Arc::new(mock_http), "secret".to_string());
        let err = connector.list_docs(None).await.unwrap_err();

        assert!(matches!(err, BridgeError::OperationFailed(_)));
    }
}
