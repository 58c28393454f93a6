//! `HttpClient` over reqwest.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, MultipartPart, RetryPolicy},
};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("coda-outline-mover/", env!("CARGO_PKG_VERSION"));

/// Pooled reqwest client.
///
/// 5xx responses and connection failures are retried with exponential
/// backoff per [`RetryPolicy`]. `429` responses are handed back untouched;
/// the engine's scheduler owns rate-limit backoff.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30)).unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default reqwest client");
            Self::with_client(Client::new())
        })
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BridgeError::NotAvailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn form(parts: Vec<MultipartPart>) -> Result<Form> {
        parts.into_iter().try_fold(Form::new(), |form, part| match part {
            MultipartPart::Text { name, value } => Ok(form.text(name, value)),
            MultipartPart::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                let file = Part::bytes(data.to_vec())
                    .file_name(file_name)
                    .mime_str(&content_type)
                    .map_err(|e| {
                        BridgeError::OperationFailed(format!(
                            "Invalid content type {}: {}",
                            content_type, e
                        ))
                    })?;
                Ok(form.part(name, file))
            }
        })
    }

    fn build(&self, request: HttpRequest) -> Result<reqwest::RequestBuilder> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut builder = self.client.request(method, &request.url);

        for (key, value) in request.headers {
            builder = builder.header(key, value);
        }
        builder = match (request.multipart, request.body) {
            (Some(parts), _) => builder.multipart(Self::form(parts)?),
            (None, Some(body)) => builder.body(body),
            (None, None) => builder,
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder)
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Reading response body: {}", e)))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn describe(error: &reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::OperationFailed("Request timed out".to_string())
        } else if error.is_connect() {
            BridgeError::OperationFailed(format!("Connection failed: {}", error))
        } else {
            BridgeError::OperationFailed(error.to_string())
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let attempts = self.policy.max_attempts.max(1);
        let mut retry = 0;

        loop {
            let outcome = match self.build(request.clone())?.send().await {
                Ok(response) => {
                    let response = Self::read(response).await?;
                    if !response.is_transient() {
                        return Ok(response);
                    }
                    Err(BridgeError::OperationFailed(format!(
                        "HTTP {} from {}",
                        response.status, request.url
                    )))
                }
                Err(e) => Err(Self::describe(&e)),
            };

            retry += 1;
            if retry >= attempts {
                return outcome;
            }

            let delay = self.policy.delay_for(retry);
            if let Err(e) = &outcome {
                warn!(url = %request.url, retry, error = %e, "Retrying HTTP request");
            }
            debug!(delay_ms = delay.as_millis() as u64, "Backing off");
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_client_creation() {
        assert!(ReqwestHttpClient::with_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_form_rejects_bad_mime() {
        let parts = vec![MultipartPart::File {
            name: "file".into(),
            file_name: "a.md".into(),
            content_type: "not a mime".into(),
            data: Bytes::from_static(b"# A"),
        }];
        assert!(ReqwestHttpClient::form(parts).is_err());
    }

    #[test]
    fn test_multipart_upload_request() {
        let client = ReqwestHttpClient::new();
        let request = HttpRequest::new(HttpMethod::Post, "https://example.com/api/documents.import")
            .bearer_token("t")
            .multipart(vec![
                MultipartPart::Text {
                    name: "publish".into(),
                    value: "true".into(),
                },
                MultipartPart::File {
                    name: "file".into(),
                    file_name: "a.md".into(),
                    content_type: "text/markdown".into(),
                    data: Bytes::from_static(b"# A"),
                },
            ]);

        let built = client.build(request).unwrap().build().unwrap();
        let content_type = built
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        assert_eq!(built.method(), reqwest::Method::POST);
        assert!(content_type.starts_with("multipart/form-data"));
        assert!(built.headers().contains_key(reqwest::header::AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_connection_failure_exhausts_retries() {
        let client = ReqwestHttpClient::with_timeout(Duration::from_millis(200))
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            });

        let result = client
            .execute(HttpRequest::new(HttpMethod::Get, "http://127.0.0.1:9/unreachable"))
            .await;

        assert!(matches!(result, Err(BridgeError::OperationFailed(_))));
    }
}
