//! HTTP client for webhook channels.
//!
//! Sends events as form posts, switching to multipart uploads when an
//! attachment is present. Non-2xx responses are converted into categorized
//! [`DeliveryError`]s so that channel results carry a readable failure.

use std::{path::PathBuf, time::Duration};

use reqwest::{multipart, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_ERROR_BODY_SIZE: usize = 1024;

/// Configuration for the webhook client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout applied when a request carries no override.
    pub default_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            user_agent: "Herald-Event-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// One webhook post.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Destination URL.
    pub url: String,
    /// Form fields in send order.
    pub fields: Vec<(String, String)>,
    /// File uploaded as the multipart `file` part.
    pub attachment: Option<PathBuf>,
    /// Per-request timeout overriding the client default.
    pub timeout: Option<Duration>,
    /// Event id used for log correlation.
    pub event_id: String,
    /// Channel name used for log correlation.
    pub channel: &'static str,
}

impl WebhookRequest {
    /// Creates a request to `url` without fields.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Self::default() }
    }

    /// Appends a form field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }
}

/// Successful webhook response.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code (2xx).
    pub status_code: u16,
    /// Response body, truncated when large.
    pub body: String,
    /// Total request duration.
    pub duration: Duration,
}

/// Pooled reqwest client shared by both webhook channels.
#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl WebhookClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if reqwest rejects the
    /// settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts the request and requires a 2xx answer.
    ///
    /// # Errors
    ///
    /// - `NetworkError` for connection failures or an unreadable attachment
    /// - `Timeout` when the effective timeout elapses
    /// - `ClientError` for 4xx responses
    /// - `ServerError` for any other non-2xx response
    pub async fn post(&self, request: WebhookRequest) -> Result<WebhookResponse> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);
        let span = info_span!(
            "webhook_post",
            event_id = %request.event_id,
            channel = request.channel,
            url = %request.url,
            multipart = request.attachment.is_some(),
        );

        async move {
            let start_time = std::time::Instant::now();
            let builder = self.client.post(&request.url).timeout(timeout);

            let builder = match &request.attachment {
                Some(path) => builder.multipart(build_multipart(&request.fields, path).await?),
                None => builder.form(&request.fields),
            };

            let response = builder.send().await.map_err(|e| {
                tracing::debug!(
                    duration_ms = start_time.elapsed().as_millis() as u64,
                    error = %e,
                    "webhook request failed"
                );
                if e.is_timeout() {
                    DeliveryError::timeout(timeout.as_millis() as u64)
                } else if e.is_connect() {
                    DeliveryError::network(format!("connection failed: {e}"))
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let body = read_body(response).await;
            let duration = start_time.elapsed();

            tracing::debug!(
                status = status_code,
                duration_ms = duration.as_millis() as u64,
                "received webhook response"
            );

            if is_success {
                return Ok(WebhookResponse { status_code, body, duration });
            }

            let body = truncate(body, MAX_ERROR_BODY_SIZE);
            if (400..500).contains(&status_code) {
                Err(DeliveryError::client_error(status_code, body))
            } else {
                Err(DeliveryError::server_error(status_code, body))
            }
        }
        .instrument(span)
        .await
    }
}

async fn build_multipart(fields: &[(String, String)], path: &PathBuf) -> Result<multipart::Form> {
    let contents = tokio::fs::read(path).await.map_err(|e| {
        DeliveryError::network(format!("failed to read attachment {}: {e}", path.display()))
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());

    let mut form = multipart::Form::new()
        .part("file", multipart::Part::bytes(contents).file_name(file_name));
    for (name, value) in fields {
        form = form.text(name.clone(), value.clone());
    }
    Ok(form.text("file", path.display().to_string()))
}

/// Reads at most [`MAX_RESPONSE_BODY_SIZE`] bytes; the rest is never buffered.
async fn read_body(mut response: Response) -> String {
    let mut buf = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(MAX_RESPONSE_BODY_SIZE - buf.len());
                buf.extend_from_slice(&chunk[..take]);
                if buf.len() >= MAX_RESPONSE_BODY_SIZE {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                return format!("[failed to read response body: {e}]");
            },
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut end = max;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("... (truncated)");
    }
    body
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn form_request(url: String) -> WebhookRequest {
        WebhookRequest::new(url)
            .field("jsonData", r#"{"type":"Message"}"#)
            .field("token", "tok-1")
            .field("instanceName", "main")
    }

    #[tokio::test]
    async fn successful_form_post() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("content-type", "application/x-www-form-urlencoded"))
            .and(matchers::body_string_contains("token=tok-1"))
            .and(matchers::body_string_contains("instanceName=main"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.post(form_request(format!("{}/hook", mock_server.uri()))).await;

        let response = response.expect("2xx accepted");
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn client_error_status_is_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let result = client.post(form_request(mock_server.uri())).await;

        match result {
            Err(DeliveryError::ClientError { status_code, body }) => {
                assert_eq!(status_code, 404);
                assert_eq!(body, "Not Found");
            },
            other => panic!("expected client error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_status_is_error() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let result = client.post(form_request(mock_server.uri())).await;

        assert!(matches!(result, Err(DeliveryError::ServerError { status_code: 503, .. })));
    }

    #[tokio::test]
    async fn request_timeout_override_applies() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let mut request = form_request(mock_server.uri());
        request.timeout = Some(Duration::from_millis(100));

        let result = client.post(request).await;
        assert!(matches!(result, Err(DeliveryError::Timeout { timeout_ms: 100 })));
    }

    #[tokio::test]
    async fn attachment_sent_as_multipart() {
        let mock_server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.ogg");
        std::fs::write(&path, b"opus-bytes").unwrap();

        Mock::given(matchers::method("POST"))
            .and(matchers::body_string_contains("opus-bytes"))
            .and(matchers::body_string_contains("name=\"jsonData\""))
            .and(matchers::body_string_contains("filename=\"voice.ogg\""))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let mut request = form_request(mock_server.uri());
        request.attachment = Some(path);

        let response = client.post(request).await.expect("multipart accepted");
        assert_eq!(response.status_code, 204);
    }

    #[tokio::test]
    async fn missing_attachment_fails_without_request() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let mut request = form_request(mock_server.uri());
        request.attachment = Some(PathBuf::from("/nonexistent/herald/file.bin"));

        let result = client.post(request).await;
        assert!(matches!(result, Err(DeliveryError::NetworkError { .. })));
    }

    #[tokio::test]
    async fn oversized_response_body_is_capped() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(512 * 1024)))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        let response = client.post(form_request(mock_server.uri())).await.unwrap();

        assert_eq!(response.body.len(), MAX_RESPONSE_BODY_SIZE);
    }

    #[tokio::test]
    async fn oversized_error_body_is_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("e".repeat(256 * 1024)))
            .mount(&mock_server)
            .await;

        let client = WebhookClient::with_defaults().unwrap();
        match client.post(form_request(mock_server.uri())).await {
            Err(DeliveryError::ServerError { status_code, body }) => {
                assert_eq!(status_code, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY_SIZE + "... (truncated)".len());
            },
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn long_error_bodies_truncated_on_char_boundary() {
        let body = "é".repeat(1000);
        let truncated = truncate(body, 11);
        assert!(truncated.ends_with("... (truncated)"));
        assert!(truncated.len() <= 11 + "... (truncated)".len());
    }
}
