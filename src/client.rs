//! REST API client with retry logic
//!
//! [`NylasClient`] is the seam the delta fetcher, OAuth helpers and tunnel
//! depend on. [`ProductionNylasClient`] talks to the real API with `reqwest`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::AppCredentials;
use crate::config::Config;
use crate::error::{NylasError, Result};
use crate::webhook::{Webhook, WebhookRequest};

/// Lazily read response body, one network chunk per item
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Trait defining the API operations the sync core needs, for easier testing
#[async_trait]
pub trait NylasClient: Send + Sync {
    /// Send one request and decode the JSON response body.
    ///
    /// An empty body decodes to `Value::Null`.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value>;

    /// Open a long-lived GET and hand back the body as it arrives
    async fn open_stream(&self, path: &str, query: &[(String, String)]) -> Result<ByteStream>;

    /// Register an application webhook
    async fn create_webhook(&self, request: &WebhookRequest) -> Result<Webhook>;

    /// Delete an application webhook by ID
    async fn delete_webhook(&self, webhook_id: &str) -> Result<()>;

    fn credentials(&self) -> &AppCredentials;
}

/// Production API client
///
/// - Bearer auth with the account access token for account endpoints
/// - Basic auth with the client secret for application endpoints (`/a/...`)
/// - Per-request timeout on JSON calls; streaming calls run until closed
/// - Exponential backoff retry for transient failures
pub struct ProductionNylasClient {
    http: reqwest::Client,
    api_server: String,
    credentials: AppCredentials,
    access_token: Option<String>,
    request_timeout: Duration,
    max_retries: u32,
}

impl ProductionNylasClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `api_server` - Base URL such as `https://api.nylas.com`
    /// * `credentials` - Application client id and secret
    /// * `access_token` - Account token, required for delta endpoints
    pub fn new(
        api_server: &str,
        credentials: AppCredentials,
        access_token: Option<String>,
    ) -> Result<Self> {
        url::Url::parse(api_server)
            .map_err(|e| NylasError::ConfigError(format!("Invalid API server URL: {}", e)))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("nylas-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NylasError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_server: api_server.trim_end_matches('/').to_string(),
            credentials,
            access_token,
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let credentials = AppCredentials::new(&config.api.client_id, &config.api.client_secret);
        Ok(
            Self::new(&config.api.server, credentials, config.api.access_token.clone())?
                .with_request_timeout(Duration::from_secs(config.api.request_timeout_secs))
                .with_max_retries(config.api.max_retries),
        )
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_server, path)
    }

    fn authorize(&self, builder: RequestBuilder, path: &str) -> RequestBuilder {
        if path.starts_with("/a/") {
            builder.basic_auth(&self.credentials.client_secret, Some(""))
        } else if path.starts_with("/oauth/") {
            builder
        } else if let Some(token) = &self.access_token {
            builder.bearer_auth(token)
        } else {
            builder
        }
    }

    fn webhooks_path(&self) -> String {
        format!("/a/{}/webhooks", self.credentials.client_id)
    }

    /// Send a request and turn non-success statuses into typed errors
    async fn send_checked(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Err(NylasError::from_response(status, &headers, &body))
    }

    /// One JSON round-trip, never retried
    async fn send_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut builder = self
            .authorize(self.http.request(method.clone(), self.url(path)), path)
            .query(query)
            .timeout(self.request_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        debug!("Sending {} {}", method, path);
        let response = Self::send_checked(builder).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            NylasError::ProtocolError(format!("Response from {} is not JSON: {}", path, e))
        })
    }

    /// Check if an error is retryable
    fn should_retry(error: &NylasError) -> bool {
        matches!(
            error,
            NylasError::ServerError { .. }
                | NylasError::RateLimitExceeded { .. }
                | NylasError::NetworkError(_)
        )
    }

    /// Execute an async operation with exponential backoff retry
    async fn with_retry<T, F, Fut>(
        operation_name: &str,
        max_retries: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::should_retry(&e) && attempts <= max_retries => {
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl NylasClient for ProductionNylasClient {
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let operation_name = format!("{} {}", method, path);

        Self::with_retry(&operation_name, self.max_retries, || {
            self.send_json(method.clone(), path, query, body.as_ref())
        })
        .await
    }

    async fn open_stream(&self, path: &str, query: &[(String, String)]) -> Result<ByteStream> {
        let operation_name = format!("GET {}", path);

        // Retries only cover connection setup; once bytes flow the caller owns the stream
        let response = Self::with_retry(&operation_name, self.max_retries, || {
            let builder = self
                .authorize(self.http.get(self.url(path)), path)
                .query(query);
            Self::send_checked(builder)
        })
        .await?;

        debug!("Opened stream {}", path);
        Ok(Box::pin(
            response.bytes_stream().map(|chunk| chunk.map_err(NylasError::from)),
        ))
    }

    async fn create_webhook(&self, request: &WebhookRequest) -> Result<Webhook> {
        // Not idempotent: a retry after a lost response registers a second webhook
        let body = serde_json::to_value(request)?;
        let response = self
            .send_json(Method::POST, &self.webhooks_path(), &[], Some(&body))
            .await?;

        let webhook: Webhook = serde_json::from_value(response).map_err(|e| {
            NylasError::ProtocolError(format!("Unexpected webhook response: {}", e))
        })?;
        debug!("Created webhook {} -> {}", webhook.id, webhook.callback_url);
        Ok(webhook)
    }

    async fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        let path = format!("{}/{}", self.webhooks_path(), webhook_id);
        self.request_json(Method::DELETE, &path, &[], None).await?;
        debug!("Deleted webhook {}", webhook_id);
        Ok(())
    }

    fn credentials(&self) -> &AppCredentials {
        &self.credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::{WebhookState, WebhookTrigger};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ProductionNylasClient {
        ProductionNylasClient::new(
            &server.uri(),
            AppCredentials::new("app-id", "app-secret"),
            Some("token-123".to_string()),
        )
        .unwrap()
        .with_max_retries(0)
    }

    #[test]
    fn test_should_retry_server_error() {
        let error = NylasError::ServerError {
            status: 500,
            message: "Internal error".to_string(),
        };
        assert!(ProductionNylasClient::should_retry(&error));
    }

    #[test]
    fn test_should_retry_rate_limit() {
        let error = NylasError::RateLimitExceeded { retry_after: 5 };
        assert!(ProductionNylasClient::should_retry(&error));
    }

    #[test]
    fn test_should_not_retry_protocol_error() {
        let error = NylasError::ProtocolError("missing cursor".to_string());
        assert!(!ProductionNylasClient::should_retry(&error));
        assert!(!ProductionNylasClient::should_retry(&NylasError::Unauthorized(
            "bad token".to_string()
        )));
    }

    #[test]
    fn test_new_rejects_invalid_server() {
        let result = ProductionNylasClient::new("::nope", AppCredentials::new("a", "b"), None);
        assert!(matches!(result, Err(NylasError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = ProductionNylasClient::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    Err(NylasError::NetworkError("Connection reset".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fails_on_permanent_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = ProductionNylasClient::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(NylasError::BadRequest("Invalid cursor".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_all_retries() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = ProductionNylasClient::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(NylasError::RateLimitExceeded { retry_after: 1 })
            }
        })
        .await;

        assert!(result.is_err());
        // initial + 3 retries
        assert_eq!(attempt_count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_request_json_sends_bearer_token_and_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/delta"))
            .and(query_param("cursor", "abc"))
            .and(header("authorization", "Bearer token-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let value = client
            .request_json(
                Method::GET,
                "/delta",
                &[("cursor".to_string(), "abc".to_string())],
                None,
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_request_json_empty_body_is_null() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let value = client_for(&server)
            .request_json(Method::POST, "/empty", &[], None)
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn test_request_json_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/delta"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"message": "Invalid cursor", "type": "invalid_request_error"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_json(Method::GET, "/delta", &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Bad request: HTTP 400: Invalid cursor");
    }

    #[tokio::test]
    async fn test_request_json_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .request_json(Method::GET, "/html", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, NylasError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_request_json_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cursor": "c"})))
            .mount(&server)
            .await;

        let client = client_for(&server).with_max_retries(2);
        let value = client
            .request_json(Method::GET, "/flaky", &[], None)
            .await
            .unwrap();
        assert_eq!(value["cursor"], "c");
    }

    #[tokio::test]
    async fn test_open_stream_yields_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/delta/streaming"))
            .respond_with(ResponseTemplate::new(200).set_body_string("line-1\nline-2\n"))
            .mount(&server)
            .await;

        let stream = client_for(&server)
            .open_stream("/delta/streaming", &[])
            .await
            .unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.concat();
        assert_eq!(body, b"line-1\nline-2\n");
    }

    #[tokio::test]
    async fn test_open_stream_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/delta/streaming"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let result = client_for(&server).open_stream("/delta/streaming", &[]).await;
        assert!(matches!(result, Err(NylasError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_create_webhook_uses_basic_auth() {
        let server = MockServer::start().await;
        let request = WebhookRequest {
            callback_url: "https://cb.nylas.com/tunnel-1".to_string(),
            triggers: vec![WebhookTrigger::MessageCreated],
            state: WebhookState::Active,
        };

        // "app-secret:" base64 encoded
        Mock::given(method("POST"))
            .and(path("/a/app-id/webhooks"))
            .and(header("authorization", "Basic YXBwLXNlY3JldDo="))
            .and(body_json(json!({
                "callback_url": "https://cb.nylas.com/tunnel-1",
                "triggers": ["message.created"],
                "state": "active"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "wh-1",
                "application_id": "app-id",
                "callback_url": "https://cb.nylas.com/tunnel-1",
                "state": "active",
                "triggers": ["message.created"],
                "version": "2.0"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let webhook = client_for(&server).create_webhook(&request).await.unwrap();
        assert_eq!(webhook.id, "wh-1");
        assert_eq!(webhook.state, WebhookState::Active);
        assert_eq!(webhook.triggers, vec![WebhookTrigger::MessageCreated]);
    }

    #[tokio::test]
    async fn test_create_webhook_is_sent_once_on_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/a/app-id/webhooks"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "wh-1", "callback_url": "https://cb.nylas.com/t"}))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server)
            .with_request_timeout(Duration::from_millis(200))
            .with_max_retries(3);
        let request = WebhookRequest {
            callback_url: "https://cb.nylas.com/t".to_string(),
            triggers: vec![WebhookTrigger::MessageCreated],
            state: WebhookState::Active,
        };

        let err = client.create_webhook(&request).await.unwrap_err();
        assert!(matches!(err, NylasError::NetworkError(_)));

        // Long enough for a retry to have landed
        tokio::time::sleep(Duration::from_millis(900)).await;
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/a/app-id/webhooks/wh-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).delete_webhook("wh-1").await.unwrap();
    }
}
