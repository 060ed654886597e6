//! HTTP target handler
//!
//! Posts rendered payloads to an HTTP endpoint with bearer / basic /
//! API-key authentication, custom headers, a per-request timeout, and
//! bounded retries with exponential backoff and jitter. Retries fire on
//! transport-level failures (connect, timeout) and on retryable statuses
//! (408, 429, 5xx); other client errors fail immediately.

use super::{HandlerFactory, TargetHandler};
use crate::error::{HandlerError, HandlerResult};
use crate::event::{AlarmEvent, ExportResult};
use crate::store::TargetRecord;
use crate::types::SensitiveString;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use validator::Validate;

/// HTTP handler configuration (per-target config blob)
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HttpHandlerConfig {
    /// Endpoint URL
    #[validate(url)]
    pub url: String,

    /// HTTP method (default: POST)
    #[serde(default)]
    pub method: HttpMethod,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u32,

    /// Maximum retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,

    /// Retry backoff base in milliseconds (default: 1000)
    #[serde(default = "default_retry_backoff_ms")]
    #[validate(range(min = 100, max = 60000))]
    pub retry_backoff_ms: u32,

    /// Add jitter to retry backoff (default: true)
    #[serde(default = "default_true")]
    pub retry_jitter: bool,

    /// Content type header (default: application/json)
    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Additional request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Authentication (optional)
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_timeout_secs() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u32 {
    1000
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_true() -> bool {
    true
}

/// HTTP methods supported for export
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    fn as_reqwest_method(&self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Bearer token
    Bearer { token: SensitiveString },
    /// Basic authentication
    Basic {
        username: String,
        password: SensitiveString,
    },
    /// API key in a named header
    ApiKey {
        header_name: String,
        key: SensitiveString,
    },
}

/// Handler instance bound to one target
pub struct HttpTargetHandler {
    target_id: i64,
    target_name: String,
    config: HttpHandlerConfig,
    client: reqwest::Client,
}

impl HttpTargetHandler {
    fn new(target: &TargetRecord, config: HttpHandlerConfig) -> HandlerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs as u64))
            .build()
            .map_err(|e| HandlerError::connection(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            target_id: target.id,
            target_name: target.name.clone(),
            config,
            client,
        })
    }

    fn build_request(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .request(self.config.method.as_reqwest_method(), &self.config.url)
            .header("Content-Type", &self.config.content_type)
            .body(body);

        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }

        match &self.config.auth {
            Some(AuthConfig::Bearer { token }) => {
                request = request.bearer_auth(token.expose());
            }
            Some(AuthConfig::Basic { username, password }) => {
                request = request.basic_auth(username, Some(password.expose()));
            }
            Some(AuthConfig::ApiKey { header_name, key }) => {
                request = request.header(header_name, key.expose());
            }
            None => {}
        }

        request
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = (self.config.retry_backoff_ms as u64).saturating_mul(2u64.pow(attempt));
        let backoff_ms = if self.config.retry_jitter {
            let jitter = rand::thread_rng().gen_range(0..=(base_ms / 4).max(1));
            base_ms.saturating_add(jitter)
        } else {
            base_ms
        };
        Duration::from_millis(backoff_ms)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
    }
}

#[async_trait]
impl TargetHandler for HttpTargetHandler {
    async fn check(&self) -> HandlerResult<()> {
        let response = self
            .client
            .head(&self.config.url)
            .send()
            .await
            .map_err(|e| HandlerError::connection(format!("{}", e)))?;

        // 405 Method Not Allowed is expected for HEAD-averse endpoints
        if response.status().is_success() || response.status().as_u16() == 405 {
            Ok(())
        } else {
            Err(HandlerError::connection(format!(
                "endpoint returned status {}",
                response.status()
            )))
        }
    }

    async fn send(&self, _event: &AlarmEvent, payload: &Value) -> ExportResult {
        let started = Instant::now();

        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return ExportResult::failure(
                    self.target_id,
                    &self.target_name,
                    format!("payload serialization failed: {}", e),
                )
                .with_processing_time(started.elapsed());
            }
        };
        let data_size = body.len();

        let mut last_error = String::new();
        let mut last_status: Option<u16> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt - 1);
                debug!(
                    "HTTP target '{}' retrying in {:?} (attempt {}/{})",
                    self.target_name, delay, attempt, self.config.max_retries
                );
                tokio::time::sleep(delay).await;
            }

            match self.build_request(body.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    last_status = Some(status.as_u16());

                    if status.is_success() {
                        return ExportResult::ok(self.target_id, &self.target_name)
                            .with_status_code(status.as_u16())
                            .with_processing_time(started.elapsed())
                            .with_data_size(data_size);
                    }

                    if Self::is_retryable_status(status) {
                        last_error = format!("server returned {}", status);
                        warn!(
                            "HTTP target '{}' got {} (attempt {}/{})",
                            self.target_name,
                            status,
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                        continue;
                    }

                    // Non-retryable client error
                    let body_text = response.text().await.unwrap_or_default();
                    return ExportResult::failure(
                        self.target_id,
                        &self.target_name,
                        format!("client error {}: {}", status, body_text),
                    )
                    .with_status_code(status.as_u16())
                    .with_processing_time(started.elapsed())
                    .with_data_size(data_size);
                }
                Err(e) => {
                    if e.is_timeout() || e.is_connect() {
                        last_error = format!("request failed: {}", e);
                        warn!(
                            "HTTP target '{}' request failed (attempt {}/{}): {}",
                            self.target_name,
                            attempt + 1,
                            self.config.max_retries + 1,
                            e
                        );
                        continue;
                    }

                    return ExportResult::failure(
                        self.target_id,
                        &self.target_name,
                        format!("request failed: {}", e),
                    )
                    .with_processing_time(started.elapsed())
                    .with_data_size(data_size);
                }
            }
        }

        let mut result = ExportResult::failure(
            self.target_id,
            &self.target_name,
            format!("max retries exceeded: {}", last_error),
        )
        .with_processing_time(started.elapsed())
        .with_data_size(data_size);
        if let Some(code) = last_status {
            result = result.with_status_code(code);
        }
        result
    }
}

/// Factory for the `http` target type
pub struct HttpHandlerFactory;

impl HandlerFactory for HttpHandlerFactory {
    fn type_name(&self) -> &'static str {
        "http"
    }

    fn create(&self, target: &TargetRecord) -> HandlerResult<Arc<dyn TargetHandler>> {
        let config: HttpHandlerConfig = serde_json::from_value(target.config.clone())
            .map_err(|e| HandlerError::config(format!("invalid http config: {}", e)))?;
        config
            .validate()
            .map_err(|e| HandlerError::config(format!("invalid http config: {}", e)))?;

        Ok(Arc::new(HttpTargetHandler::new(target, config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ExportMode;

    fn target_with(config: serde_json::Value) -> TargetRecord {
        TargetRecord {
            id: 1,
            name: "cloud-a".to_string(),
            target_type: "http".to_string(),
            enabled: true,
            config,
            export_mode: ExportMode::default(),
            priority: None,
            template: None,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: HttpHandlerConfig =
            serde_json::from_value(serde_json::json!({"url": "https://example.com/ingest"}))
                .unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.content_type, "application/json");
        assert!(config.retry_jitter);
        assert!(config.auth.is_none());
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let factory = HttpHandlerFactory;
        let err = factory
            .create(&target_with(serde_json::json!({"url": "not a url"})))
            .err()
            .expect("invalid url must be rejected");
        assert!(matches!(err, HandlerError::Config(_)));
    }

    #[test]
    fn test_factory_rejects_missing_url() {
        let factory = HttpHandlerFactory;
        assert!(factory.create(&target_with(serde_json::json!({}))).is_err());
    }

    #[test]
    fn test_auth_config_parses_tagged() {
        let config: HttpHandlerConfig = serde_json::from_value(serde_json::json!({
            "url": "https://example.com",
            "auth": {"type": "bearer", "token": "tok-1"}
        }))
        .unwrap();
        match config.auth {
            Some(AuthConfig::Bearer { token }) => assert_eq!(token.expose(), "tok-1"),
            other => panic!("unexpected auth: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(HttpTargetHandler::is_retryable_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(HttpTargetHandler::is_retryable_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS
        ));
        assert!(HttpTargetHandler::is_retryable_status(
            reqwest::StatusCode::REQUEST_TIMEOUT
        ));
        assert!(!HttpTargetHandler::is_retryable_status(
            reqwest::StatusCode::BAD_REQUEST
        ));
        assert!(!HttpTargetHandler::is_retryable_status(
            reqwest::StatusCode::UNAUTHORIZED
        ));
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let target = target_with(serde_json::json!({
            "url": "https://example.com",
            "retry_backoff_ms": 100,
            "retry_jitter": false
        }));
        let config: HttpHandlerConfig = serde_json::from_value(target.config.clone()).unwrap();
        let handler = HttpTargetHandler::new(&target, config).unwrap();
        assert_eq!(handler.backoff(0), Duration::from_millis(100));
        assert_eq!(handler.backoff(1), Duration::from_millis(200));
        assert_eq!(handler.backoff(2), Duration::from_millis(400));
    }
}
