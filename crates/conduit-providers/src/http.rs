//! JSON-over-HTTP provider.
//!
//! The reference backend integration. It authenticates with a bearer token,
//! checks `GET {endpoint}/health` on connect and sends every request as
//! `POST {endpoint}/execute`.
//!
//! ## Wire format
//!
//! Request body:
//!
//! ```json
//! {"method": "...", "params": {...}, "model": "...", "max_tokens": 4096, "temperature": 0.7, "system": "..."}
//! ```
//!
//! A 200 reply maps to a successful response with `data = body.result`;
//! any other status maps to a failed response carrying `body.error`. A 200
//! whose body is not JSON is a failed response naming the decode error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_abstraction::{
    BackendRecord, ConfigSchema, FieldSchema, Provider, ProviderDescriptor, ProviderError,
    ProviderRequest, ProviderResponse,
};
use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::registry::ProviderRegistration;

/// Timeout for the connect health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout when the request carries no `timeout` param.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_API_VERSION: &str = "2024-01-01";
const DEFAULT_MODEL: &str = "claude-3-opus-20240229";
const DEFAULT_MAX_TOKENS: u64 = 4096;
const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Which flavour of HTTP backend a provider instance speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFlavor {
    /// Any service implementing the `/health` + `/execute` protocol.
    Generic,
    /// An AI-assistant service; requires an explicit API version.
    Assistant,
}

impl HttpFlavor {
    /// Returns the static descriptor for this flavour.
    pub fn descriptor(self) -> ProviderDescriptor {
        let api_version = FieldSchema::new("string", "API version sent as X-API-Version")
            .with_default(json!(DEFAULT_API_VERSION));
        let optional = |schema: ConfigSchema| {
            schema
                .optional_field(
                    "model",
                    FieldSchema::new("string", "Model to use").with_default(json!(DEFAULT_MODEL)),
                )
                .optional_field(
                    "max_tokens",
                    FieldSchema::new("integer", "Maximum tokens for responses")
                        .with_default(json!(DEFAULT_MAX_TOKENS)),
                )
                .optional_field(
                    "temperature",
                    FieldSchema::new("number", "Temperature for response generation")
                        .with_default(json!(DEFAULT_TEMPERATURE)),
                )
                .optional_field(
                    "system_prompt",
                    FieldSchema::new("string", "System prompt").with_default(json!("")),
                )
        };

        match self {
            Self::Generic => ProviderDescriptor {
                name: "Generic HTTP Provider".to_string(),
                description: "JSON-over-HTTP backend with bearer authentication".to_string(),
                version: "1.0.0".to_string(),
                schema: optional(ConfigSchema::new().optional_field("api_version", api_version)),
            },
            Self::Assistant => ProviderDescriptor {
                name: "Claude MCP Server".to_string(),
                description: "Provider for Claude AI assistant integration".to_string(),
                version: "1.0.0".to_string(),
                schema: optional(ConfigSchema::new().required_field("api_version", api_version)),
            },
        }
    }
}

/// Request body sent to `/execute`.
#[derive(Debug, Serialize)]
struct ExecutePayload<'a> {
    method: &'a str,
    params: &'a Map<String, Value>,
    model: Value,
    max_tokens: Value,
    temperature: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
}

/// Bearer-token JSON-over-HTTP provider.
#[derive(Debug)]
pub struct HttpProvider {
    flavor: HttpFlavor,
    endpoint: String,
    token: Option<String>,
    configuration: Map<String, Value>,
    client: Client,
    connected: AtomicBool,
}

impl HttpProvider {
    /// Creates a provider for a backend record.
    pub fn new(flavor: HttpFlavor, record: &BackendRecord) -> Self {
        Self {
            flavor,
            endpoint: record.endpoint.trim_end_matches('/').to_string(),
            token: record.authentication.bearer_token().map(str::to_string),
            configuration: record.configuration.clone(),
            client: Client::new(),
            connected: AtomicBool::new(false),
        }
    }

    /// Registration for the `generic` type.
    pub fn generic_registration() -> ProviderRegistration {
        ProviderRegistration::new(HttpFlavor::Generic.descriptor(), |record| {
            let provider: Arc<dyn Provider> = Arc::new(Self::new(HttpFlavor::Generic, record));
            Ok(provider)
        })
    }

    /// Registration for the `claude` type.
    pub fn assistant_registration() -> ProviderRegistration {
        ProviderRegistration::new(HttpFlavor::Assistant.descriptor(), |record| {
            let provider: Arc<dyn Provider> = Arc::new(Self::new(HttpFlavor::Assistant, record));
            Ok(provider)
        })
    }

    fn api_version(&self) -> &str {
        self.configuration
            .get("api_version")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_API_VERSION)
    }

    fn config_or(&self, key: &str, default: Value) -> Value {
        self.configuration.get(key).cloned().unwrap_or(default)
    }

    fn with_headers(&self, builder: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(token)
            .header("X-API-Version", self.api_version())
            .header("Content-Type", "application/json")
    }

    fn request_timeout(request: &ProviderRequest) -> Duration {
        let secs = request
            .params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

fn request_id(response: &reqwest::Response) -> Value {
    response
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map_or(Value::Null, |v| Value::String(v.to_string()))
}

fn error_text(body: &Value) -> String {
    match body.get("error") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Null) | None => "Unknown error".to_string(),
        Some(other) => other.to_string(),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn describe(&self) -> ProviderDescriptor {
        self.flavor.descriptor()
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        let Some(token) = self.token.as_deref() else {
            return Err(ProviderError::Connection(
                "API token is required for HTTP providers".to_string(),
            ));
        };

        let url = format!("{}/health", self.endpoint);
        debug!(url = %url, flavor = ?self.flavor, "Probing backend health");

        let response = self
            .with_headers(self.client.get(&url), token)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(format!("Connection failed: {e}")))?;

        let status = response.status();
        if status.as_u16() != 200 {
            warn!(url = %url, status = %status, "Health check rejected");
            return Err(ProviderError::Connection(format!(
                "Failed to connect to backend: {}",
                status.as_u16()
            )));
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "Connected to HTTP backend");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        info!(endpoint = %self.endpoint, "Disconnected from HTTP backend");
    }

    async fn execute_request(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        if !self.is_connected() {
            return Err(ProviderError::NotConnected);
        }
        // connect() refuses to succeed without a token.
        let token = self.token.as_deref().unwrap_or_default();

        let system = self
            .configuration
            .get("system_prompt")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let payload = ExecutePayload {
            method: &request.method,
            params: &request.params,
            model: self.config_or("model", json!(DEFAULT_MODEL)),
            max_tokens: self.config_or("max_tokens", json!(DEFAULT_MAX_TOKENS)),
            temperature: self.config_or("temperature", json!(DEFAULT_TEMPERATURE)),
            system,
        };

        let url = format!("{}/execute", self.endpoint);
        debug!(url = %url, method = %request.method, "Sending request");

        let result = self
            .with_headers(self.client.post(&url), token)
            .timeout(Self::request_timeout(&request))
            .json(&payload)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, error = %e, "HTTP request failed");
                return Ok(ProviderResponse::failure(format!("Request failed: {e}")));
            }
        };

        let status = response.status().as_u16();
        let request_id = request_id(&response);
        if status == 200 {
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(e) => {
                    warn!(url = %url, error = %e, "Backend returned an undecodable body");
                    return Ok(ProviderResponse::failure(format!("Invalid response body: {e}"))
                        .with_metadata("status_code", json!(status))
                        .with_metadata("request_id", request_id));
                }
            };
            let data = body.get("result").cloned().unwrap_or(Value::Null);
            Ok(ProviderResponse::success(data)
                .with_metadata("usage", body.get("usage").cloned().unwrap_or(Value::Null))
                .with_metadata("model", body.get("model").cloned().unwrap_or(Value::Null))
                .with_metadata("request_id", request_id))
        } else {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            debug!(url = %url, status, "Backend returned an error status");
            Ok(ProviderResponse::failure(error_text(&body))
                .with_metadata("status_code", json!(status))
                .with_metadata("request_id", request_id))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
