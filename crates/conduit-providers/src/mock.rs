//! In-process provider for development and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit_abstraction::{
    BackendRecord, ConfigSchema, FieldSchema, Provider, ProviderDescriptor, ProviderError,
    ProviderRequest, ProviderResponse,
};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::registry::ProviderRegistration;

/// A provider that answers locally.
///
/// `ping` returns `"pong"`, `list_tools`/`list_resources` return the
/// configured lists, anything else echoes the method and params back.
///
/// Behaviour can be steered through the record's configuration:
/// - `tools`, `resources`: arrays returned by the list methods
/// - `fail_with`: every request fails with this error text
/// - `connect_error`: `connect` fails with this message
/// - `delay_ms`: sleep before answering
#[derive(Debug, Default)]
pub struct MockProvider {
    configuration: Map<String, Value>,
    connected: AtomicBool,
    requests: AtomicU64,
}

impl MockProvider {
    /// Creates a mock with the given behaviour configuration.
    pub fn new(configuration: Map<String, Value>) -> Self {
        Self { configuration, ..Self::default() }
    }

    /// Number of requests executed so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Registration for the `mock` type.
    pub fn registration() -> ProviderRegistration {
        ProviderRegistration::new(Self::descriptor(), |record: &BackendRecord| {
            let provider: Arc<dyn Provider> = Arc::new(Self::new(record.configuration.clone()));
            Ok(provider)
        })
    }

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            name: "Mock Provider".to_string(),
            description: "In-process echo backend for development".to_string(),
            version: "0.1.0".to_string(),
            schema: ConfigSchema::new()
                .optional_field("tools", FieldSchema::new("array", "Tools to advertise"))
                .optional_field("resources", FieldSchema::new("array", "Resources to advertise"))
                .optional_field("fail_with", FieldSchema::new("string", "Fail every request"))
                .optional_field("connect_error", FieldSchema::new("string", "Fail connect"))
                .optional_field(
                    "delay_ms",
                    FieldSchema::new("integer", "Artificial latency").with_default(json!(0)),
                ),
        }
    }

    fn list(&self, key: &str) -> Value {
        self.configuration.get(key).cloned().unwrap_or_else(|| json!([]))
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn describe(&self) -> ProviderDescriptor {
        Self::descriptor()
    }

    async fn connect(&self) -> Result<(), ProviderError> {
        if let Some(message) = self.configuration.get("connect_error").and_then(Value::as_str) {
            return Err(ProviderError::Connection(message.to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn execute_request(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        if !self.is_connected() {
            return Err(ProviderError::NotConnected);
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        debug!(method = %request.method, "MockProvider executing request");

        if let Some(delay) = self.configuration.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = self.configuration.get("fail_with").and_then(Value::as_str) {
            return Ok(ProviderResponse::failure(error));
        }

        let data = match request.method.as_str() {
            "ping" => json!("pong"),
            "list_tools" => json!({ "tools": self.list("tools") }),
            "list_resources" => json!({ "resources": self.list("resources") }),
            _ => json!({ "method": request.method, "params": request.params }),
        };
        Ok(ProviderResponse::success(data).with_metadata("served_at", json!(Utc::now())))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
