//! Provider abstraction layer for Conduit.
//!
//! This crate defines the contract every backend integration implements,
//! together with the records and request/response values that flow between
//! the gateway and its providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

pub mod backend;
pub mod request;
pub mod schema;

pub use backend::{Authentication, BackendId, BackendMetadata, BackendRecord, BackendStatus};
pub use request::{ProviderRequest, ProviderResponse, RequestContext};
pub use schema::{ConfigSchema, FieldSchema, ProviderDescriptor};

/// Represents an error that can occur when talking to a backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderError {
    /// Authentication was missing or the health check failed.
    #[error("Connection Error: {0}")]
    Connection(String),

    /// A request was issued before a successful `connect`.
    #[error("Not connected to backend")]
    NotConnected,

    /// The backend reported a failure for a call.
    #[error("Request Error: {0}")]
    Request(String),

    /// A payload could not be encoded or decoded.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// The backend record cannot be served by this provider.
    #[error("Configuration Error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// A backend integration.
///
/// Implementations own their session state behind interior mutability so a
/// single instance can be shared as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the provider's name, version and configuration schema.
    fn describe(&self) -> ProviderDescriptor;

    /// Establishes a session with the backend.
    ///
    /// # Errors
    /// Returns [`ProviderError::Connection`] if credentials are missing or the
    /// backend does not answer its health check.
    async fn connect(&self) -> Result<()>;

    /// Releases the session. Never fails.
    async fn disconnect(&self);

    /// Sends one request over the native protocol.
    ///
    /// Remote failures are reported in the returned response, not as `Err`.
    ///
    /// # Errors
    /// Returns [`ProviderError::NotConnected`] before a successful `connect`.
    async fn execute_request(&self, request: ProviderRequest) -> Result<ProviderResponse>;

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Lists the tools the backend exposes.
    async fn list_tools(&self) -> Result<Vec<Value>> {
        let response = self.execute_request(ProviderRequest::new("list_tools")).await?;
        unwrap_list(response, "tools")
    }

    /// Lists the resources the backend exposes.
    async fn list_resources(&self) -> Result<Vec<Value>> {
        let response = self.execute_request(ProviderRequest::new("list_resources")).await?;
        unwrap_list(response, "resources")
    }

    /// Invokes a named tool.
    async fn invoke_tool(&self, tool: &str, arguments: Map<String, Value>) -> Result<Value> {
        let request = ProviderRequest::new("invoke_tool")
            .with_param("tool", json!(tool))
            .with_param("arguments", Value::Object(arguments));
        let response = self.execute_request(request).await?;
        unwrap_data(response)
    }

    /// Fetches a resource by URI.
    async fn get_resource(&self, uri: &str) -> Result<Value> {
        let request = ProviderRequest::new("get_resource").with_param("uri", json!(uri));
        let response = self.execute_request(request).await?;
        unwrap_data(response)
    }

    /// Connects, pings and disconnects. Errors are logged and reported as `false`.
    async fn health_check(&self) -> bool {
        let name = self.describe().name;
        if let Err(e) = self.connect().await {
            tracing::warn!(provider = %name, error = %e, "Health check connect failed");
            return false;
        }
        let healthy = match self.execute_request(ProviderRequest::new("ping")).await {
            Ok(response) => response.success,
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "Health check ping failed");
                false
            }
        };
        self.disconnect().await;
        healthy
    }
}

fn unwrap_data(response: ProviderResponse) -> Result<Value> {
    if response.success {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(ProviderError::Request(response.error.unwrap_or_else(|| "Unknown error".to_string())))
    }
}

fn unwrap_list(response: ProviderResponse, key: &str) -> Result<Vec<Value>> {
    let data = unwrap_data(response)?;
    Ok(data.get(key).and_then(Value::as_array).cloned().unwrap_or_default())
}
