//! Request and response values exchanged with providers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-call context carried alongside a request.
///
/// Pipeline stages mutate this in place: the orchestrator stamps a request id
/// and start time, the error handler records retry state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id assigned by the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// When the request was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Number of retries already scheduled for this request.
    #[serde(default)]
    pub retry_count: u32,
    /// Set when the caller should resubmit after `retry_delay`.
    #[serde(default)]
    pub should_retry: bool,
    /// Backoff the caller must honour before resubmitting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<Duration>,
    /// Calling user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Calling session, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Anything else the caller wants to thread through.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RequestContext {
    /// Creates a context carrying user and optional session hints.
    pub fn for_user(user_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self { user_id: Some(user_id.into()), session_id, ..Self::default() }
    }
}

/// A single call to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Remote method name (e.g. `"list_tools"`).
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Call context.
    #[serde(default)]
    pub context: RequestContext,
}

impl ProviderRequest {
    /// Creates a request with no parameters.
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Map::new(), context: RequestContext::default() }
    }

    /// Replaces the parameter map.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets one parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Replaces the context.
    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

/// The outcome of a provider call.
///
/// Stages that reshape a response take it by value and return a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Whether the backend reported success.
    pub success: bool,
    /// Response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error message for failed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Usage stats, timing, rate-limit headers and similar annotations.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ProviderResponse {
    /// A successful response carrying `data`.
    pub fn success(data: Value) -> Self {
        Self { success: true, data: Some(data), error: None, metadata: Map::new() }
    }

    /// A failed response carrying `error`.
    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, data: None, error: Some(error.into()), metadata: Map::new() }
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
