//! Request and response reshaping per backend type.
//!
//! Every request and response goes through the default pass first and then
//! through the pass for its backend type, if there is one.

use chrono::Utc;
use conduit_abstraction::{ProviderRequest, ProviderResponse};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

const GITHUB_DEFAULT_PER_PAGE: u64 = 30;
const GITHUB_DEFAULT_SORT: &str = "best-match";

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(token|api_key|password)=\S+").expect("secret assignment regex should be valid")
});

/// Which type-specific pass a backend type gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformProfile {
    /// AI-assistant backends (`claude`, `anthropic`).
    Assistant,
    /// Source-control backends (`github`).
    SourceControl,
    /// Everything else: default pass only.
    Default,
}

impl TransformProfile {
    /// Picks the profile for a backend type name.
    pub fn for_backend_type(backend_type: &str) -> Self {
        match backend_type {
            "claude" | "anthropic" => Self::Assistant,
            "github" => Self::SourceControl,
            _ => Self::Default,
        }
    }
}

/// Redacts `token=`, `api_key=` and `password=` assignments.
pub fn sanitize_error(error: &str) -> String {
    SECRET_ASSIGNMENT.replace_all(error, "[REDACTED]").into_owned()
}

/// Reshapes an outgoing request in place.
pub fn transform_request(backend_type: &str, request: &mut ProviderRequest, default_timeout_secs: u64) {
    request.params.entry("timeout").or_insert_with(|| json!(default_timeout_secs));

    match TransformProfile::for_backend_type(backend_type) {
        TransformProfile::Assistant => {
            if let Some(user_id) = &request.context.user_id {
                request.params.insert(
                    "user_context".to_string(),
                    json!({ "user_id": user_id, "session_id": request.context.session_id }),
                );
            }
        }
        TransformProfile::SourceControl => {
            if request.method == "search_code" {
                request.params.entry("per_page").or_insert_with(|| json!(GITHUB_DEFAULT_PER_PAGE));
                request.params.entry("sort").or_insert_with(|| json!(GITHUB_DEFAULT_SORT));
            }
        }
        TransformProfile::Default => {}
    }
}

/// Reshapes an incoming response.
///
/// With `max_response_bytes` set, a payload that serializes larger than the
/// ceiling turns the response into a failure.
pub fn transform_response(
    backend_type: &str,
    mut response: ProviderResponse,
    max_response_bytes: Option<usize>,
) -> ProviderResponse {
    response.metadata.insert("processed_at".to_string(), json!(Utc::now().to_rfc3339()));
    if let Some(error) = response.error.take() {
        response.error = Some(sanitize_error(&error));
    }

    if response.success {
        match TransformProfile::for_backend_type(backend_type) {
            TransformProfile::Assistant => copy_usage(&mut response),
            TransformProfile::SourceControl => copy_rate_limit(&mut response),
            TransformProfile::Default => {}
        }
    }

    enforce_response_size(response, max_response_bytes)
}

/// Turns a response whose payload exceeds `max_response_bytes` into a failure.
pub fn enforce_response_size(response: ProviderResponse, max_response_bytes: Option<usize>) -> ProviderResponse {
    match max_response_bytes {
        Some(limit) if payload_size(&response) > limit => ProviderResponse {
            success: false,
            data: None,
            error: Some(format!("Response size exceeds limit ({limit} bytes)")),
            metadata: response.metadata,
        },
        _ => response,
    }
}

fn copy_usage(response: &mut ProviderResponse) {
    let usage = response.data.as_ref().and_then(|data| data.get("usage")).cloned();
    if let Some(usage) = usage {
        response.metadata.insert("usage".to_string(), usage);
    }
}

fn copy_rate_limit(response: &mut ProviderResponse) {
    if response.data.as_ref().is_none_or(Value::is_null) {
        return;
    }
    let Some(headers) = response.metadata.get("headers").and_then(Value::as_object) else {
        return;
    };
    let header = |name: &str| headers.get(name).cloned().unwrap_or(Value::Null);
    let mut rate_limit = Map::new();
    rate_limit.insert("limit".to_string(), header("X-RateLimit-Limit"));
    rate_limit.insert("remaining".to_string(), header("X-RateLimit-Remaining"));
    rate_limit.insert("reset".to_string(), header("X-RateLimit-Reset"));
    response.metadata.insert("rate_limit".to_string(), Value::Object(rate_limit));
}

fn payload_size(response: &ProviderResponse) -> usize {
    response
        .data
        .as_ref()
        .and_then(|data| serde_json::to_vec(data).ok())
        .map_or(0, |bytes| bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_abstraction::RequestContext;

    #[test]
    fn test_sanitize_error() {
        assert_eq!(
            sanitize_error("auth failed: TOKEN=abc123 and api_key=xyz, password=hunter2 end"),
            "auth failed: [REDACTED] and [REDACTED] [REDACTED] end"
        );
        assert_eq!(sanitize_error("plain failure"), "plain failure");
    }

    #[test]
    fn test_default_request_keeps_existing_keys() {
        let mut request = ProviderRequest::new("query")
            .with_param("timeout", json!(5))
            .with_param("q", json!("rust"));
        transform_request("generic", &mut request, 30);
        assert_eq!(request.params["timeout"], json!(5));
        assert_eq!(request.params["q"], json!("rust"));

        let mut bare = ProviderRequest::new("query");
        transform_request("unknown-type", &mut bare, 30);
        assert_eq!(bare.params["timeout"], json!(30));
        assert_eq!(bare.params.len(), 1);
    }

    #[test]
    fn test_assistant_request_user_context() {
        let mut request = ProviderRequest::new("chat")
            .with_param("prompt", json!("hi"))
            .with_context(RequestContext::for_user("u-1", Some("s-9".to_string())));
        transform_request("claude", &mut request, 30);
        assert_eq!(request.params["user_context"], json!({"user_id": "u-1", "session_id": "s-9"}));
        assert_eq!(request.params["prompt"], json!("hi"));
        assert_eq!(request.params["timeout"], json!(30));

        let mut anonymous = ProviderRequest::new("chat");
        transform_request("anthropic", &mut anonymous, 30);
        assert!(!anonymous.params.contains_key("user_context"));
    }

    #[test]
    fn test_source_control_search_defaults() {
        let mut request = ProviderRequest::new("search_code").with_param("sort", json!("indexed"));
        transform_request("github", &mut request, 30);
        assert_eq!(request.params["per_page"], json!(30));
        assert_eq!(request.params["sort"], json!("indexed"));

        let mut other = ProviderRequest::new("list_repos");
        transform_request("github", &mut other, 30);
        assert!(!other.params.contains_key("per_page"));
    }

    #[test]
    fn test_default_response() {
        let response = ProviderResponse::failure("bad token=secret")
            .with_metadata("status_code", json!(401));
        let out = transform_response("generic", response, None);
        assert_eq!(out.error.as_deref(), Some("bad [REDACTED]"));
        assert_eq!(out.metadata["status_code"], json!(401));
        assert!(out.metadata.contains_key("processed_at"));
    }

    #[test]
    fn test_assistant_response_usage() {
        let response = ProviderResponse::success(json!({"text": "hi", "usage": {"input_tokens": 3}}));
        let out = transform_response("claude", response, None);
        assert_eq!(out.metadata["usage"], json!({"input_tokens": 3}));
        assert_eq!(out.data.unwrap()["text"], json!("hi"));
    }

    #[test]
    fn test_source_control_rate_limit() {
        let response = ProviderResponse::success(json!({"items": []})).with_metadata(
            "headers",
            json!({"X-RateLimit-Limit": "5000", "X-RateLimit-Remaining": "4999"}),
        );
        let out = transform_response("github", response, None);
        assert_eq!(
            out.metadata["rate_limit"],
            json!({"limit": "5000", "remaining": "4999", "reset": null})
        );
        assert!(out.metadata.contains_key("headers"));
    }

    #[test]
    fn test_response_size_ceiling() {
        let response = ProviderResponse::success(json!({"blob": "x".repeat(100)}))
            .with_metadata("model", json!("m"));
        let out = transform_response("generic", response, Some(64));
        assert!(!out.success);
        assert!(out.data.is_none());
        assert_eq!(out.error.as_deref(), Some("Response size exceeds limit (64 bytes)"));
        assert_eq!(out.metadata["model"], json!("m"));

        let small = transform_response("generic", ProviderResponse::success(json!("ok")), Some(64));
        assert!(small.success);
    }
}
