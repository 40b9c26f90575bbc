//! End-to-end tests: pipeline -> registry -> HTTP provider -> mocked backend.

mod common;

use common::{gateway, http_record};
use conduit_abstraction::{BackendStatus, ProviderRequest};
use conduit_core::{BackendStore, GatewayConfig, GatewayError};
use mockito::Matcher;
use serde_json::json;

#[tokio::test]
async fn test_generic_backend_scenario() {
    let mut server = mockito::Server::new_async().await;
    let health = server
        .mock("GET", "/health")
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .create_async()
        .await;
    let execute = server
        .mock("POST", "/execute")
        .match_body(Matcher::PartialJson(json!({"method": "list_tools", "params": {"timeout": 30}})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"result": {"tools": ["a", "b"]}}"#)
        .expect(2)
        .create_async()
        .await;

    let gw = gateway(GatewayConfig::default());
    let record = gw
        .pipeline
        .register_backend(http_record("generic backend", "generic", &server.url()))
        .await
        .unwrap();

    let connected = gw.pipeline.connect(record.id).await.unwrap();
    assert_eq!(connected.status, BackendStatus::Active);
    health.assert_async().await;

    let mut request = ProviderRequest::new("list_tools");
    let response = gw.pipeline.request(record.id, &mut request).await.unwrap();
    assert!(response.success);
    assert_eq!(response.data, Some(json!({"tools": ["a", "b"]})));
    assert!(response.metadata.contains_key("processed_at"));

    let metrics = gw.pipeline.get_metrics(record.id).await.unwrap();
    assert_eq!(metrics.connection_success, 1);
    assert_eq!(metrics.request_count, 1);
    assert_eq!(metrics.error_count, 0);
    assert_eq!(metrics.methods.get("list_tools"), Some(&1));
    assert!(metrics.response_times.is_some());

    let tools = gw.pipeline.list_tools(record.id).await.unwrap();
    assert_eq!(tools, vec![json!("a"), json!("b")]);
    execute.assert_async().await;

    gw.pipeline.disconnect(record.id).await.unwrap();
    let stored = gw.store.load_backend(record.id).await.unwrap();
    assert_eq!(stored.status, BackendStatus::Active);
    assert!(stored.metadata.last_disconnection.is_some());
}

#[tokio::test]
async fn test_failed_health_check_marks_backend_error() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/health").with_status(503).create_async().await;

    let gw = gateway(GatewayConfig::default());
    let record = gw
        .pipeline
        .register_backend(http_record("flaky backend", "generic", &server.url()))
        .await
        .unwrap();

    let err = gw.pipeline.connect(record.id).await.unwrap_err();
    assert!(matches!(err, GatewayError::Provider(_)));

    let stored = gw.store.load_backend(record.id).await.unwrap();
    assert_eq!(stored.status, BackendStatus::Error);
    let message = stored.metadata.last_connection_error.unwrap();
    assert!(message.ends_with("Failed to connect to backend: 503"), "{message}");
    assert_eq!(gw.pipeline.get_metrics(record.id).await.unwrap().connection_failure, 1);
}

#[tokio::test]
async fn test_assistant_usage_and_user_context() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/health").with_status(200).create_async().await;
    let execute = server
        .mock("POST", "/execute")
        .match_header("x-api-version", "2024-06-01")
        .match_body(Matcher::PartialJson(json!({
            "params": {"user_context": {"user_id": "u-7", "session_id": null}}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"result": {"text": "hello", "usage": {"output_tokens": 5}}}"#)
        .create_async()
        .await;

    let gw = gateway(GatewayConfig::default());
    let record = http_record("assistant", "claude", &server.url())
        .with_configuration(json!({"api_version": "2024-06-01"}).as_object().cloned().unwrap());
    let record = gw.pipeline.register_backend(record).await.unwrap();
    gw.pipeline.connect(record.id).await.unwrap();

    let mut request = ProviderRequest::new("chat")
        .with_param("prompt", json!("hi"))
        .with_context(conduit_abstraction::RequestContext::for_user("u-7", None));
    let response = gw.pipeline.request(record.id, &mut request).await.unwrap();

    assert!(response.success);
    assert_eq!(response.metadata["usage"], json!({"output_tokens": 5}));
    execute.assert_async().await;
}

#[tokio::test]
async fn test_upstream_error_is_sanitized() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/health").with_status(200).create_async().await;
    server
        .mock("POST", "/execute")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "bad request token=abc123"}"#)
        .create_async()
        .await;

    let gw = gateway(GatewayConfig::default());
    let record = gw
        .pipeline
        .register_backend(http_record("sanitized", "generic", &server.url()))
        .await
        .unwrap();
    gw.pipeline.connect(record.id).await.unwrap();

    let mut request = ProviderRequest::new("search");
    let response = gw.pipeline.request(record.id, &mut request).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("bad request [REDACTED]"));
    assert_eq!(response.metadata["status_code"], json!(400));
    assert!(!request.context.should_retry);

    let metrics = gw.pipeline.get_metrics(record.id).await.unwrap();
    assert_eq!(metrics.error_count, 1);
}

#[tokio::test]
async fn test_custom_alias_routes_to_generic() {
    let mut server = mockito::Server::new_async().await;
    server.mock("GET", "/health").with_status(200).create_async().await;

    let mut config = GatewayConfig::default();
    config.providers.custom.insert("acme".to_string(), "generic".to_string());
    let gw = gateway(config);

    let record = gw
        .pipeline
        .register_backend(http_record("acme backend", "acme", &server.url()))
        .await
        .unwrap();
    let connected = gw.pipeline.connect(record.id).await.unwrap();
    assert_eq!(connected.status, BackendStatus::Active);
}
