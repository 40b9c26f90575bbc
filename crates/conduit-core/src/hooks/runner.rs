//! Executes hook descriptors at each lifecycle point.

use conduit_abstraction::{BackendRecord, BackendStatus, ProviderRequest, ProviderResponse};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::types::{HookAction, HookDescriptor, HookPoint};
use crate::config::HooksConfig;
use crate::error::{GatewayError, Result};

/// Interprets [`HookAction`]s for the pipeline.
#[derive(Debug, Clone, Default)]
pub struct HookRunner {
    config: HooksConfig,
}

impl HookRunner {
    /// Creates a runner with the given settings.
    pub fn new(config: HooksConfig) -> Self {
        Self { config }
    }

    /// Active hooks for `point`, lowest priority first, ties in creation order.
    pub fn ordered<'a>(&self, hooks: &'a [HookDescriptor], point: HookPoint) -> Vec<&'a HookDescriptor> {
        if !self.config.runs(point) {
            return Vec::new();
        }
        let mut selected: Vec<&HookDescriptor> =
            hooks.iter().filter(|hook| hook.is_active && hook.point == point).collect();
        selected.sort_by_key(|hook| (hook.priority, hook.created_at));
        selected
    }

    /// Runs PRE_CONNECT hooks.
    ///
    /// A `require_active` hook rejects a backend that is `INACTIVE`, or in
    /// `ERROR` unless this connect is a recovery attempt.
    pub fn pre_connect(
        &self,
        hooks: &[HookDescriptor],
        record: &BackendRecord,
        recovery_attempt: bool,
    ) -> Result<()> {
        for hook in self.ordered(hooks, HookPoint::PreConnect) {
            match &hook.action {
                HookAction::RequireActive => {
                    let refused = match record.status {
                        BackendStatus::Inactive => true,
                        BackendStatus::Error => !recovery_attempt,
                        BackendStatus::Pending | BackendStatus::Active => false,
                    };
                    if refused {
                        return Err(GatewayError::HookRejected {
                            hook: hook.name.clone(),
                            reason: format!("backend {} is in {} state", record.name, record.status),
                        });
                    }
                }
                HookAction::Log { message } => log_hook(hook, record, message),
                other => not_applicable(hook, other),
            }
        }
        Ok(())
    }

    /// Runs POST_CONNECT hooks. `annotate` merges into the backend's metadata.
    pub fn post_connect(&self, hooks: &[HookDescriptor], record: &mut BackendRecord) {
        for hook in self.ordered(hooks, HookPoint::PostConnect) {
            match &hook.action {
                HookAction::Annotate { values } => merge(&mut record.metadata.extra, values),
                HookAction::Log { message } => log_hook(hook, record, message),
                other => not_applicable(hook, other),
            }
        }
    }

    /// Runs VALIDATION hooks and returns the problems they found.
    pub fn validate(
        &self,
        hooks: &[HookDescriptor],
        record: &BackendRecord,
        request: &ProviderRequest,
    ) -> Vec<String> {
        let mut problems = Vec::new();
        for hook in self.ordered(hooks, HookPoint::Validation) {
            match &hook.action {
                HookAction::BlockMethods { methods } => {
                    if methods.iter().any(|m| m == &request.method) {
                        problems.push(format!(
                            "Method '{}' is blocked by hook '{}'",
                            request.method, hook.name
                        ));
                    }
                }
                HookAction::RequireParams { params } => {
                    problems.extend(
                        params
                            .iter()
                            .filter(|param| !request.params.contains_key(param.as_str()))
                            .map(|param| {
                                format!("Parameter '{param}' is required by hook '{}'", hook.name)
                            }),
                    );
                }
                HookAction::Log { message } => log_hook(hook, record, message),
                other => not_applicable(hook, other),
            }
        }
        problems
    }

    /// Runs PRE_REQUEST hooks. `default_params` fills missing params.
    pub fn pre_request(
        &self,
        hooks: &[HookDescriptor],
        record: &BackendRecord,
        request: &mut ProviderRequest,
    ) {
        for hook in self.ordered(hooks, HookPoint::PreRequest) {
            match &hook.action {
                HookAction::DefaultParams { params } => {
                    for (key, value) in params {
                        request.params.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                HookAction::Log { message } => log_hook(hook, record, message),
                other => not_applicable(hook, other),
            }
        }
    }

    /// Runs POST_REQUEST or ERROR hooks. `annotate` merges into response metadata.
    pub fn on_response(
        &self,
        hooks: &[HookDescriptor],
        point: HookPoint,
        record: &BackendRecord,
        response: &mut ProviderResponse,
    ) {
        for hook in self.ordered(hooks, point) {
            match &hook.action {
                HookAction::Annotate { values } => merge(&mut response.metadata, values),
                HookAction::Log { message } => log_hook(hook, record, message),
                other => not_applicable(hook, other),
            }
        }
    }
}

fn merge(target: &mut Map<String, Value>, values: &Map<String, Value>) {
    for (key, value) in values {
        target.insert(key.clone(), value.clone());
    }
}

fn log_hook(hook: &HookDescriptor, record: &BackendRecord, message: &str) {
    info!(
        hook = %hook.name,
        point = %hook.point,
        backend_id = %record.id,
        backend = %record.name,
        "{message}"
    );
}

fn not_applicable(hook: &HookDescriptor, action: &HookAction) {
    debug!(
        hook = %hook.name,
        point = %hook.point,
        action = action.name(),
        "Hook action does not apply at this point, skipping"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> BackendRecord {
        BackendRecord::new("svc", "mock", "http://localhost:9000")
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_ordering_by_priority_then_creation() {
        let backend = record();
        let late_low = HookDescriptor::new(backend.id, "b", HookPoint::PreRequest, HookAction::Log {
            message: String::new(),
        })
        .with_priority(-5);
        let first = HookDescriptor::new(backend.id, "c", HookPoint::PreRequest, HookAction::Log {
            message: String::new(),
        });
        let mut second = first.clone();
        second.name = "d".to_string();
        second.created_at = first.created_at + chrono::Duration::milliseconds(1);
        let mut inactive = first.clone();
        inactive.name = "off".to_string();
        inactive.is_active = false;

        let hooks = vec![second, inactive, first, late_low];
        let runner = HookRunner::default();
        let names: Vec<&str> =
            runner.ordered(&hooks, HookPoint::PreRequest).iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_disabled_point_skips_hooks() {
        let backend = record();
        let hooks = vec![HookDescriptor::new(
            backend.id,
            "defaults",
            HookPoint::PreRequest,
            HookAction::DefaultParams { params: map(json!({"limit": 10})) },
        )];
        let runner = HookRunner::new(HooksConfig {
            enabled: true,
            disabled_points: vec![HookPoint::PreRequest],
        });
        let mut request = ProviderRequest::new("search");
        runner.pre_request(&hooks, &backend, &mut request);
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_default_params_keep_existing() {
        let backend = record();
        let hooks = vec![HookDescriptor::new(
            backend.id,
            "defaults",
            HookPoint::PreRequest,
            HookAction::DefaultParams { params: map(json!({"limit": 10, "q": "default"})) },
        )];
        let mut request = ProviderRequest::new("search").with_param("q", json!("mine"));
        HookRunner::default().pre_request(&hooks, &backend, &mut request);
        assert_eq!(request.params["q"], json!("mine"));
        assert_eq!(request.params["limit"], json!(10));
    }

    #[test]
    fn test_validation_hooks() {
        let backend = record();
        let hooks = vec![
            HookDescriptor::new(backend.id, "no-drop", HookPoint::Validation, HookAction::BlockMethods {
                methods: vec!["drop".to_string()],
            }),
            HookDescriptor::new(backend.id, "need-q", HookPoint::Validation, HookAction::RequireParams {
                params: vec!["q".to_string()],
            }),
        ];
        let runner = HookRunner::default();

        let problems = runner.validate(&hooks, &backend, &ProviderRequest::new("drop"));
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("'drop' is blocked"));

        let ok = ProviderRequest::new("search").with_param("q", json!("x"));
        assert!(runner.validate(&hooks, &backend, &ok).is_empty());
    }

    #[test]
    fn test_require_active_rejects_error_and_inactive() {
        let mut backend = record();
        let hooks =
            vec![HookDescriptor::new(backend.id, "guard", HookPoint::PreConnect, HookAction::RequireActive)];
        let runner = HookRunner::default();
        assert!(runner.pre_connect(&hooks, &backend, false).is_ok());

        backend.status = BackendStatus::Error;
        assert!(matches!(
            runner.pre_connect(&hooks, &backend, false),
            Err(GatewayError::HookRejected { hook, .. }) if hook == "guard"
        ));
        assert!(runner.pre_connect(&hooks, &backend, true).is_ok());

        backend.status = BackendStatus::Inactive;
        assert!(runner.pre_connect(&hooks, &backend, true).is_err());
    }

    #[test]
    fn test_annotate_targets() {
        let mut backend = record();
        let hooks = vec![
            HookDescriptor::new(backend.id, "tag", HookPoint::PostConnect, HookAction::Annotate {
                values: map(json!({"region": "eu"})),
            }),
            HookDescriptor::new(backend.id, "tag-error", HookPoint::Error, HookAction::Annotate {
                values: map(json!({"alerted": true})),
            }),
        ];
        let runner = HookRunner::default();

        runner.post_connect(&hooks, &mut backend);
        assert_eq!(backend.metadata.extra["region"], json!("eu"));

        let mut response = ProviderResponse::failure("boom");
        runner.on_response(&hooks, HookPoint::PostRequest, &backend, &mut response);
        assert!(response.metadata.get("alerted").is_none());
        runner.on_response(&hooks, HookPoint::Error, &backend, &mut response);
        assert_eq!(response.metadata["alerted"], json!(true));
    }
}
