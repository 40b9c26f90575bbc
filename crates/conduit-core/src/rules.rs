//! Per-backend policy rules.
//!
//! Rules are stored data. Each rule names a [`RuleKind`] and carries an
//! untyped `actions` object; [`RuleDescriptor::policy`] parses that object
//! into a closed [`RulePolicy`]. [`EffectivePolicy`] folds a backend's active
//! rules over the global configuration.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_abstraction::BackendId;
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error_handler::{CircuitPolicy, RetryPolicy};
use crate::rate_limit::{CONNECT, REQUEST, RateLimit};

/// Category of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    /// Request size ceiling.
    RequestLimit,
    /// Response payload ceiling.
    ResponseSize,
    /// Default request timeout.
    Timeout,
    /// Retry policy.
    Retry,
    /// Circuit breaker policy.
    CircuitBreaker,
    /// Rate limit for one operation class.
    RateLimit,
}

/// When a rule applies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Restricts the rule to these request methods. Empty means every method.
    pub methods: Vec<String>,
}

impl RuleConditions {
    /// Whether a rule with these conditions applies to `method`.
    ///
    /// Connect-time evaluation passes `None`; method-restricted rules never
    /// apply there.
    pub fn applies_to(&self, method: Option<&str>) -> bool {
        match method {
            _ if self.methods.is_empty() => true,
            Some(method) => self.methods.iter().any(|m| m == method),
            None => false,
        }
    }
}

/// A parsed rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RulePolicy {
    /// Overrides the limit for one operation class.
    RateLimit {
        /// `connect` or `request`.
        operation: String,
        /// Calls allowed per window.
        max_requests: u64,
        /// Window length.
        window_secs: u64,
    },
    /// Overrides the retry policy.
    Retry {
        /// Retries before a failure is fatal.
        max_retries: u32,
        /// Backoff base.
        backoff_factor: f64,
    },
    /// Overrides the circuit breaker.
    CircuitBreaker {
        /// Fatal errors that trip the breaker.
        error_threshold: u64,
        /// Error window length.
        window_secs: u64,
    },
    /// Overrides the default request timeout.
    Timeout {
        /// Timeout in seconds.
        timeout_secs: u64,
    },
    /// Overrides the request size ceiling.
    RequestLimit {
        /// Maximum serialized request size.
        max_bytes: usize,
    },
    /// Caps the response payload size.
    ResponseSize {
        /// Maximum serialized payload size.
        max_bytes: usize,
    },
}

#[derive(Deserialize)]
struct RateLimitAction {
    operation: String,
    max_requests: u64,
    window_secs: u64,
}

#[derive(Deserialize)]
struct RetryAction {
    max_retries: u32,
    backoff_factor: f64,
}

#[derive(Deserialize)]
struct CircuitBreakerAction {
    error_threshold: u64,
    window_secs: u64,
}

#[derive(Deserialize)]
struct TimeoutAction {
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct SizeAction {
    max_bytes: usize,
}

fn default_true() -> bool {
    true
}

/// A named policy attached to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning backend.
    pub backend_id: BackendId,
    /// Human-readable name.
    pub name: String,
    /// Rule category.
    #[serde(rename = "type")]
    pub kind: RuleKind,
    /// Inactive rules are ignored.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// When the rule applies.
    #[serde(default)]
    pub conditions: RuleConditions,
    /// Kind-specific settings.
    #[serde(default)]
    pub actions: Value,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RuleDescriptor {
    /// Creates an active, unconditional rule.
    pub fn new(backend_id: BackendId, name: impl Into<String>, kind: RuleKind, actions: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id,
            name: name.into(),
            kind,
            is_active: true,
            conditions: RuleConditions::default(),
            actions,
            created_at: Utc::now(),
        }
    }

    /// Restricts the rule to the given methods.
    #[must_use]
    pub fn for_methods(mut self, methods: &[&str]) -> Self {
        self.conditions.methods = methods.iter().map(|m| (*m).to_string()).collect();
        self
    }

    /// Parses `actions` according to `kind`.
    ///
    /// # Errors
    /// Returns the deserialization error when `actions` lacks a field the kind
    /// needs, or when a rate-limit or circuit-breaker window is zero.
    pub fn policy(&self) -> Result<RulePolicy, serde_json::Error> {
        let actions = self.actions.clone();
        Ok(match self.kind {
            RuleKind::RateLimit => {
                let a: RateLimitAction = serde_json::from_value(actions)?;
                nonzero_window(a.window_secs)?;
                RulePolicy::RateLimit {
                    operation: a.operation,
                    max_requests: a.max_requests,
                    window_secs: a.window_secs,
                }
            }
            RuleKind::Retry => {
                let a: RetryAction = serde_json::from_value(actions)?;
                RulePolicy::Retry { max_retries: a.max_retries, backoff_factor: a.backoff_factor }
            }
            RuleKind::CircuitBreaker => {
                let a: CircuitBreakerAction = serde_json::from_value(actions)?;
                nonzero_window(a.window_secs)?;
                RulePolicy::CircuitBreaker {
                    error_threshold: a.error_threshold,
                    window_secs: a.window_secs,
                }
            }
            RuleKind::Timeout => {
                let a: TimeoutAction = serde_json::from_value(actions)?;
                RulePolicy::Timeout { timeout_secs: a.timeout_secs }
            }
            RuleKind::RequestLimit => {
                let a: SizeAction = serde_json::from_value(actions)?;
                RulePolicy::RequestLimit { max_bytes: a.max_bytes }
            }
            RuleKind::ResponseSize => {
                let a: SizeAction = serde_json::from_value(actions)?;
                RulePolicy::ResponseSize { max_bytes: a.max_bytes }
            }
        })
    }
}

fn nonzero_window(window_secs: u64) -> Result<(), serde_json::Error> {
    if window_secs == 0 {
        return Err(serde_json::Error::custom("window_secs must be greater than zero"));
    }
    Ok(())
}

/// Policy in force for one call, after rules are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    /// Connect rate limit.
    pub connect_limit: RateLimit,
    /// Request rate limit.
    pub request_limit: RateLimit,
    /// Retry policy.
    pub retry: RetryPolicy,
    /// Circuit breaker policy.
    pub circuit: CircuitPolicy,
    /// `timeout` param added to requests that carry none.
    pub default_timeout_secs: u64,
    /// Request size ceiling.
    pub max_request_bytes: usize,
    /// Response payload ceiling, if any.
    pub max_response_bytes: Option<usize>,
}

impl EffectivePolicy {
    /// The global policy from configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let limits = &config.rate_limits;
        Self {
            connect_limit: RateLimit::new(
                limits.connect_max,
                Duration::from_secs(limits.connect_window_secs),
            ),
            request_limit: RateLimit::new(
                limits.request_max,
                Duration::from_secs(limits.request_window_secs),
            ),
            retry: RetryPolicy {
                max_retries: config.retry.max_retries,
                backoff_factor: config.retry.backoff_factor,
            },
            circuit: CircuitPolicy {
                error_threshold: config.circuit_breaker.error_threshold,
                window: Duration::from_secs(config.circuit_breaker.window_secs),
            },
            default_timeout_secs: config.limits.default_request_timeout_secs,
            max_request_bytes: config.limits.max_request_bytes,
            max_response_bytes: None,
        }
    }

    /// Applies every active rule that matches `method`, in order.
    ///
    /// Malformed rules are logged and skipped.
    #[must_use]
    pub fn with_rules(mut self, rules: &[RuleDescriptor], method: Option<&str>) -> Self {
        for rule in rules.iter().filter(|r| r.is_active && r.conditions.applies_to(method)) {
            match rule.policy() {
                Ok(policy) => self.apply(rule, policy),
                Err(e) => {
                    warn!(rule = %rule.name, kind = ?rule.kind, error = %e, "Ignoring malformed rule");
                }
            }
        }
        self
    }

    fn apply(&mut self, rule: &RuleDescriptor, policy: RulePolicy) {
        match policy {
            RulePolicy::RateLimit { operation, max_requests, window_secs } => {
                let limit = RateLimit::new(max_requests, Duration::from_secs(window_secs));
                match operation.as_str() {
                    CONNECT => self.connect_limit = limit,
                    REQUEST => self.request_limit = limit,
                    other => {
                        warn!(rule = %rule.name, operation = %other, "Ignoring rate limit rule for unknown operation");
                    }
                }
            }
            RulePolicy::Retry { max_retries, backoff_factor } => {
                self.retry = RetryPolicy { max_retries, backoff_factor: backoff_factor.max(1.0) };
            }
            RulePolicy::CircuitBreaker { error_threshold, window_secs } => {
                self.circuit = CircuitPolicy {
                    error_threshold: error_threshold.max(1),
                    window: Duration::from_secs(window_secs),
                };
            }
            RulePolicy::Timeout { timeout_secs } => self.default_timeout_secs = timeout_secs,
            RulePolicy::RequestLimit { max_bytes } => self.max_request_bytes = max_bytes,
            RulePolicy::ResponseSize { max_bytes } => self.max_response_bytes = Some(max_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> BackendId {
        BackendId::new_random()
    }

    #[test]
    fn test_policy_parsing() {
        let rule = RuleDescriptor::new(backend(), "rl", RuleKind::RateLimit, json!({
            "operation": "request", "max_requests": 5, "window_secs": 10
        }));
        assert_eq!(
            rule.policy().unwrap(),
            RulePolicy::RateLimit { operation: "request".to_string(), max_requests: 5, window_secs: 10 }
        );

        let malformed = RuleDescriptor::new(backend(), "bad", RuleKind::Retry, json!({"max_retries": "x"}));
        assert!(malformed.policy().is_err());
    }

    #[test]
    fn test_rules_override_config() {
        let id = backend();
        let rules = vec![
            RuleDescriptor::new(id, "rl", RuleKind::RateLimit, json!({
                "operation": "connect", "max_requests": 2, "window_secs": 5
            })),
            RuleDescriptor::new(id, "retry", RuleKind::Retry, json!({"max_retries": 1, "backoff_factor": 3.0})),
            RuleDescriptor::new(id, "cb", RuleKind::CircuitBreaker, json!({"error_threshold": 2, "window_secs": 60})),
            RuleDescriptor::new(id, "timeout", RuleKind::Timeout, json!({"timeout_secs": 5})),
            RuleDescriptor::new(id, "size", RuleKind::ResponseSize, json!({"max_bytes": 64})),
            RuleDescriptor::new(id, "broken", RuleKind::RequestLimit, json!({})),
        ];

        let policy = EffectivePolicy::from_config(&GatewayConfig::default()).with_rules(&rules, Some("x"));
        assert_eq!(policy.connect_limit, RateLimit::new(2, Duration::from_secs(5)));
        assert_eq!(policy.request_limit, RateLimit::new(100, Duration::from_secs(60)));
        assert_eq!(policy.retry.max_retries, 1);
        assert_eq!(policy.circuit.error_threshold, 2);
        assert_eq!(policy.default_timeout_secs, 5);
        assert_eq!(policy.max_response_bytes, Some(64));
        // The malformed request limit leaves the default alone.
        assert_eq!(policy.max_request_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_zero_windows_rejected() {
        let id = backend();
        let rules = vec![
            RuleDescriptor::new(id, "rl", RuleKind::RateLimit, json!({
                "operation": "request", "max_requests": 5, "window_secs": 0
            })),
            RuleDescriptor::new(id, "cb", RuleKind::CircuitBreaker, json!({"error_threshold": 2, "window_secs": 0})),
        ];
        for rule in &rules {
            let err = rule.policy().unwrap_err();
            assert!(err.to_string().contains("window_secs must be greater than zero"));
        }

        let base = EffectivePolicy::from_config(&GatewayConfig::default());
        let policy = base.clone().with_rules(&rules, None);
        assert_eq!(policy.request_limit, base.request_limit);
        assert_eq!(policy.circuit, base.circuit);
    }

    #[test]
    fn test_method_conditions() {
        let id = backend();
        let rules = vec![
            RuleDescriptor::new(id, "t", RuleKind::Timeout, json!({"timeout_secs": 120}))
                .for_methods(&["export"]),
        ];
        let base = EffectivePolicy::from_config(&GatewayConfig::default());

        assert_eq!(base.clone().with_rules(&rules, Some("export")).default_timeout_secs, 120);
        assert_eq!(base.clone().with_rules(&rules, Some("search")).default_timeout_secs, 30);
        assert_eq!(base.with_rules(&rules, None).default_timeout_secs, 30);
    }

    #[test]
    fn test_inactive_rules_ignored() {
        let mut rule = RuleDescriptor::new(backend(), "t", RuleKind::Timeout, json!({"timeout_secs": 1}));
        rule.is_active = false;
        let policy = EffectivePolicy::from_config(&GatewayConfig::default()).with_rules(&[rule], None);
        assert_eq!(policy.default_timeout_secs, 30);
    }
}
