//! Backend and request validation.
//!
//! Validation never fails fast: every check runs and all problems are
//! collected into [`ValidationErrors`], keyed by the field they concern.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use conduit_abstraction::{Authentication, BackendRecord, ProviderRequest};
use conduit_providers::ProviderRegistry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::GatewayConfig;

const NAME_MIN_CHARS: usize = 3;
const NAME_MAX_CHARS: usize = 255;
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];

static NAME_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9 _\-]+$").expect("name charset regex should be valid"));

/// Field name to the problems found with it. Empty means valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    /// No problems.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of fields with problems.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Records one problem for `field`.
    pub fn add(&mut self, field: &str, problem: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(problem.into());
    }

    /// Records several problems for `field`; nothing is recorded for an empty list.
    pub fn extend(&mut self, field: &str, problems: Vec<String>) {
        if !problems.is_empty() {
            self.0.entry(field.to_string()).or_default().extend(problems);
        }
    }

    /// Problems reported for `field`.
    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// Iterates fields and their problems in field order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(field, problems)| (field.as_str(), problems.as_slice()))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, problems) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{field}: {}", problems.join(", "))?;
        }
        Ok(())
    }
}

/// Checks a backend name's length and charset.
pub fn validate_name(name: &str) -> Vec<String> {
    if name.is_empty() {
        return vec!["Backend name is required".to_string()];
    }
    let mut problems = Vec::new();
    let chars = name.chars().count();
    if chars < NAME_MIN_CHARS {
        problems.push(format!("Backend name must be at least {NAME_MIN_CHARS} characters"));
    }
    if chars > NAME_MAX_CHARS {
        problems.push(format!("Backend name must not exceed {NAME_MAX_CHARS} characters"));
    }
    if !NAME_CHARSET.is_match(name) {
        problems.push(
            "Backend name can only contain alphanumeric characters, spaces, hyphens, and underscores"
                .to_string(),
        );
    }
    problems
}

/// Checks the fields an authentication scheme needs.
pub fn validate_authentication(auth: &Authentication) -> Vec<String> {
    fn missing(value: Option<&String>) -> bool {
        value.is_none_or(String::is_empty)
    }

    let mut problems = Vec::new();
    match auth {
        Authentication::None | Authentication::Custom(_) => {}
        Authentication::Bearer { token } => {
            if missing(token.as_ref()) {
                problems.push("Bearer token is required".to_string());
            }
        }
        Authentication::ApiKey { key, header_name } => {
            if missing(key.as_ref()) {
                problems.push("API key is required".to_string());
            }
            if missing(header_name.as_ref()) {
                problems.push("API key header name is required".to_string());
            }
        }
        Authentication::OAuth { client_id, client_secret, token_url } => {
            for (field, value) in
                [("client_id", client_id), ("client_secret", client_secret), ("token_url", token_url)]
            {
                if missing(value.as_ref()) {
                    problems.push(format!("OAuth {field} is required"));
                }
            }
        }
        Authentication::Unknown(kind) => {
            problems.push(format!("Unknown authentication type: {kind}"));
        }
    }
    problems
}

/// Checks one request's method, size and format.
pub fn validate_request(request: &ProviderRequest, max_request_bytes: usize) -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    if request.method.trim().is_empty() {
        errors.add("method", "Request method is required");
    }
    match serde_json::to_vec(request) {
        Ok(bytes) if bytes.len() > max_request_bytes => {
            errors.add("size", format!("Request size exceeds maximum allowed ({max_request_bytes} bytes)"));
        }
        Ok(_) => {}
        Err(e) => errors.add("format", format!("Invalid request format: {e}")),
    }
    errors
}

/// Validates backend records before they are connected.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    registry: Arc<ProviderRegistry>,
    allowed_domains: Vec<String>,
    blocked_domains: Vec<String>,
    max_config_bytes: usize,
}

impl ConfigValidator {
    /// Creates a validator using the security and limit settings in `config`.
    pub fn new(registry: Arc<ProviderRegistry>, config: &GatewayConfig) -> Self {
        Self {
            registry,
            allowed_domains: config.security.allowed_domains.clone(),
            blocked_domains: config.security.blocked_domains.clone(),
            max_config_bytes: config.limits.max_config_bytes,
        }
    }

    /// Runs every record-level check.
    pub async fn validate_backend(&self, record: &BackendRecord) -> ValidationErrors {
        let mut errors = ValidationErrors::new();
        errors.extend("name", validate_name(&record.name));
        errors.extend("endpoint", self.validate_endpoint(&record.endpoint));
        errors.extend("configuration", self.validate_configuration_size(record));
        errors.extend("authentication", validate_authentication(&record.authentication));
        errors.extend("provider", self.validate_provider(record).await);

        if !errors.is_empty() {
            debug!(backend = %record.name, backend_id = %record.id, errors = %errors, "Backend failed validation");
        }
        errors
    }

    /// Checks the endpoint URL and the domain lists.
    ///
    /// The allow-list and block-list are checked independently, so a host on
    /// both lists is rejected.
    pub fn validate_endpoint(&self, endpoint: &str) -> Vec<String> {
        if endpoint.is_empty() {
            return vec!["Endpoint URL is required".to_string()];
        }
        let url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => return vec![format!("Invalid endpoint URL: {e}")],
        };

        let mut problems = Vec::new();
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            problems.push("Endpoint scheme must be http, https, ws, or wss".to_string());
        }
        let host = url.host_str().unwrap_or_default();
        if host.is_empty() {
            problems.push("Endpoint must include a valid host".to_string());
        }
        if !self.allowed_domains.is_empty()
            && !self.allowed_domains.iter().any(|domain| in_domain(host, domain))
        {
            problems.push(format!("Endpoint domain not in allowed list: {host}"));
        }
        if self.blocked_domains.iter().any(|domain| in_domain(host, domain)) {
            problems.push(format!("Endpoint domain is blocked: {host}"));
        }
        problems
    }

    fn validate_configuration_size(&self, record: &BackendRecord) -> Vec<String> {
        match serde_json::to_vec(&record.configuration) {
            Ok(bytes) if bytes.len() > self.max_config_bytes => vec![format!(
                "Configuration size exceeds maximum allowed ({} bytes)",
                self.max_config_bytes
            )],
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("Invalid configuration format: {e}")],
        }
    }

    async fn validate_provider(&self, record: &BackendRecord) -> Vec<String> {
        let backend_type = record.backend_type.as_str();
        if backend_type.is_empty() {
            return vec!["Backend type is required".to_string()];
        }
        let Some(registration) = self.registry.get_provider(backend_type).await else {
            return vec![format!("Unknown provider type: {backend_type}")];
        };
        registration
            .descriptor
            .schema
            .missing_fields(&record.configuration)
            .into_iter()
            .map(|field| format!("Required field '{field}' missing for {backend_type} provider"))
            .collect()
    }
}

const SQL_PATTERNS: &[&str] = &["'; DROP TABLE", "' OR '1'='1", "UNION SELECT", "/*!"];
const SENSITIVE_NAMES: &[&str] = &["password", "secret", "token", "key", "credential"];

/// Request-level security checks.
#[derive(Debug, Clone, Default)]
pub struct SecurityChecker {
    blocked_methods: Vec<String>,
}

impl SecurityChecker {
    /// Creates a checker that rejects the given methods.
    pub fn new(blocked_methods: Vec<String>) -> Self {
        Self { blocked_methods }
    }

    /// Returns every security issue found in `request`.
    pub fn check_request(&self, request: &ProviderRequest) -> Vec<String> {
        let mut issues = Vec::new();
        if self.blocked_methods.iter().any(|m| m == &request.method) {
            issues.push(format!("Method '{}' is blocked", request.method));
        }

        let serialized = Value::Object(request.params.clone()).to_string().to_lowercase();
        for pattern in SQL_PATTERNS {
            if serialized.contains(&pattern.to_lowercase()) {
                issues.push(format!("Potential SQL injection detected: {pattern}"));
            }
        }

        sensitive_params(&request.params, "", &mut issues);
        issues
    }
}

fn sensitive_params(params: &serde_json::Map<String, Value>, prefix: &str, issues: &mut Vec<String>) {
    for (key, value) in params {
        let path = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        let lowered = key.to_lowercase();
        if is_truthy(value) && SENSITIVE_NAMES.iter().any(|name| lowered.contains(name)) {
            issues.push(format!("Potential sensitive data in parameter: {path}"));
        }
        if let Value::Object(nested) = value {
            sensitive_params(nested, &path, issues);
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Whether `host` is `domain` or one of its subdomains.
fn in_domain(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    host == domain || host.strip_suffix(domain.as_str()).is_some_and(|rest| rest.ends_with('.'))
}
