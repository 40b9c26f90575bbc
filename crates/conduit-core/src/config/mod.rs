//! Gateway configuration.
//!
//! Configuration is read from an optional TOML file and then overridden by
//! environment variables prefixed with `CONDUIT_`, using `__` between
//! nested keys:
//!
//! ```text
//! CONDUIT_RETRY__MAX_RETRIES=5
//! CONDUIT_SECURITY__BLOCKED_METHODS=drop_database,shutdown
//! ```
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::hooks::HookPoint;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CONDUIT";

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: &[&str] = &[
    "security.blocked_methods",
    "security.allowed_domains",
    "security.blocked_domains",
    "hooks.disabled_points",
];

/// Errors raised while loading or checking configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file or environment could not be read or deserialized.
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A TOML document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

/// Per-backend rate limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// Connect attempts allowed per window.
    pub connect_max: u64,
    /// Connect window length.
    pub connect_window_secs: u64,
    /// Requests allowed per window.
    pub request_max: u64,
    /// Request window length.
    pub request_window_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self { connect_max: 10, connect_window_secs: 60, request_max: 100, request_window_secs: 60 }
    }
}

/// Size and timeout ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum serialized size of a backend's configuration.
    pub max_config_bytes: usize,
    /// Maximum serialized size of a request.
    pub max_request_bytes: usize,
    /// `timeout` param added to requests that carry none.
    pub default_request_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_config_bytes: 1024 * 1024,
            max_request_bytes: 10 * 1024 * 1024,
            default_request_timeout_secs: 30,
        }
    }
}

/// Retry policy for retryable request failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries scheduled before a failure is treated as fatal.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_factor ^ n` seconds.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, backoff_factor: 2.0 }
    }
}

/// Circuit breaker policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Fatal errors inside the window that trip the breaker.
    pub error_threshold: u64,
    /// Error window length.
    pub window_secs: u64,
    /// Refuse connects and requests to a backend in `ERROR`. Off by default:
    /// a trip only changes the backend's status and callers decide.
    pub quarantine: bool,
    /// With `quarantine` on, a tripped backend may be retried after this long.
    pub cooldown_secs: Option<u64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { error_threshold: 10, window_secs: 300, quarantine: false, cooldown_secs: None }
    }
}

/// Metrics retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How long counters live after their last write.
    pub window_secs: u64,
    /// Response-time samples kept per backend.
    pub max_timing_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { window_secs: 3600, max_timing_samples: 100 }
    }
}

/// Request and endpoint security lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Methods no request may call.
    pub blocked_methods: Vec<String>,
    /// When non-empty, endpoint hosts must end with one of these.
    pub allowed_domains: Vec<String>,
    /// Endpoint hosts ending with one of these are rejected.
    pub blocked_domains: Vec<String>,
}

/// Switches for optional pipeline stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Enforce rate limits.
    pub rate_limiting: bool,
    /// Count fatal errors and trip the breaker.
    pub circuit_breaker: bool,
    /// Apply request/response transforms.
    pub request_transformation: bool,
    /// Record metrics.
    pub metrics_collection: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            rate_limiting: true,
            circuit_breaker: true,
            request_transformation: true,
            metrics_collection: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Log a summary of every response at debug level.
    pub log_responses: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "conduit_core=debug,info".to_string(), format: LogFormat::Pretty, log_responses: false }
    }
}

/// Defaults applied to new backends of one provider type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderDefaults {
    /// Endpoint used when a record has none.
    pub endpoint: Option<String>,
    /// Configuration keys added when missing.
    pub configuration: Map<String, Value>,
}

/// Provider catalog settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Extra type names mapped to a registered type (`acme = "generic"`).
    pub custom: BTreeMap<String, String>,
    /// Per-type defaults.
    pub defaults: BTreeMap<String, ProviderDefaults>,
}

/// Hook execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Master switch for all hooks.
    pub enabled: bool,
    /// Lifecycle points whose hooks are skipped.
    pub disabled_points: Vec<HookPoint>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self { enabled: default_true(), disabled_points: Vec::new() }
    }
}

impl HooksConfig {
    /// Whether hooks attached to `point` should run.
    pub fn runs(&self, point: HookPoint) -> bool {
        self.enabled && !self.disabled_points.contains(&point)
    }
}

/// Root configuration for the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Rate limits.
    pub rate_limits: RateLimitsConfig,
    /// Size and timeout ceilings.
    pub limits: LimitsConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Circuit breaker policy.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Metrics retention.
    pub metrics: MetricsConfig,
    /// Security lists.
    pub security: SecurityConfig,
    /// Stage switches.
    pub features: FeatureFlags,
    /// Logging setup.
    pub logging: LoggingConfig,
    /// Provider catalog settings.
    pub providers: ProvidersConfig,
    /// Hook execution settings.
    pub hooks: HooksConfig,
}

impl GatewayConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from an optional TOML file and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a value has the wrong
    /// type, or [`GatewayConfig::validate`] rejects the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, Self::environment())
    }

    /// Like [`GatewayConfig::load`] with an explicit environment source.
    pub fn load_with_env(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(environment);

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// The environment source used by [`GatewayConfig::load`].
    pub fn environment() -> Environment {
        LIST_KEYS.iter().fold(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
            |env, key| env.with_list_parse_key(key),
        )
    }

    /// Parses a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects values that would disable a stage by accident.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("rate_limits.connect_window_secs", self.rate_limits.connect_window_secs),
            ("rate_limits.request_window_secs", self.rate_limits.request_window_secs),
            ("circuit_breaker.window_secs", self.circuit_breaker.window_secs),
            ("circuit_breaker.error_threshold", self.circuit_breaker.error_threshold),
            ("metrics.window_secs", self.metrics.window_secs),
            ("limits.default_request_timeout_secs", self.limits.default_request_timeout_secs),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{key} must be greater than zero")));
        }
        if self.retry.backoff_factor < 1.0 || !self.retry.backoff_factor.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_factor must be at least 1, got {}",
                self.retry.backoff_factor
            )));
        }
        if self.metrics.max_timing_samples == 0 {
            return Err(ConfigError::Invalid(
                "metrics.max_timing_samples must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Lifetime of every metrics counter.
    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics.window_secs)
    }

    /// How long a quarantined backend waits before a recovery attempt, if quarantine is on.
    pub fn circuit_breaker_cooldown(&self) -> Option<Duration> {
        self.circuit_breaker.cooldown_secs.map(Duration::from_secs)
    }
}
