//! Backend records.
//!
//! A [`BackendRecord`] is the long-lived aggregate describing one configured
//! integration: which provider type handles it, where it lives, how it
//! authenticates, and the operational state the gateway maintains for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Identifies a configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(Uuid);

impl BackendId {
    /// Generates a new random backend identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`BackendId`] from an existing UUID (e.g. loaded from storage).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operational status of a backend.
///
/// `Pending` is the initial state. `Error` is left through
/// [`BackendRecord::reactivate`] or a successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendStatus {
    /// Configured but never connected.
    #[default]
    Pending,
    /// Last connect succeeded.
    Active,
    /// Deactivated by an operator.
    Inactive,
    /// Last connect failed or the circuit breaker tripped.
    Error,
}

impl BackendStatus {
    /// Get the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication settings for a backend, tagged by `type`.
///
/// Required fields are kept optional here so that an incomplete record still
/// deserializes and the validator can report exactly what is missing. An
/// unrecognised tag is preserved in [`Authentication::Unknown`] for the same
/// reason.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub enum Authentication {
    /// No authentication.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// The bearer token.
        token: Option<String>,
    },
    /// A static key sent in a named header.
    ApiKey {
        /// The API key.
        key: Option<String>,
        /// Header that carries the key.
        header_name: Option<String>,
    },
    /// OAuth client-credentials grant.
    OAuth {
        /// OAuth client id.
        client_id: Option<String>,
        /// OAuth client secret.
        client_secret: Option<String>,
        /// Token endpoint URL.
        token_url: Option<String>,
    },
    /// Provider-defined scheme; fields are passed through untouched.
    Custom(Map<String, Value>),
    /// A tag this gateway does not understand.
    Unknown(String),
}

impl Authentication {
    /// Returns the wire tag for this scheme.
    pub fn kind(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Bearer { .. } => "bearer",
            Self::ApiKey { .. } => "api_key",
            Self::OAuth { .. } => "oauth",
            Self::Custom(_) => "custom",
            Self::Unknown(kind) => kind,
        }
    }

    /// Returns the bearer token, if this is a bearer scheme with a non-empty token.
    pub fn bearer_token(&self) -> Option<&str> {
        match self {
            Self::Bearer { token: Some(token) } if !token.is_empty() => Some(token),
            _ => None,
        }
    }
}

fn string_field(map: &Map<String, Value>, field: &str) -> Option<String> {
    map.get(field).and_then(Value::as_str).map(str::to_string)
}

impl From<Map<String, Value>> for Authentication {
    fn from(mut map: Map<String, Value>) -> Self {
        let kind = map.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            None | Some("none" | "") => Self::None,
            Some("bearer") => Self::Bearer { token: string_field(&map, "token") },
            Some("api_key") => Self::ApiKey {
                key: string_field(&map, "key"),
                header_name: string_field(&map, "header_name"),
            },
            Some("oauth") => Self::OAuth {
                client_id: string_field(&map, "client_id"),
                client_secret: string_field(&map, "client_secret"),
                token_url: string_field(&map, "token_url"),
            },
            Some("custom") => {
                map.remove("type");
                Self::Custom(map)
            }
            Some(other) => Self::Unknown(other.to_string()),
        }
    }
}

fn put(map: &mut Map<String, Value>, field: &str, value: Option<String>) {
    if let Some(value) = value {
        map.insert(field.to_string(), Value::String(value));
    }
}

impl From<Authentication> for Map<String, Value> {
    fn from(auth: Authentication) -> Self {
        let mut map = Map::new();
        match auth {
            Authentication::None => put(&mut map, "type", Some("none".to_string())),
            Authentication::Bearer { token } => {
                put(&mut map, "type", Some("bearer".to_string()));
                put(&mut map, "token", token);
            }
            Authentication::ApiKey { key, header_name } => {
                put(&mut map, "type", Some("api_key".to_string()));
                put(&mut map, "key", key);
                put(&mut map, "header_name", header_name);
            }
            Authentication::OAuth { client_id, client_secret, token_url } => {
                put(&mut map, "type", Some("oauth".to_string()));
                put(&mut map, "client_id", client_id);
                put(&mut map, "client_secret", client_secret);
                put(&mut map, "token_url", token_url);
            }
            Authentication::Custom(fields) => {
                map.extend(fields);
                map.insert("type".to_string(), Value::String("custom".to_string()));
            }
            Authentication::Unknown(kind) => put(&mut map, "type", Some(kind)),
        }
        map
    }
}

/// Operational annotations maintained by the gateway pipeline.
///
/// Request handlers never write these directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendMetadata {
    /// When the last connect attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_attempt: Option<DateTime<Utc>>,
    /// When the last connect succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    /// Message of the last connect failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_error: Option<String>,
    /// When the last connect failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_error_at: Option<DateTime<Utc>>,
    /// When the backend was last disconnected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disconnection: Option<DateTime<Utc>>,
    /// When the circuit breaker last quarantined the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_tripped_at: Option<DateTime<Utc>>,
    /// Free-form annotations (e.g. written by `annotate` hooks).
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// One configured backend integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRecord {
    /// Unique identifier.
    pub id: BackendId,
    /// Human-readable name, unique per owner.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Opaque owner reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Registered provider type handling this backend (e.g. `"generic"`).
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Network address of the backend.
    pub endpoint: String,
    /// Provider-specific configuration; shape is defined by the provider schema.
    #[serde(default)]
    pub configuration: Map<String, Value>,
    /// Authentication settings.
    #[serde(default)]
    pub authentication: Authentication,
    /// Operational status.
    #[serde(default)]
    pub status: BackendStatus,
    /// Gateway-maintained annotations.
    #[serde(default)]
    pub metadata: BackendMetadata,
    /// Administrative on/off switch, independent of `status`.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl BackendRecord {
    /// Creates a new pending, active backend record.
    pub fn new(
        name: impl Into<String>,
        backend_type: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: BackendId::new_random(),
            name: name.into(),
            description: String::new(),
            owner: None,
            backend_type: backend_type.into(),
            endpoint: endpoint.into(),
            configuration: Map::new(),
            authentication: Authentication::None,
            status: BackendStatus::Pending,
            metadata: BackendMetadata::default(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Sets the provider configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: Map<String, Value>) -> Self {
        self.configuration = configuration;
        self
    }

    /// Sets the authentication scheme.
    #[must_use]
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Sets the owner reference.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Fills an empty endpoint and missing configuration keys from defaults.
    ///
    /// Keys already present in `configuration` are never overwritten.
    pub fn apply_defaults(&mut self, endpoint: Option<&str>, configuration: &Map<String, Value>) {
        if self.endpoint.is_empty() {
            if let Some(endpoint) = endpoint {
                self.endpoint = endpoint.to_string();
            }
        }
        for (key, value) in configuration {
            self.configuration.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    /// Records the start of a connect attempt.
    pub fn mark_connect_attempt(&mut self, at: DateTime<Utc>) {
        self.metadata.last_connection_attempt = Some(at);
    }

    /// Records a successful connect. A live session closes any earlier trip.
    pub fn mark_connected(&mut self, at: DateTime<Utc>) {
        self.status = BackendStatus::Active;
        self.metadata.last_successful_connection = Some(at);
        self.metadata.circuit_breaker_tripped_at = None;
    }

    /// Records a failed connect.
    pub fn mark_connect_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = BackendStatus::Error;
        self.metadata.last_connection_error = Some(error.into());
        self.metadata.last_connection_error_at = Some(at);
    }

    /// Records a disconnect.
    pub fn mark_disconnected(&mut self, at: DateTime<Utc>) {
        self.metadata.last_disconnection = Some(at);
    }

    /// Quarantines the backend after sustained failures.
    pub fn trip_circuit(&mut self, at: DateTime<Utc>) {
        self.status = BackendStatus::Error;
        self.metadata.circuit_breaker_tripped_at = Some(at);
    }

    /// Operator deactivation: `Active` becomes `Inactive`; other states are left alone.
    pub fn deactivate(&mut self) {
        if self.status == BackendStatus::Active {
            self.status = BackendStatus::Inactive;
        }
    }

    /// Operator reactivation out of `Error`, back to `Pending`.
    pub fn reactivate(&mut self) {
        if self.status == BackendStatus::Error {
            self.status = BackendStatus::Pending;
            self.metadata.circuit_breaker_tripped_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_is_pending_and_active() {
        let record = BackendRecord::new("svc", "generic", "https://api.example.com");
        assert_eq!(record.status, BackendStatus::Pending);
        assert!(record.is_active);
        assert!(record.metadata.last_connection_attempt.is_none());
    }

    #[test]
    fn test_authentication_from_json() {
        let auth: Authentication =
            serde_json::from_value(json!({"type": "bearer", "token": "t"})).unwrap();
        assert_eq!(auth, Authentication::Bearer { token: Some("t".to_string()) });
        assert_eq!(auth.bearer_token(), Some("t"));

        let auth: Authentication = serde_json::from_value(json!({"type": "kerberos"})).unwrap();
        assert_eq!(auth, Authentication::Unknown("kerberos".to_string()));

        let auth: Authentication = serde_json::from_value(json!({})).unwrap();
        assert_eq!(auth, Authentication::None);
    }

    #[test]
    fn test_custom_authentication_keeps_fields() {
        let auth: Authentication =
            serde_json::from_value(json!({"type": "custom", "realm": "corp"})).unwrap();
        let Authentication::Custom(fields) = &auth else {
            panic!("Expected custom authentication");
        };
        assert_eq!(fields.get("realm"), Some(&json!("corp")));

        let back = serde_json::to_value(&auth).unwrap();
        assert_eq!(back, json!({"type": "custom", "realm": "corp"}));
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: BackendRecord = serde_json::from_value(json!({
            "id": "7b0c1f6e-2a7e-4a39-9b9a-4f4b8f0e2c11",
            "name": "svc",
            "type": "generic",
            "endpoint": "https://api.example.com",
            "authentication": {"type": "bearer", "token": "t"}
        }))
        .unwrap();
        assert_eq!(record.status, BackendStatus::Pending);
        assert!(record.is_active);
        assert_eq!(record.backend_type, "generic");
    }

    #[test]
    fn test_status_transitions() {
        let mut record = BackendRecord::new("svc", "generic", "https://api.example.com");
        let now = Utc::now();

        record.mark_connected(now);
        assert_eq!(record.status, BackendStatus::Active);

        record.deactivate();
        assert_eq!(record.status, BackendStatus::Inactive);

        record.mark_connect_failed("boom", now);
        assert_eq!(record.status, BackendStatus::Error);
        assert_eq!(record.metadata.last_connection_error.as_deref(), Some("boom"));

        // Deactivation does not leave the error state.
        record.deactivate();
        assert_eq!(record.status, BackendStatus::Error);

        record.reactivate();
        assert_eq!(record.status, BackendStatus::Pending);
    }

    #[test]
    fn test_connect_clears_trip_stamp() {
        let mut record = BackendRecord::new("svc", "generic", "https://api.example.com");
        let now = Utc::now();
        record.trip_circuit(now - chrono::Duration::hours(2));
        assert_eq!(record.status, BackendStatus::Error);

        record.mark_connected(now);
        assert_eq!(record.status, BackendStatus::Active);
        assert!(record.metadata.circuit_breaker_tripped_at.is_none());
        assert_eq!(record.metadata.last_successful_connection, Some(now));
    }

    #[test]
    fn test_apply_defaults_keeps_existing_values() {
        let mut record = BackendRecord::new("svc", "claude", "")
            .with_configuration(json!({"model": "custom"}).as_object().cloned().unwrap());
        let defaults = json!({"model": "default", "api_version": "2024-01-01"});
        record.apply_defaults(Some("https://api.example.com"), defaults.as_object().unwrap());

        assert_eq!(record.endpoint, "https://api.example.com");
        assert_eq!(record.configuration.get("model"), Some(&json!("custom")));
        assert_eq!(record.configuration.get("api_version"), Some(&json!("2024-01-01")));
    }
}
