//! # Bus Configuration
//!
//! Two layers:
//!
//! - [`RawBusConfig`]: the `[messaging]` TOML table as written, with every key
//!   optional and environment overrides applied on top.
//! - [`BusConfig`]: the resolved value the bus consumes. Intervals are
//!   clamped, the transport kind and auth method are known variants, and the
//!   address is parsed into an [`EndpointSet`].
//!
//! ## Example
//!
//! ```toml
//! [messaging]
//! enabled = true
//! type = "kv-pubsub"
//! address = ["redis-a:6379", "redis-b:6379"]
//! polling-interval = 1000
//! cleanup-interval = 30000
//! auth-method = "password"
//! password = "secret"
//!
//! [messaging.ssl]
//! enabled = false
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{ConfigurationError, EndpointSet};
use tracing::warn;

/// Smallest allowed cleanup interval in milliseconds.
pub const MIN_CLEANUP_INTERVAL_MS: u64 = 10_000;

/// Default polling interval in milliseconds.
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1_000;

/// Default cleanup interval in milliseconds.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 30_000;

/// Prefix of the environment overrides.
pub const ENV_PREFIX: &str = "BUS_MESSAGING_";

/// The transport a bus runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Shared relational store, polled.
    #[default]
    Store,
    /// Redis-protocol pub/sub.
    KvPubsub,
    /// AMQP broker.
    Amqp,
    /// NATS-protocol pub/sub.
    LightweightPubsub,
    /// Host-provided point-to-point channel.
    HostLocal,
}

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        Self::Store,
        Self::KvPubsub,
        Self::Amqp,
        Self::LightweightPubsub,
        Self::HostLocal,
    ];

    /// Canonical configuration name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::KvPubsub => "kv-pubsub",
            Self::Amqp => "amqp",
            Self::LightweightPubsub => "lightweight-pubsub",
            Self::HostLocal => "host-local",
        }
    }

    /// Match a canonical name or a broker alias, case-insensitively.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_lowercase().replace('_', "-");
        let kind = match normalized.as_str() {
            "store" | "database" | "sql" => Self::Store,
            "kv-pubsub" | "redis" => Self::KvPubsub,
            "amqp" | "rabbitmq" => Self::Amqp,
            "lightweight-pubsub" | "nats" => Self::LightweightPubsub,
            "host-local" | "plugin" | "plugin-messaging" => Self::HostLocal,
            _ => return None,
        };
        Some(kind)
    }

    /// Like [`TransportKind::from_name`] but unknown names fall back to
    /// [`TransportKind::Store`].
    #[must_use]
    pub fn from_name_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            warn!(
                transport = name,
                fallback = Self::Store.as_str(),
                "Unknown messaging type, falling back"
            );
            Self::Store
        })
    }

    /// Broker port used when an endpoint has none.
    #[must_use]
    pub fn default_port(&self, tls: bool) -> Option<u16> {
        match self {
            Self::KvPubsub => Some(6379),
            Self::Amqp if tls => Some(5671),
            Self::Amqp => Some(5672),
            Self::LightweightPubsub => Some(4222),
            Self::Store | Self::HostLocal => None,
        }
    }

    /// Whether this transport talks to a network broker.
    #[must_use]
    pub fn is_networked(&self) -> bool {
        matches!(
            self,
            Self::KvPubsub | Self::Amqp | Self::LightweightPubsub
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| ConfigurationError::InvalidValue {
            key: "type".to_string(),
            reason: format!("unknown messaging type {s:?}"),
        })
    }
}

/// How broker credentials are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Username and password.
    #[default]
    Password,
    /// A bearer token.
    Token,
}

impl AuthMethod {
    /// Parse leniently; unknown values fall back to `Password`.
    #[must_use]
    pub fn from_name_or_default(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "password" | "" => Self::Password,
            "token" => Self::Token,
            other => {
                warn!(auth_method = other, "Unknown auth method, using password");
                Self::Password
            }
        }
    }
}

/// AMQP-only settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    /// Virtual host on the broker.
    pub virtual_host: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            virtual_host: "/".to_string(),
        }
    }
}

/// NATS-only credential files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightweightSettings {
    /// NKey seed file.
    pub nkey_seed_path: Option<PathBuf>,
    /// User JWT file, used together with the seed.
    pub jwt_file_path: Option<PathBuf>,
    /// Combined `.creds` file; wins over the two above.
    pub credentials_path: Option<PathBuf>,
}

// ============================================================================
// RAW (FILE/ENV) LAYER
// ============================================================================

/// `[messaging.ssl]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawSsl {
    pub enabled: bool,
}

/// `[messaging.amqp]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawAmqp {
    pub virtual_host: String,
}

impl Default for RawAmqp {
    fn default() -> Self {
        Self {
            virtual_host: "/".to_string(),
        }
    }
}

/// `[messaging.lightweight-pubsub]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawLightweight {
    pub nkey_seed_path: String,
    pub jwt_file_path: String,
    pub credentials_path: String,
}

/// The `[messaging]` table as written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RawBusConfig {
    pub enabled: bool,
    /// Milliseconds between store polls.
    pub polling_interval: u64,
    /// Milliseconds of retention for store rows.
    pub cleanup_interval: u64,
    #[serde(rename = "type")]
    pub transport_type: String,
    /// A string or a list of strings.
    pub address: Option<Value>,
    pub username: String,
    pub password: String,
    pub auth_method: String,
    pub auth_token: String,
    pub ssl: RawSsl,
    pub amqp: RawAmqp,
    pub lightweight_pubsub: RawLightweight,
}

impl Default for RawBusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: DEFAULT_POLLING_INTERVAL_MS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_MS,
            transport_type: TransportKind::Store.as_str().to_string(),
            address: None,
            username: String::new(),
            password: String::new(),
            auth_method: "password".to_string(),
            auth_token: String::new(),
            ssl: RawSsl::default(),
            amqp: RawAmqp::default(),
            lightweight_pubsub: RawLightweight::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDocument {
    messaging: RawBusConfig,
}

impl RawBusConfig {
    /// Parse a TOML document and take its `[messaging]` table.
    ///
    /// A document without the table yields the defaults.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::Parse` for invalid TOML or mistyped keys.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str::<ConfigDocument>(text)
            .map(|doc| doc.messaging)
            .map_err(|e| ConfigurationError::Parse(e.to_string()))
    }

    /// Apply `BUS_MESSAGING_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides using `lookup` to read variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_MESSAGING_ENABLED`: `true`/`1` or `false`/`0`
    /// - `BUS_MESSAGING_TYPE`: transport name or alias
    /// - `BUS_MESSAGING_ADDRESS`: comma separated `host[:port]` list
    /// - `BUS_MESSAGING_USERNAME`, `BUS_MESSAGING_PASSWORD`, `BUS_MESSAGING_AUTH_TOKEN`
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("ENABLED") {
            let v = v.trim().to_lowercase();
            self.enabled = v == "true" || v == "1";
        }
        if let Some(v) = var("TYPE") {
            self.transport_type = v;
        }
        if let Some(v) = var("ADDRESS") {
            let addresses: Vec<Value> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| Value::String(s.to_string()))
                .collect();
            self.address = Some(Value::Array(addresses));
        }
        if let Some(v) = var("USERNAME") {
            self.username = v;
        }
        if let Some(v) = var("PASSWORD") {
            self.password = v;
        }
        if let Some(v) = var("AUTH_TOKEN") {
            self.auth_token = v;
        }
    }
}

fn optional_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
}

// ============================================================================
// RESOLVED LAYER
// ============================================================================

/// Resolved bus configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct BusConfig {
    enabled: bool,
    polling_interval: Duration,
    cleanup_interval: Duration,
    transport_kind: TransportKind,
    endpoints: EndpointSet,
    username: String,
    password: String,
    auth_method: AuthMethod,
    auth_token: String,
    tls: bool,
    amqp: AmqpSettings,
    lightweight: LightweightSettings,
}

impl BusConfig {
    /// Resolve a raw table.
    ///
    /// - `cleanup_interval` below 10s is raised to 10s.
    /// - `polling_interval` above a third of `cleanup_interval` is lowered to it.
    /// - Unknown `type` falls back to `store`; unknown `auth-method` to `password`.
    ///
    /// Each adjustment logs a warning.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::InvalidValue` for a zero `polling-interval`
    /// - address parse failures
    pub fn resolve(raw: RawBusConfig) -> Result<Self, ConfigurationError> {
        let mut cleanup_ms = raw.cleanup_interval;
        if cleanup_ms < MIN_CLEANUP_INTERVAL_MS {
            warn!(
                configured = cleanup_ms,
                applied = MIN_CLEANUP_INTERVAL_MS,
                "cleanup-interval too small, clamping"
            );
            cleanup_ms = MIN_CLEANUP_INTERVAL_MS;
        }

        if raw.polling_interval == 0 {
            return Err(ConfigurationError::InvalidValue {
                key: "polling-interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let mut polling_ms = raw.polling_interval;
        let max_polling_ms = cleanup_ms / 3;
        if polling_ms > max_polling_ms {
            warn!(
                configured = polling_ms,
                applied = max_polling_ms,
                "polling-interval exceeds a third of cleanup-interval, clamping"
            );
            polling_ms = max_polling_ms;
        }

        let endpoints = match &raw.address {
            Some(value) => EndpointSet::from_value(value)?,
            None => EndpointSet::default(),
        };

        Ok(Self {
            enabled: raw.enabled,
            polling_interval: Duration::from_millis(polling_ms),
            cleanup_interval: Duration::from_millis(cleanup_ms),
            transport_kind: TransportKind::from_name_or_default(&raw.transport_type),
            endpoints,
            username: raw.username,
            password: raw.password,
            auth_method: AuthMethod::from_name_or_default(&raw.auth_method),
            auth_token: raw.auth_token,
            tls: raw.ssl.enabled,
            amqp: AmqpSettings {
                virtual_host: if raw.amqp.virtual_host.trim().is_empty() {
                    "/".to_string()
                } else {
                    raw.amqp.virtual_host
                },
            },
            lightweight: LightweightSettings {
                nkey_seed_path: optional_path(&raw.lightweight_pubsub.nkey_seed_path),
                jwt_file_path: optional_path(&raw.lightweight_pubsub.jwt_file_path),
                credentials_path: optional_path(&raw.lightweight_pubsub.credentials_path),
            },
        })
    }

    /// Resolve the `[messaging]` table of a TOML document, without env
    /// overrides.
    ///
    /// # Errors
    ///
    /// Parse or resolution failures.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        Self::resolve(RawBusConfig::from_toml_str(text)?)
    }

    /// Read a TOML file, apply `BUS_MESSAGING_*` overrides and resolve.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::Read` if the file cannot be read, otherwise
    /// parse or resolution failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// [`BusConfig::load`] reading overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`BusConfig::load`].
    pub fn load_with<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Read(format!("{}: {e}", path.display())))?;
        let mut raw = RawBusConfig::from_toml_str(&text)?;
        raw.apply_env_with(lookup);
        Self::resolve(raw)
    }

    /// Defaults plus `BUS_MESSAGING_*` overrides.
    ///
    /// # Errors
    ///
    /// Resolution failures.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let mut raw = RawBusConfig::default();
        raw.apply_env();
        Self::resolve(raw)
    }

    /// A configuration that keeps the bus inert.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Store poll retention and cleanup period.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    #[must_use]
    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    #[must_use]
    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    #[must_use]
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    #[must_use]
    pub fn tls(&self) -> bool {
        self.tls
    }

    #[must_use]
    pub fn amqp(&self) -> &AmqpSettings {
        &self.amqp
    }

    #[must_use]
    pub fn lightweight(&self) -> &LightweightSettings {
        &self.lightweight
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            transport_kind: TransportKind::Store,
            endpoints: EndpointSet::default(),
            username: String::new(),
            password: String::new(),
            auth_method: AuthMethod::Password,
            auth_token: String::new(),
            tls: false,
            amqp: AmqpSettings::default(),
            lightweight: LightweightSettings::default(),
        }
    }
}

impl fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(secret: &str) -> &'static str {
            if secret.is_empty() {
                ""
            } else {
                "<redacted>"
            }
        }

        f.debug_struct("BusConfig")
            .field("enabled", &self.enabled)
            .field("polling_interval", &self.polling_interval)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("transport_kind", &self.transport_kind)
            .field("endpoints", &self.endpoints.to_connection_strings())
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("auth_method", &self.auth_method)
            .field("auth_token", &redact(&self.auth_token))
            .field("tls", &self.tls)
            .field("amqp", &self.amqp)
            .field("lightweight", &self.lightweight)
            .finish()
    }
}
