//! # Broker Endpoints
//!
//! Parses `host[:port]` strings into validated endpoints and groups them into
//! an [`EndpointSet`]. A set with one entry means direct connection; more
//! than one means the transport must use its cluster-aware client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ConfigurationError;

/// Host used when no address is configured.
pub const DEFAULT_HOST: &str = "localhost";

const MIN_PORT: u32 = 1;
const MAX_PORT: u32 = 65535;

/// A single broker address.
///
/// The host is trimmed and never empty. The port is optional; transports
/// substitute their protocol default when it is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// Create an endpoint from parts.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::EmptyHost` if `host` is blank
    /// - `ConfigurationError::PortOutOfRange` if `port` is `Some(0)`
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Result<Self, ConfigurationError> {
        let host = host.into();
        let trimmed = host.trim();
        if trimmed.is_empty() {
            return Err(ConfigurationError::EmptyHost { address: host });
        }
        if let Some(port) = port {
            check_port(u32::from(port))?;
        }
        Ok(Self {
            host: trimmed.to_string(),
            port,
        })
    }

    /// The default local endpoint, without a port.
    #[must_use]
    pub fn local() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
        }
    }

    /// Parse `host`, `host:` or `host:port`.
    ///
    /// Splits on the last colon. Blank input yields [`Endpoint::local`].
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::EmptyHost` for input like `":6379"`
    /// - `ConfigurationError::InvalidPort` when the port is not numeric
    /// - `ConfigurationError::PortOutOfRange` when the port is 0 or above 65535
    pub fn parse(text: &str) -> Result<Self, ConfigurationError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::local());
        }

        let Some((host, port)) = text.rsplit_once(':') else {
            return Self::new(text, None);
        };

        if host.trim().is_empty() {
            return Err(ConfigurationError::EmptyHost {
                address: text.to_string(),
            });
        }

        // Trailing colon, no port
        if port.is_empty() {
            return Self::new(host, None);
        }

        let port: u32 = port.parse().map_err(|_| ConfigurationError::InvalidPort {
            address: text.to_string(),
        })?;
        check_port(port)?;

        Self::new(host, u16::try_from(port).ok())
    }

    /// The trimmed host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The configured port, if any.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The configured port, or `default` when none was given.
    #[must_use]
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Canonical `host` or `host:port` form.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

fn check_port(port: u32) -> Result<(), ConfigurationError> {
    if (MIN_PORT..=MAX_PORT).contains(&port) {
        Ok(())
    } else {
        Err(ConfigurationError::PortOutOfRange { port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_connection_string())
    }
}

impl FromStr for Endpoint {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_connection_string()
    }
}

/// The accepted shapes of an address setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointInput {
    /// No address configured.
    Absent,
    /// A single `host[:port]` string.
    One(String),
    /// A list of `host[:port]` strings.
    Many(Vec<String>),
    /// Already-parsed endpoints.
    Endpoints(Vec<Endpoint>),
}

impl TryFrom<&Value> for EndpointInput {
    type Error = ConfigurationError;

    /// Classify a dynamic configuration value.
    ///
    /// `null` is absent, a string is one address, an array of strings is many.
    /// Anything else (numbers, objects, arrays with non-string items) is rejected.
    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(Self::Absent),
            Value::String(s) => Ok(Self::One(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(ConfigurationError::UnsupportedInput {
                        shape: format!("list containing {}", value_kind(other)),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Many),
            other => Err(ConfigurationError::UnsupportedInput {
                shape: value_kind(other).to_string(),
            }),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// A non-empty, ordered list of endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

#[allow(clippy::len_without_is_empty)]
impl EndpointSet {
    /// Build a set from any accepted input shape.
    ///
    /// Blank strings are dropped; an empty result falls back to the default
    /// local endpoint.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Endpoint::parse`] failure.
    pub fn from_input(input: EndpointInput) -> Result<Self, ConfigurationError> {
        match input {
            EndpointInput::Absent => Ok(Self::default()),
            EndpointInput::One(text) => Self::single(&text),
            EndpointInput::Many(items) => Self::from_strings(items),
            EndpointInput::Endpoints(endpoints) => Ok(Self::from_endpoints(endpoints)),
        }
    }

    /// Build a set from a dynamic configuration value.
    ///
    /// # Errors
    ///
    /// `ConfigurationError::UnsupportedInput` for unsupported shapes, or any
    /// parse failure.
    pub fn from_value(value: &Value) -> Result<Self, ConfigurationError> {
        Self::from_input(EndpointInput::try_from(value)?)
    }

    /// A set with exactly one endpoint parsed from `text`.
    ///
    /// # Errors
    ///
    /// Propagates [`Endpoint::parse`] failures.
    pub fn single(text: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            endpoints: vec![Endpoint::parse(text)?],
        })
    }

    /// Parse every non-blank string.
    ///
    /// # Errors
    ///
    /// Propagates the first [`Endpoint::parse`] failure.
    pub fn from_strings<I, S>(items: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = items
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| Endpoint::parse(&s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_endpoints(endpoints))
    }

    /// Wrap pre-built endpoints; an empty list becomes the default set.
    #[must_use]
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        if endpoints.is_empty() {
            return Self::default();
        }
        Self { endpoints }
    }

    /// Exactly one endpoint (direct connection).
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.endpoints.len() == 1
    }

    /// More than one endpoint (cluster connection).
    #[must_use]
    pub fn is_cluster(&self) -> bool {
        self.endpoints.len() > 1
    }

    /// The first endpoint.
    #[must_use]
    pub fn first(&self) -> &Endpoint {
        // Non-empty by construction.
        &self.endpoints[0]
    }

    /// All endpoints in configured order.
    #[must_use]
    pub fn all(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Number of endpoints (always at least one).
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Iterate over the endpoints.
    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.endpoints.iter()
    }

    /// Every endpoint as a connection string.
    #[must_use]
    pub fn to_connection_strings(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(Endpoint::to_connection_string)
            .collect()
    }
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::local()],
        }
    }
}

impl<'a> IntoIterator for &'a EndpointSet {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

impl fmt::Display for EndpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            return write!(f, "{}", self.first());
        }
        write!(f, "[{}]", self.to_connection_strings().join(", "))
    }
}
