//! # Error Types
//!
//! Errors raised synchronously while building bus values. Both kinds are
//! fatal for the value being built and are never retried.

use thiserror::Error;

/// A malformed endpoint or configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The host part of an endpoint is empty or whitespace.
    #[error("Host cannot be empty in address: {address:?}")]
    EmptyHost { address: String },

    /// The port part of an endpoint is not a number.
    #[error("Invalid port number in address: {address:?}")]
    InvalidPort { address: String },

    /// The port is outside `[1, 65535]`.
    #[error("Port must be between 1 and 65535, got {port}")]
    PortOutOfRange { port: u32 },

    /// An address value that is neither a string nor a list of strings.
    #[error("Unsupported address input: {shape}")]
    UnsupportedInput { shape: String },

    /// A configuration key holds a value that cannot be used.
    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// The configuration source could not be read.
    #[error("Failed to read configuration: {0}")]
    Read(String),

    /// The configuration source is not valid TOML for the schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// A message envelope that cannot be built or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Channel id is missing or blank.
    #[error("Channel ID cannot be null or empty in a message")]
    MissingChannel,

    /// Payload is missing or serializes to null.
    #[error("Payload cannot be null in a message")]
    MissingPayload,

    /// Payload type tag is blank.
    #[error("Payload type name cannot be empty")]
    MissingPayloadType,

    /// The `uuid` field is present but not a UUID.
    #[error("Invalid message uuid: {0}")]
    InvalidId(String),

    /// The wire text is not a JSON envelope object.
    #[error("Malformed message: {0}")]
    Codec(String),
}

impl EnvelopeError {
    /// Whether the error comes from envelope validation rather than the
    /// wire format itself.
    #[must_use]
    pub fn is_invalid_envelope(&self) -> bool {
        !matches!(self, EnvelopeError::Codec(_))
    }
}
