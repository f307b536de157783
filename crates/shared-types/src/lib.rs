//! # Shared Types Crate
//!
//! Value types shared by every bus component.
//!
//! ## Contents
//!
//! - **Endpoints**: `host[:port]` broker addresses and ordered endpoint sets.
//! - **Envelope**: the `MessageEnvelope` carried by every transport.
//! - **Codec**: the JSON wire format and the local payload type registry.
//! - **Errors**: `ConfigurationError` and `EnvelopeError`.
//!
//! Nothing here performs I/O; every operation is synchronous and pure.

pub mod codec;
pub mod endpoint;
pub mod envelope;
pub mod errors;

pub use codec::{Codec, PayloadRegistry};
pub use endpoint::{Endpoint, EndpointInput, EndpointSet, DEFAULT_HOST};
pub use envelope::{BusPayload, MessageEnvelope, ResolvedPayload, MESSAGE_TYPE};
pub use errors::{ConfigurationError, EnvelopeError};
