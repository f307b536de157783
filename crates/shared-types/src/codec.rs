//! # Wire Codec
//!
//! Encodes envelopes as UTF-8 JSON objects:
//!
//! ```text
//! {"uuid":"<uuid>","type":"custom","channel":"<channel>","payload":<value>,"payloadType":"<tag>"}
//! ```
//!
//! Decoding is best-effort on the payload: a `payloadType` registered in the
//! local [`PayloadRegistry`] yields a concrete value, anything else keeps the
//! generic JSON form. An unknown type never fails a decode.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::{BusPayload, MessageEnvelope, ResolvedPayload, MESSAGE_TYPE};
use crate::errors::EnvelopeError;

type DecodeFn = fn(&Value) -> Result<ResolvedPayload, serde_json::Error>;

fn decode_as<T: BusPayload>(value: &Value) -> Result<ResolvedPayload, serde_json::Error> {
    let typed: T = serde_json::from_value(value.clone())?;
    Ok(Arc::new(typed))
}

/// Mapping from payload type tag to a decoder for that type.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl PayloadRegistry {
    /// An empty registry: every payload decodes generically.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows `String` and `serde_json::Value`.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().with::<String>().with::<Value>()
    }

    /// Register `T` under its `TYPE_NAME`.
    pub fn register<T: BusPayload>(&mut self) -> &mut Self {
        self.decoders.insert(T::TYPE_NAME, decode_as::<T>);
        self
    }

    /// Chaining form of [`PayloadRegistry::register`].
    #[must_use]
    pub fn with<T: BusPayload>(mut self) -> Self {
        self.register::<T>();
        self
    }

    /// Whether `tag` resolves to a concrete type here.
    #[must_use]
    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    fn resolve(&self, tag: &str, value: &Value) -> Option<ResolvedPayload> {
        let decoder = self.decoders.get(tag)?;
        match decoder(value) {
            Ok(resolved) => Some(resolved),
            Err(e) => {
                debug!(payload_type = tag, error = %e, "Payload did not fit registered type, keeping generic form");
                None
            }
        }
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PayloadRegistry").field("types", &tags).finish()
    }
}

#[derive(Serialize)]
struct WireOut<'a> {
    uuid: Uuid,
    #[serde(rename = "type")]
    message_type: &'a str,
    channel: &'a str,
    payload: &'a Value,
    #[serde(rename = "payloadType")]
    payload_type: &'a str,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default, rename = "payloadType")]
    payload_type: Option<String>,
}

/// Encoder/decoder for the JSON wire format.
///
/// Cheap to clone; the registry is shared.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    registry: Arc<PayloadRegistry>,
}

impl Codec {
    /// A codec resolving payloads through `registry`.
    #[must_use]
    pub fn new(registry: PayloadRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// The registry used for payload resolution.
    #[must_use]
    pub fn registry(&self) -> &PayloadRegistry {
        &self.registry
    }

    /// Encode an envelope to its JSON text.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Codec` if serialization fails.
    pub fn encode(&self, envelope: &MessageEnvelope) -> Result<String, EnvelopeError> {
        let wire = WireOut {
            uuid: envelope.id(),
            message_type: MESSAGE_TYPE,
            channel: envelope.channel_id(),
            payload: envelope.payload_value(),
            payload_type: envelope.payload_type(),
        };
        serde_json::to_string(&wire).map_err(|e| EnvelopeError::Codec(e.to_string()))
    }

    /// Encode an envelope to UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Same as [`Codec::encode`].
    pub fn encode_bytes(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, EnvelopeError> {
        self.encode(envelope).map(String::into_bytes)
    }

    /// Decode JSON text into an envelope.
    ///
    /// A missing `uuid` gets a fresh id; a missing `payloadType` is treated
    /// as generic JSON.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::Codec` if the text is not a JSON object
    /// - `EnvelopeError::InvalidId` if `uuid` is not a UUID
    /// - `EnvelopeError::MissingChannel` / `MissingPayload` for incomplete messages
    pub fn decode(&self, text: &str) -> Result<MessageEnvelope, EnvelopeError> {
        let wire: WireIn =
            serde_json::from_str(text).map_err(|e| EnvelopeError::Codec(e.to_string()))?;

        let id = match wire.uuid {
            Some(raw) => Uuid::parse_str(&raw).map_err(|_| EnvelopeError::InvalidId(raw))?,
            None => Uuid::new_v4(),
        };
        let channel = wire.channel.ok_or(EnvelopeError::MissingChannel)?;
        let payload = wire.payload.ok_or(EnvelopeError::MissingPayload)?;
        let payload_type = wire
            .payload_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| Value::TYPE_NAME.to_string());

        let resolved = self.registry.resolve(&payload_type, &payload);
        MessageEnvelope::from_parts(id, channel, payload, payload_type, resolved)
    }

    /// Decode UTF-8 bytes into an envelope.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Codec` for invalid UTF-8, otherwise as [`Codec::decode`].
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<MessageEnvelope, EnvelopeError> {
        let text = std::str::from_utf8(bytes).map_err(|e| EnvelopeError::Codec(e.to_string()))?;
        self.decode(text)
    }
}
