//! # Message Envelope
//!
//! The unit of transmission on every transport: an identity, a logical
//! channel, a payload and the payload's type tag.
//!
//! ## Invariants
//!
//! - `id` is assigned once at creation and never changes.
//! - `channel_id` and `payload_type` are never empty.
//! - The payload is never `null`.
//!
//! The payload is always kept in its generic JSON form. When the envelope was
//! built locally, or decoded by a process that registered the type tag, the
//! concrete value is kept alongside and is reachable with
//! [`MessageEnvelope::payload_as`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EnvelopeError;

/// Value of the wire `type` field for application messages.
pub const MESSAGE_TYPE: &str = "custom";

/// A value that can travel as an envelope payload.
///
/// `TYPE_NAME` is written to the wire as `payloadType`. It must be unique per
/// payload type across every process sharing a bus; a fully qualified path
/// such as `"inventory::StockChanged"` is the convention.
pub trait BusPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag for this payload.
    const TYPE_NAME: &'static str;
}

impl BusPayload for Value {
    const TYPE_NAME: &'static str = "serde_json::Value";
}

impl BusPayload for String {
    const TYPE_NAME: &'static str = "std::string::String";
}

/// A resolved, concrete payload value.
pub type ResolvedPayload = Arc<dyn Any + Send + Sync>;

/// The bus message envelope.
#[derive(Clone)]
pub struct MessageEnvelope {
    id: Uuid,
    channel_id: String,
    payload: Value,
    payload_type: String,
    resolved: Option<ResolvedPayload>,
}

impl MessageEnvelope {
    /// Build an envelope with a fresh id.
    ///
    /// # Errors
    ///
    /// - `EnvelopeError::MissingChannel` if `channel_id` is blank
    /// - `EnvelopeError::MissingPayload` if the payload serializes to `null`
    /// - `EnvelopeError::Codec` if the payload cannot be serialized
    pub fn new<T: BusPayload>(
        channel_id: impl Into<String>,
        payload: T,
    ) -> Result<Self, EnvelopeError> {
        Self::with_id(Uuid::new_v4(), channel_id, payload)
    }

    /// Build an envelope with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// Same as [`MessageEnvelope::new`].
    pub fn with_id<T: BusPayload>(
        id: Uuid,
        channel_id: impl Into<String>,
        payload: T,
    ) -> Result<Self, EnvelopeError> {
        let value =
            serde_json::to_value(&payload).map_err(|e| EnvelopeError::Codec(e.to_string()))?;
        Self::from_parts(
            id,
            channel_id.into(),
            value,
            T::TYPE_NAME.to_string(),
            Some(Arc::new(payload)),
        )
    }

    /// Assemble an envelope from already-validated wire parts.
    ///
    /// # Errors
    ///
    /// Returns the first violated envelope invariant.
    pub(crate) fn from_parts(
        id: Uuid,
        channel_id: String,
        payload: Value,
        payload_type: String,
        resolved: Option<ResolvedPayload>,
    ) -> Result<Self, EnvelopeError> {
        if channel_id.trim().is_empty() {
            return Err(EnvelopeError::MissingChannel);
        }
        if payload.is_null() {
            return Err(EnvelopeError::MissingPayload);
        }
        if payload_type.trim().is_empty() {
            return Err(EnvelopeError::MissingPayloadType);
        }
        Ok(Self {
            id,
            channel_id,
            payload,
            payload_type,
            resolved,
        })
    }

    /// The message identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The logical channel this message belongs to.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The payload type tag.
    #[must_use]
    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }

    /// The payload in generic JSON form.
    #[must_use]
    pub fn payload_value(&self) -> &Value {
        &self.payload
    }

    /// The concrete payload, if it resolved to `T`.
    #[must_use]
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.resolved.as_deref()?.downcast_ref::<T>()
    }

    /// Whether a concrete payload value is attached.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    /// Deserialize the generic payload into `T`, regardless of the tag.
    ///
    /// # Errors
    ///
    /// `EnvelopeError::Codec` if the JSON does not fit `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| EnvelopeError::Codec(e.to_string()))
    }
}

impl PartialEq for MessageEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.channel_id == other.channel_id
            && self.payload_type == other.payload_type
            && self.payload == other.payload
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("payload_type", &self.payload_type)
            .field("payload", &self.payload)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}
