//! # Transports
//!
//! A [`Transport`] moves encoded envelopes between instances. Every transport
//! follows the same lifecycle:
//!
//! ```text
//! new ──init──▶ connected ──enable──▶ delivering ──close──▶ closed
//! ```
//!
//! - `init` establishes connections or state and fails with
//!   `TransportError::Init`.
//! - `enable` starts inbound delivery and fails with `TransportError::Enable`.
//! - `send` publishes one envelope; failure is `TransportError::Io` and
//!   affects only that send.
//! - `close` is idempotent, best-effort and never fails.
//!
//! Inbound frames are decoded here and handed to the context's
//! [`MessageConsumer`]. Frames that fail to decode are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_types::{Codec, MessageEnvelope};
use tracing::warn;

use crate::config::{BusConfig, TransportKind};
use crate::error::TransportError;
use crate::host::HostChannel;
use crate::scheduler::TaskScheduler;
use crate::store::MessageStore;

pub mod host_local;
pub mod store;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kv-pubsub")]
pub mod kv_pubsub;
#[cfg(feature = "lightweight-pubsub")]
pub mod lightweight;

pub(crate) mod reconnect;

/// Receives decoded inbound envelopes from a transport.
pub trait MessageConsumer: Send + Sync {
    fn consume(&self, envelope: MessageEnvelope);
}

/// A message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Establish connections or state.
    async fn init(&self, config: &BusConfig) -> Result<(), TransportError>;

    /// Start inbound delivery. Requires a successful `init`.
    async fn enable(&self, config: &BusConfig) -> Result<(), TransportError>;

    /// Publish one envelope.
    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError>;

    /// Stop delivery and release resources.
    async fn close(&self);
}

/// Everything a transport is built from.
#[derive(Clone)]
pub struct TransportContext {
    /// Bus name; channel and exchange names derive from it.
    pub name: String,
    pub codec: Codec,
    pub consumer: Arc<dyn MessageConsumer>,
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Required by the `store` transport.
    pub store: Option<Arc<dyn MessageStore>>,
    /// Required by the `host-local` transport.
    pub host_channel: Option<Arc<dyn HostChannel>>,
    /// Wait between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl TransportContext {
    /// `"{name}:message"`, lowercased.
    #[must_use]
    pub fn channel(&self) -> String {
        crate::channel_name(&self.name)
    }

    /// Decode an inbound frame and hand it to the consumer.
    pub fn deliver(&self, kind: TransportKind, bytes: &[u8]) {
        match self.codec.decode_bytes(bytes) {
            Ok(envelope) => self.consumer.consume(envelope),
            Err(e) => warn!(
                transport = %kind,
                error = %e,
                bytes = bytes.len(),
                "Dropping undecodable inbound message"
            ),
        }
    }

    pub(crate) fn encode(
        &self,
        kind: TransportKind,
        envelope: &MessageEnvelope,
    ) -> Result<Vec<u8>, TransportError> {
        self.codec
            .encode_bytes(envelope)
            .map_err(|e| TransportError::io(kind, e))
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("name", &self.name)
            .field("store", &self.store.is_some())
            .field("host_channel", &self.host_channel.is_some())
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

/// Construct the transport for `kind`. Performs no I/O.
///
/// # Errors
///
/// `TransportError::Init` if `kind` was compiled out.
pub fn build_transport(
    kind: TransportKind,
    ctx: TransportContext,
) -> Result<Arc<dyn Transport>, TransportError> {
    let transport: Arc<dyn Transport> = match kind {
        TransportKind::Store => Arc::new(store::StoreTransport::new(ctx)),
        TransportKind::HostLocal => Arc::new(host_local::HostLocalTransport::new(ctx)),

        #[cfg(feature = "kv-pubsub")]
        TransportKind::KvPubsub => Arc::new(kv_pubsub::KvPubsubTransport::new(ctx)),
        #[cfg(feature = "amqp")]
        TransportKind::Amqp => Arc::new(amqp::AmqpTransport::new(ctx)),
        #[cfg(feature = "lightweight-pubsub")]
        TransportKind::LightweightPubsub => {
            Arc::new(lightweight::LightweightTransport::new(ctx))
        }

        #[allow(unreachable_patterns)]
        other => {
            return Err(TransportError::init(
                other,
                format!("support for {other} was not compiled in"),
            ))
        }
    };
    Ok(transport)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_channel_from_name() {
        let ctx = context("Lobby", Arc::new(RecordingConsumer::default()));
        assert_eq!(ctx.channel(), "lobby:message");
    }

    #[test]
    fn test_deliver_decodes_and_drops_garbage() {
        let consumer = Arc::new(RecordingConsumer::default());
        let ctx = context("bus", consumer.clone());
        let envelope = MessageEnvelope::new("bus", "hi".to_string()).unwrap();
        let bytes = ctx.encode(TransportKind::Store, &envelope).unwrap();

        ctx.deliver(TransportKind::Store, &bytes);
        ctx.deliver(TransportKind::Store, b"{not json");

        assert_eq!(consumer.ids(), vec![envelope.id()]);
    }

    #[test]
    fn test_build_every_compiled_kind() {
        for kind in TransportKind::ALL {
            let ctx = context("bus", Arc::new(RecordingConsumer::default()));
            match build_transport(kind, ctx) {
                Ok(transport) => assert_eq!(transport.kind(), kind),
                Err(e) => {
                    assert!(matches!(e, TransportError::Init { .. }));
                    assert_eq!(e.kind(), kind);
                }
            }
        }
    }
}
