//! Transport over a host-provided point-to-point channel.
//!
//! The channel is registered for both directions on `init` and unregistered
//! on `close`. Delivery needs no background task of its own: the host calls
//! the registered hook for every inbound frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::MessageEnvelope;
use tracing::{debug, info};

use super::{Transport, TransportContext};
use crate::config::{BusConfig, TransportKind};
use crate::error::TransportError;
use crate::host::{HostChannel, InboundHook};

const KIND: TransportKind = TransportKind::HostLocal;

/// The `host-local` transport.
pub struct HostLocalTransport {
    ctx: TransportContext,
    channel: String,
    registered: AtomicBool,
}

impl HostLocalTransport {
    #[must_use]
    pub fn new(ctx: TransportContext) -> Self {
        let channel = ctx.channel();
        Self {
            ctx,
            channel,
            registered: AtomicBool::new(false),
        }
    }

    fn host(&self) -> Result<&Arc<dyn HostChannel>, String> {
        self.ctx
            .host_channel
            .as_ref()
            .ok_or_else(|| "no host channel configured".to_string())
    }
}

#[async_trait]
impl Transport for HostLocalTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn init(&self, _config: &BusConfig) -> Result<(), TransportError> {
        let host = self.host().map_err(|e| TransportError::init(KIND, e))?;

        let ctx = self.ctx.clone();
        let hook: InboundHook = Arc::new(move |frame: Vec<u8>| ctx.deliver(KIND, &frame));
        host.register(&self.channel, hook)
            .map_err(|e| TransportError::init(KIND, e))?;

        self.registered.store(true, Ordering::SeqCst);
        debug!(channel = %self.channel, "Host channel registered");
        Ok(())
    }

    async fn enable(&self, _config: &BusConfig) -> Result<(), TransportError> {
        if !self.registered.load(Ordering::SeqCst) {
            return Err(TransportError::enable(KIND, "transport not initialized"));
        }
        info!(channel = %self.channel, "Host-local transport enabled");
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let host = self.host().map_err(|e| TransportError::io(KIND, e))?;
        let bytes = self.ctx.encode(KIND, envelope)?;
        let peers = host
            .dispatch(&self.channel, &bytes)
            .map_err(|e| TransportError::io(KIND, e))?;
        debug!(channel = %self.channel, peers, "Host frame dispatched");
        Ok(())
    }

    async fn close(&self) {
        if self.registered.swap(false, Ordering::SeqCst) {
            if let Ok(host) = self.host() {
                host.unregister(&self.channel);
            }
        }
    }
}
