//! # Host-Local Channels
//!
//! The `host-local` transport rides on a point-to-point primitive owned by
//! the embedding host. [`HostChannel`] is what the transport needs from it;
//! [`LocalHostHub`] is an in-process hub for instances that share one
//! process, with one [`LocalHostPort`] per instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Called with every frame arriving on a registered channel.
pub type InboundHook = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Errors from a host channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostChannelError {
    /// The channel is already registered by this port.
    #[error("Channel {0} is already registered")]
    AlreadyRegistered(String),

    /// Dispatch on a channel this port never registered.
    #[error("Channel {0} is not registered")]
    NotRegistered(String),

    /// Registration needs a running tokio runtime.
    #[error("No async runtime available for channel {0}")]
    NoRuntime(String),
}

/// Host-provided point-to-point messaging.
pub trait HostChannel: Send + Sync {
    /// Register `channel` for both directions and route inbound frames to
    /// `inbound`.
    fn register(&self, channel: &str, inbound: InboundHook) -> Result<(), HostChannelError>;

    /// Drop both directions of `channel`. Unknown channels are ignored.
    fn unregister(&self, channel: &str);

    /// Send one frame. Returns how many peers it reached.
    fn dispatch(&self, channel: &str, bytes: &[u8]) -> Result<usize, HostChannelError>;
}

/// Frame capacity per channel before slow peers start losing frames.
pub const DEFAULT_HUB_CAPACITY: usize = 1000;

/// In-process relay between co-hosted instances.
///
/// Every frame dispatched on a channel reaches every port registered on it,
/// including the sender's own port.
#[derive(Debug)]
pub struct LocalHostHub {
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<[u8]>>>>,
    capacity: usize,
}

impl LocalHostHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// A new attachment point for one instance.
    #[must_use]
    pub fn port(self: &Arc<Self>) -> LocalHostPort {
        LocalHostPort {
            hub: Arc::clone(self),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    /// Ports currently listening on `channel`.
    #[must_use]
    pub fn listeners(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Arc<[u8]>> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// One instance's view of a [`LocalHostHub`].
#[derive(Debug)]
pub struct LocalHostPort {
    hub: Arc<LocalHostHub>,
    registrations: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HostChannel for LocalHostPort {
    fn register(&self, channel: &str, inbound: InboundHook) -> Result<(), HostChannelError> {
        let mut registrations = self.registrations.lock();
        if registrations.contains_key(channel) {
            return Err(HostChannelError::AlreadyRegistered(channel.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| HostChannelError::NoRuntime(channel.to_string()))?;

        let mut frames = self.hub.sender(channel).subscribe();
        let name = channel.to_string();
        let forwarder = runtime.spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => inbound(frame.to_vec()),
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!(channel = %name, lagged = count, "Host channel lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        registrations.insert(channel.to_string(), forwarder);
        debug!(channel, "Host channel registered");
        Ok(())
    }

    fn unregister(&self, channel: &str) {
        if let Some(forwarder) = self.registrations.lock().remove(channel) {
            forwarder.abort();
            debug!(channel, "Host channel unregistered");
        }
    }

    fn dispatch(&self, channel: &str, bytes: &[u8]) -> Result<usize, HostChannelError> {
        if !self.registrations.lock().contains_key(channel) {
            return Err(HostChannelError::NotRegistered(channel.to_string()));
        }
        let frame: Arc<[u8]> = Arc::from(bytes);
        Ok(self.hub.sender(channel).send(frame).unwrap_or(0))
    }
}

impl Drop for LocalHostPort {
    fn drop(&mut self) {
        for (_, forwarder) in self.registrations.lock().drain() {
            forwarder.abort();
        }
    }
}
