//! Shared fixtures for the integration flows.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_bus::{
    BusConfig, BusContext, ChannelReceiver, HostChannel, Inbox, InMemoryStore, MessageBus,
    MessageStore, PayloadRegistry, RawBusConfig, StoreError,
};
use shared_types::{BusPayload, MessageEnvelope};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Application event used across the flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreChanged {
    pub player: String,
    pub score: u32,
}

impl BusPayload for ScoreChanged {
    const TYPE_NAME: &'static str = "arena::ScoreChanged";
}

pub fn registry() -> PayloadRegistry {
    PayloadRegistry::with_defaults().with::<ScoreChanged>()
}

pub fn score(player: &str, score: u32) -> MessageEnvelope {
    MessageEnvelope::new(
        "arena",
        ScoreChanged {
            player: player.to_string(),
            score,
        },
    )
    .expect("valid envelope")
}

/// Store-transport configuration polling every `polling_ms`.
pub fn store_config(polling_ms: u64) -> BusConfig {
    BusConfig::resolve(RawBusConfig {
        polling_interval: polling_ms,
        ..RawBusConfig::default()
    })
    .expect("valid config")
}

pub fn config_of(kind: &str) -> BusConfig {
    BusConfig::resolve(RawBusConfig {
        transport_type: kind.to_string(),
        ..RawBusConfig::default()
    })
    .expect("valid config")
}

/// `kind` transport pointed at `address`.
pub fn config_at(kind: &str, address: &str) -> BusConfig {
    BusConfig::resolve(RawBusConfig {
        transport_type: kind.to_string(),
        address: Some(serde_json::json!(address)),
        ..RawBusConfig::default()
    })
    .expect("valid config")
}

/// One bus instance together with the inbox it delivers to.
pub struct Member {
    pub bus: Arc<MessageBus>,
    pub inbox: Inbox,
}

/// Collaborators a member is wired with.
#[derive(Default, Clone)]
pub struct Wiring {
    pub store: Option<Arc<dyn MessageStore>>,
    pub host_channel: Option<Arc<dyn HostChannel>>,
    pub self_delivery: bool,
    pub reconnect_delay: Option<Duration>,
}

impl Member {
    pub fn new(name: &str, config: BusConfig, wiring: Wiring) -> Self {
        let (receiver, inbox) = ChannelReceiver::new();
        let mut ctx = BusContext::new(name, Arc::new(receiver));
        ctx.registry = registry();
        ctx.store = wiring.store;
        ctx.host_channel = wiring.host_channel;
        ctx.self_delivery = wiring.self_delivery;
        if let Some(delay) = wiring.reconnect_delay {
            ctx.reconnect_delay = delay;
        }
        Self {
            bus: Arc::new(MessageBus::new(config, ctx)),
            inbox,
        }
    }

    /// `startup` and `schedule_tasks`.
    pub async fn start(&self) {
        self.bus.startup().await.expect("startup");
        self.bus.schedule_tasks().await.expect("schedule_tasks");
    }

    /// Next delivered message, if one arrives within `within`.
    pub async fn next(&mut self, within: Duration) -> Option<MessageEnvelope> {
        tokio::time::timeout(within, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<MessageEnvelope> {
        let mut out = Vec::new();
        while let Ok(Some(envelope)) = self.inbox.try_recv() {
            out.push(envelope);
        }
        out
    }
}

pub fn shared_store() -> Arc<dyn MessageStore> {
    Arc::new(InMemoryStore::new())
}

/// Store whose fetches fail a set number of times before recovering.
pub struct FlakyStore {
    inner: InMemoryStore,
    failing_fetches: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failing_fetches: usize) -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing_fetches: AtomicUsize::new(failing_fetches),
        }
    }

    pub fn remaining_failures(&self) -> usize {
        self.failing_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }

    async fn append(&self, channel: &str, body: &str) -> Result<i64, StoreError> {
        self.inner.append(channel, body).await
    }

    async fn fetch_since(
        &self,
        channel: &str,
        watermark: i64,
    ) -> Result<BTreeMap<i64, String>, StoreError> {
        let failed = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Backend("connection reset".to_string()));
        }
        self.inner.fetch_since(channel, watermark).await
    }

    async fn latest_id(&self, channel: &str) -> Result<Option<i64>, StoreError> {
        self.inner.latest_id(channel).await
    }

    async fn delete_older_than(&self, channel: &str, retention: Duration) -> Result<u64, StoreError> {
        self.inner.delete_older_than(channel, retention).await
    }
}

/// TCP forwarder in front of a broker whose live connections can be cut.
pub struct SeverableProxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl SeverableProxy {
    /// Listen on an ephemeral local port and forward to `target`.
    pub async fn start(target: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let target = target.to_string();
        let links = Arc::new(Mutex::new(Vec::new()));

        let accept = {
            let links = Arc::clone(&links);
            tokio::spawn(async move {
                while let Ok((mut inbound, _)) = listener.accept().await {
                    let target = target.clone();
                    let link = tokio::spawn(async move {
                        if let Ok(mut outbound) = TcpStream::connect(&target).await {
                            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                        }
                    });
                    links.lock().push(link);
                }
            })
        };
        Ok(Self { addr, links, accept })
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Drop every connection made so far. New ones are still accepted.
    pub fn sever(&self) -> usize {
        let links = std::mem::take(&mut *self.links.lock());
        let count = links.len();
        for link in links {
            link.abort();
        }
        count
    }
}

impl Drop for SeverableProxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.sever();
    }
}
