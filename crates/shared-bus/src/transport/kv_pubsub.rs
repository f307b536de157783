//! Redis pub/sub transport.
//!
//! Publishing and subscribing use separate connections so a broken
//! subscription never blocks sends:
//!
//! - single endpoint: a reconnecting `ConnectionManager` publishes;
//! - several endpoints: a cluster connection publishes.
//!
//! The subscription runs under the reconnect supervisor against the first
//! endpoint that accepts a connection.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use shared_types::{Endpoint, MessageEnvelope};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::reconnect::{supervise, Shutdown};
use super::{Transport, TransportContext};
use crate::config::{AuthMethod, BusConfig, TransportKind};
use crate::error::TransportError;

const KIND: TransportKind = TransportKind::KvPubsub;

#[derive(Clone)]
enum Publisher {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl Publisher {
    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> redis::RedisResult<i64> {
        match self.clone() {
            Self::Single(mut conn) => conn.publish(channel, bytes).await,
            Self::Cluster(mut conn) => conn.publish(channel, bytes).await,
        }
    }
}

/// Credentials to present, derived from the auth method.
fn credentials(config: &BusConfig) -> (Option<String>, Option<String>) {
    fn non_empty(s: &str) -> Option<String> {
        (!s.is_empty()).then(|| s.to_string())
    }
    match config.auth_method() {
        AuthMethod::Password => (non_empty(config.username()), non_empty(config.password())),
        AuthMethod::Token => (None, non_empty(config.auth_token())),
    }
}

/// Connection info for one endpoint.
pub(crate) fn connection_info(endpoint: &Endpoint, config: &BusConfig) -> ConnectionInfo {
    let host = endpoint.host().to_string();
    let port = endpoint.port_or(KIND.default_port(config.tls()).unwrap_or(6379));
    let addr = if config.tls() {
        ConnectionAddr::TcpTls {
            host,
            port,
            insecure: false,
            tls_params: None,
        }
    } else {
        ConnectionAddr::Tcp(host, port)
    };
    let (username, password) = credentials(config);
    ConnectionInfo {
        addr,
        redis: RedisConnectionInfo {
            username,
            password,
            ..RedisConnectionInfo::default()
        },
    }
}

/// Subscribe through the first reachable node and pump messages until the
/// connection drops.
async fn run_subscription(
    nodes: Arc<Vec<ConnectionInfo>>,
    channel: String,
    ctx: TransportContext,
) -> Result<(), String> {
    let mut last_error = String::from("no endpoints");
    for info in nodes.iter() {
        let client = match Client::open(info.clone()) {
            Ok(client) => client,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                debug!(node = ?info.addr, error = %e, "Subscription node unreachable");
                last_error = e.to_string();
                continue;
            }
        };
        pubsub.subscribe(&channel).await.map_err(|e| e.to_string())?;
        info!(node = ?info.addr, channel = %channel, "Subscribed to Redis channel");

        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            ctx.deliver(KIND, msg.get_payload_bytes());
        }
        return Err("subscription stream closed".to_string());
    }
    Err(last_error)
}

/// The `kv-pubsub` transport.
pub struct KvPubsubTransport {
    ctx: TransportContext,
    channel: String,
    publisher: Mutex<Option<Publisher>>,
    nodes: Mutex<Arc<Vec<ConnectionInfo>>>,
    shutdown: Mutex<Shutdown>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl KvPubsubTransport {
    #[must_use]
    pub fn new(ctx: TransportContext) -> Self {
        let channel = ctx.channel();
        Self {
            ctx,
            channel,
            publisher: Mutex::new(None),
            nodes: Mutex::new(Arc::new(Vec::new())),
            shutdown: Mutex::new(Shutdown::new()),
            subscriber: Mutex::new(None),
        }
    }

    async fn connect_publisher(
        nodes: &[ConnectionInfo],
        config: &BusConfig,
    ) -> redis::RedisResult<Publisher> {
        if config.endpoints().is_single() {
            let client = Client::open(nodes[0].clone())?;
            let manager = client.get_connection_manager().await?;
            return Ok(Publisher::Single(manager));
        }

        let (username, password) = credentials(config);
        let mut builder = ClusterClient::builder(nodes.to_vec());
        if let Some(username) = username {
            builder = builder.username(username);
        }
        if let Some(password) = password {
            builder = builder.password(password);
        }
        let connection = builder.build()?.get_async_connection().await?;
        Ok(Publisher::Cluster(connection))
    }
}

#[async_trait]
impl Transport for KvPubsubTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn init(&self, config: &BusConfig) -> Result<(), TransportError> {
        let nodes: Vec<ConnectionInfo> = config
            .endpoints()
            .iter()
            .map(|endpoint| connection_info(endpoint, config))
            .collect();

        let publisher = Self::connect_publisher(&nodes, config)
            .await
            .map_err(|e| TransportError::init(KIND, e))?;

        *self.nodes.lock() = Arc::new(nodes);
        *self.publisher.lock() = Some(publisher);
        *self.shutdown.lock() = Shutdown::new();
        info!(endpoints = %config.endpoints(), "Connected to Redis");
        Ok(())
    }

    async fn enable(&self, _config: &BusConfig) -> Result<(), TransportError> {
        if self.publisher.lock().is_none() {
            return Err(TransportError::enable(KIND, "transport not initialized"));
        }

        let nodes = self.nodes.lock().clone();
        let channel = self.channel.clone();
        let ctx = self.ctx.clone();
        let delay = self.ctx.reconnect_delay;
        let shutdown = self.shutdown.lock().subscribe();

        let task = tokio::spawn(supervise(KIND, delay, shutdown, move |_| {
            run_subscription(nodes.clone(), channel.clone(), ctx.clone())
        }));
        if let Some(previous) = self.subscriber.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let publisher = self
            .publisher
            .lock()
            .clone()
            .ok_or_else(|| TransportError::io(KIND, "transport not initialized"))?;
        let bytes = self.ctx.encode(KIND, envelope)?;
        let receivers = publisher
            .publish(&self.channel, bytes)
            .await
            .map_err(|e| TransportError::io(KIND, e))?;
        debug!(channel = %self.channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.lock().trigger();
        let subscriber = self.subscriber.lock().take();
        if let Some(task) = subscriber {
            if tokio::time::timeout(crate::SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Redis subscriber did not stop in time");
            }
        }
        self.publisher.lock().take();
    }
}
