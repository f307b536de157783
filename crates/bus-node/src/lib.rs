//! # Bus Node
//!
//! A process that joins one message bus, broadcasts what it is told to and
//! logs what other instances broadcast. The `bus-node` binary drives it from
//! stdin; tests drive it directly.
//!
//! ## Startup Sequence
//!
//! 1. Parse arguments and load the `[messaging]` configuration
//! 2. Open the message store when the `store` transport is selected
//! 3. `startup` then `schedule_tasks` on the bus
//! 4. Relay lines until stdin closes or Ctrl+C
//! 5. `shutdown`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared_bus::{
    BusConfig, BusContext, ChannelReceiver, HostChannel, Inbox, LocalHostHub, MessageBus,
    MessageStore, PayloadRegistry, TransportKind,
};
use shared_types::{BusPayload, MessageEnvelope};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Payload the node broadcasts for every relayed line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub from: String,
    pub text: String,
}

impl BusPayload for ChatLine {
    const TYPE_NAME: &'static str = "interlink::ChatLine";
}

/// Command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOptions {
    /// TOML file with a `[messaging]` table. Env overrides only when absent.
    pub config_path: Option<PathBuf>,
    /// Bus name; instances with the same name talk to each other.
    pub name: String,
    /// Database file for the `store` transport.
    pub store_path: PathBuf,
    /// Interval between metric updates.
    pub metrics_interval: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            config_path: None,
            name: "interlink".to_string(),
            store_path: PathBuf::from("bus-messages.db"),
            metrics_interval: Duration::from_secs(15),
        }
    }
}

const USAGE: &str = "usage: bus-node [CONFIG.toml] [--name NAME] [--store PATH]";

impl NodeOptions {
    /// Parse `[CONFIG] [--name NAME] [--store PATH]`, program name excluded.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut options = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--name" => {
                    options.name = args.next().context(USAGE)?;
                }
                "--store" => {
                    options.store_path = args.next().map(PathBuf::from).context(USAGE)?;
                }
                flag if flag.starts_with("--") => bail!("unknown option {flag}\n{USAGE}"),
                path => {
                    if options.config_path.is_some() {
                        bail!("more than one configuration file given\n{USAGE}");
                    }
                    options.config_path = Some(PathBuf::from(path));
                }
            }
        }
        if options.name.trim().is_empty() {
            bail!("bus name must not be empty");
        }
        Ok(options)
    }
}

/// Load the bus configuration from `path` plus `BUS_MESSAGING_*`, or from
/// the environment alone.
pub fn load_config(path: Option<&Path>) -> Result<BusConfig> {
    match path {
        Some(path) => BusConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => BusConfig::from_env().context("Failed to load configuration from environment"),
    }
}

/// Store for the `store` transport.
fn open_store(options: &NodeOptions) -> Result<Arc<dyn MessageStore>> {
    #[cfg(feature = "sqlite")]
    {
        let store = shared_bus::SqliteStore::open(&options.store_path)
            .with_context(|| format!("Failed to open store {}", options.store_path.display()))?;
        info!(path = %options.store_path.display(), "Opened SQLite message store");
        Ok(Arc::new(store))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        warn!(
            path = %options.store_path.display(),
            "Built without sqlite; using a process-local store"
        );
        Ok(Arc::new(shared_bus::InMemoryStore::new()))
    }
}

/// The registry every node decodes with.
pub fn payload_registry() -> PayloadRegistry {
    PayloadRegistry::with_defaults().with::<ChatLine>()
}

/// One bus member.
pub struct BusNode {
    bus: Arc<MessageBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl BusNode {
    /// Build the bus for `config` with the collaborators its transport
    /// needs. Returns the inbox of delivered messages.
    pub fn new(config: BusConfig, options: &NodeOptions) -> Result<(Self, Inbox)> {
        let (receiver, inbox) = ChannelReceiver::new();
        let mut ctx = BusContext::new(options.name.clone(), Arc::new(receiver));
        ctx.registry = payload_registry();

        if config.enabled() {
            match config.transport_kind() {
                TransportKind::Store => ctx.store = Some(open_store(options)?),
                TransportKind::HostLocal => {
                    warn!("host-local transport in a standalone process only reaches this process");
                    ctx.host_channel =
                        Some(Arc::new(LocalHostHub::new().port()) as Arc<dyn HostChannel>);
                }
                _ => {}
            }
        }
        Ok((Self::with_context(config, ctx), inbox))
    }

    /// Build from a ready-made context.
    pub fn with_context(config: BusConfig, ctx: BusContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus: Arc::new(MessageBus::new(config, ctx)),
            shutdown_tx,
        }
    }

    /// Start the bus and its delivery.
    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Interlink bus node v{}", env!("CARGO_PKG_VERSION"));
        info!("  Bus: {}", self.bus.name());
        info!("  Transport: {}", self.bus.transport_kind());
        info!("===========================================");

        if !self.bus.config().enabled() {
            warn!("Messaging is disabled; nothing will be sent or received");
            return Ok(());
        }
        self.bus
            .startup()
            .await
            .context("Failed to start message bus")?;
        self.bus
            .schedule_tasks()
            .await
            .context("Failed to enable message delivery")?;
        Ok(())
    }

    /// Broadcast one line. `false` if the bus did not take it.
    pub async fn broadcast(&self, text: &str) -> Result<bool> {
        let line = ChatLine {
            from: self.bus.name().to_string(),
            text: text.to_string(),
        };
        let envelope = MessageEnvelope::new(self.bus.name(), line)?;
        Ok(self.bus.send(envelope).await)
    }

    /// Log every delivered message until shutdown.
    pub fn spawn_inbound_logger(&self, mut inbox: Inbox) -> JoinHandle<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbox.recv() => match received {
                        Some(envelope) => log_inbound(&envelope),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Mirror the bus counters into Prometheus every `period`.
    pub fn spawn_metrics(&self, period: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => record_stats(&bus),
                    _ = shutdown.changed() => {
                        record_stats(&bus);
                        break;
                    }
                }
            }
        })
    }

    /// Stop background tasks and the bus.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.shutdown_tx.send_replace(true);
        self.bus.shutdown().await;
        info!("Shutdown complete");
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }
}

fn log_inbound(envelope: &MessageEnvelope) {
    match envelope.payload_as::<ChatLine>() {
        Some(line) => info!(id = %envelope.id(), from = %line.from, "{}", line.text),
        None => info!(
            id = %envelope.id(),
            channel = %envelope.channel_id(),
            payload_type = %envelope.payload_type(),
            payload = %envelope.payload_value(),
            "Received message"
        ),
    }
}

fn record_stats(bus: &MessageBus) {
    let stats = bus.stats();
    bus_telemetry::record_totals(
        bus.name(),
        bus_telemetry::BusTotals {
            sent: stats.sent,
            send_failures: stats.send_failures,
            received: stats.received,
            duplicates_dropped: stats.duplicates_dropped,
        },
    );
}
