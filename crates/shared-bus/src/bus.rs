//! # Message Bus Facade
//!
//! Owns one transport and the self-dedup cache, and gates both directions on
//! the lifecycle state.
//!
//! ```text
//! ┌───────────────┐ startup ┌──────────────┐  ok   ┌───────┐
//! │ Uninitialized │───────▶ │ Initializing │──────▶│ Ready │
//! └───────────────┘         └──────────────┘       └───────┘
//!         ▲                        │ err               │ schedule_tasks
//!         │                        ▼                   ▼
//!         │                  ┌─────────┐  err   ┌──────────┐
//!         └── (restart) ─────│ Stopped │◀───────│ Enabling │
//!                            └─────────┘        └──────────┘
//!                                 ▲                    │ ok
//!                                 │              ┌─────────┐
//!                         ┌──────────────┐       │ Running │
//!                         │ ShuttingDown │◀──────└─────────┘
//!                         └──────────────┘ shutdown
//! ```
//!
//! Only `Running` sends and delivers. A bus built from a disabled
//! configuration stays `Uninitialized` forever: every lifecycle call is a
//! no-op and every send resolves to `false`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::RwLock;
use shared_types::{Codec, MessageEnvelope, PayloadRegistry};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, TransportKind};
use crate::dedup_cache::{DedupCache, SystemTimeSource, TimeSource};
use crate::error::BusError;
use crate::host::HostChannel;
use crate::receiver::MessageReceiver;
use crate::scheduler::{TaskScheduler, TokioScheduler};
use crate::store::MessageStore;
use crate::transport::{build_transport, MessageConsumer, Transport, TransportContext};

/// Lifecycle state of a [`MessageBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    Uninitialized,
    Initializing,
    Ready,
    Enabling,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Enabling => "enabling",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Collaborators and tunables a bus is built with.
pub struct BusContext {
    /// Bus name. Channel, subject and exchange names derive from it.
    pub name: String,
    pub receiver: Arc<dyn MessageReceiver>,
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Backing store for the `store` transport.
    pub store: Option<Arc<dyn MessageStore>>,
    /// Host primitive for the `host-local` transport.
    pub host_channel: Option<Arc<dyn HostChannel>>,
    pub registry: PayloadRegistry,
    /// Deliver this instance's own broadcasts back to it. Test mode.
    pub self_delivery: bool,
    pub reconnect_delay: Duration,
    pub dedup_ttl: Duration,
    pub time_source: Arc<dyn TimeSource>,
}

impl BusContext {
    /// Context with the default scheduler, registry and timings and no
    /// store or host channel.
    pub fn new(name: impl Into<String>, receiver: Arc<dyn MessageReceiver>) -> Self {
        Self {
            name: name.into(),
            receiver,
            scheduler: Arc::new(TokioScheduler::new()),
            store: None,
            host_channel: None,
            registry: PayloadRegistry::with_defaults(),
            self_delivery: false,
            reconnect_delay: crate::RECONNECT_DELAY,
            dedup_ttl: crate::DEDUP_TTL,
            time_source: Arc::new(SystemTimeSource),
        }
    }
}

impl fmt::Debug for BusContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusContext")
            .field("name", &self.name)
            .field("store", &self.store.is_some())
            .field("host_channel", &self.host_channel.is_some())
            .field("registry", &self.registry)
            .field("self_delivery", &self.self_delivery)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("dedup_ttl", &self.dedup_ttl)
            .finish()
    }
}

/// Point-in-time counters of a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Sends the transport accepted.
    pub sent: u64,
    /// Sends that resolved to `false`.
    pub send_failures: u64,
    /// Inbound messages handed to the receiver.
    pub received: u64,
    /// Inbound messages dropped as already seen.
    pub duplicates_dropped: u64,
    /// Inbound messages dropped because the bus was not running.
    pub ignored_not_running: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    duplicates_dropped: AtomicU64,
    ignored_not_running: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BusStats {
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            ignored_not_running: self.ignored_not_running.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Inbound side of the bus, handed to the transport as its consumer.
///
/// Kept apart from [`MessageBus`] so the transport never holds a reference
/// back to the object that owns it.
struct Gate {
    state: RwLock<BusState>,
    dedup: RwLock<Option<Arc<DedupCache>>>,
    receiver: Arc<dyn MessageReceiver>,
    counters: Counters,
}

impl Gate {
    fn state(&self) -> BusState {
        *self.state.read()
    }

    fn set_state(&self, next: BusState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            debug!(from = %previous, to = %next, "Bus state changed");
        }
    }

    fn dedup(&self) -> Option<Arc<DedupCache>> {
        self.dedup.read().clone()
    }
}

impl MessageConsumer for Gate {
    fn consume(&self, envelope: MessageEnvelope) {
        if self.state() != BusState::Running {
            bump(&self.counters.ignored_not_running);
            debug!(id = %envelope.id(), "Bus not running, ignoring inbound message");
            return;
        }
        let Some(dedup) = self.dedup() else {
            bump(&self.counters.ignored_not_running);
            return;
        };
        if !dedup.insert_if_absent(envelope.id()) {
            bump(&self.counters.duplicates_dropped);
            debug!(id = %envelope.id(), "Dropping already seen message");
            return;
        }
        bump(&self.counters.received);
        self.receiver.deliver(envelope);
    }
}

/// Outcome of [`MessageBus::send`]. Resolves to `true` once the transport
/// accepted the message.
///
/// The send runs on its own task, so dropping this future does not cancel
/// it.
pub struct SendFuture {
    inner: SendInner,
}

enum SendInner {
    Ready(bool),
    Pending(JoinHandle<bool>),
}

impl SendFuture {
    fn ready(value: bool) -> Self {
        Self {
            inner: SendInner::Ready(value),
        }
    }
}

impl Future for SendFuture {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.get_mut().inner {
            SendInner::Ready(value) => Poll::Ready(*value),
            SendInner::Pending(task) => Pin::new(task).poll(cx).map(|joined| joined.unwrap_or(false)),
        }
    }
}

impl fmt::Debug for SendFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            SendInner::Ready(value) => f.debug_tuple("SendFuture::Ready").field(value).finish(),
            SendInner::Pending(_) => f.write_str("SendFuture::Pending"),
        }
    }
}

/// Cross-instance message bus over one configured transport.
///
/// Construct once and share by `Arc`.
pub struct MessageBus {
    config: BusConfig,
    name: String,
    codec: Codec,
    scheduler: Arc<dyn TaskScheduler>,
    store: Option<Arc<dyn MessageStore>>,
    host_channel: Option<Arc<dyn HostChannel>>,
    self_delivery: bool,
    reconnect_delay: Duration,
    dedup_ttl: Duration,
    time_source: Arc<dyn TimeSource>,
    gate: Arc<Gate>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes lifecycle transitions.
    lifecycle: tokio::sync::Mutex<()>,
}

impl MessageBus {
    pub fn new(config: BusConfig, ctx: BusContext) -> Self {
        Self {
            config,
            name: ctx.name,
            codec: Codec::new(ctx.registry),
            scheduler: ctx.scheduler,
            store: ctx.store,
            host_channel: ctx.host_channel,
            self_delivery: ctx.self_delivery,
            reconnect_delay: ctx.reconnect_delay,
            dedup_ttl: ctx.dedup_ttl,
            time_source: ctx.time_source,
            gate: Arc::new(Gate {
                state: RwLock::new(BusState::Uninitialized),
                dedup: RwLock::new(None),
                receiver: ctx.receiver,
                counters: Counters::default(),
            }),
            transport: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Build the transport and establish its connections.
    ///
    /// Allowed from `Uninitialized` and, to restart, from `Stopped`. On
    /// failure everything built so far is torn down and the bus ends in
    /// `Stopped`.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidState` from any other state
    /// - `BusError::Transport` when construction or `init` fails
    pub async fn startup(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.config.enabled() {
            debug!(bus = %self.name, "Messaging disabled, not starting");
            return Ok(());
        }
        let state = self.gate.state();
        if !matches!(state, BusState::Uninitialized | BusState::Stopped) {
            return Err(BusError::InvalidState {
                state,
                operation: "start",
            });
        }

        self.gate.set_state(BusState::Initializing);
        let dedup = Arc::new(DedupCache::with_time_source(
            self.dedup_ttl,
            self.time_source.clone(),
        ));
        *self.gate.dedup.write() = Some(dedup);

        let kind = self.config.transport_kind();
        match self.init_transport(kind).await {
            Ok(()) => {
                self.gate.set_state(BusState::Ready);
                info!(bus = %self.name, transport = %kind, "Message bus initialized");
                Ok(())
            }
            Err(e) => {
                error!(bus = %self.name, transport = %kind, error = %e, "Message bus failed to start");
                self.teardown().await;
                self.gate.set_state(BusState::Stopped);
                Err(e)
            }
        }
    }

    async fn init_transport(&self, kind: TransportKind) -> Result<(), BusError> {
        let ctx = TransportContext {
            name: self.name.clone(),
            codec: self.codec.clone(),
            consumer: self.gate.clone(),
            scheduler: self.scheduler.clone(),
            store: self.store.clone(),
            host_channel: self.host_channel.clone(),
            reconnect_delay: self.reconnect_delay,
        };
        let transport = build_transport(kind, ctx)?;
        *self.transport.write() = Some(transport.clone());
        transport.init(&self.config).await?;
        Ok(())
    }

    /// Start inbound delivery. Requires `Ready`.
    ///
    /// # Errors
    ///
    /// - `BusError::InvalidState` unless `Ready`
    /// - `BusError::Transport` when `enable` fails; the bus is then `Stopped`
    pub async fn schedule_tasks(&self) -> Result<(), BusError> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.config.enabled() {
            return Ok(());
        }
        let state = self.gate.state();
        let transport = match (state, self.current_transport()) {
            (BusState::Ready, Some(transport)) => transport,
            _ => {
                return Err(BusError::InvalidState {
                    state,
                    operation: "schedule tasks",
                })
            }
        };

        self.gate.set_state(BusState::Enabling);
        match transport.enable(&self.config).await {
            Ok(()) => {
                self.gate.set_state(BusState::Running);
                info!(bus = %self.name, transport = %transport.kind(), "Message bus running");
                Ok(())
            }
            Err(e) => {
                error!(bus = %self.name, error = %e, "Message bus failed to enable delivery");
                self.teardown().await;
                self.gate.set_state(BusState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Close the transport and forget every seen id. Never fails and is safe
    /// in any state.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if matches!(
            self.gate.state(),
            BusState::Uninitialized | BusState::Stopped
        ) {
            return;
        }
        self.gate.set_state(BusState::ShuttingDown);
        self.teardown().await;
        self.gate.set_state(BusState::Stopped);
        info!(bus = %self.name, "Message bus stopped");
    }

    async fn teardown(&self) {
        let transport = self.transport.write().take();
        if let Some(transport) = transport {
            if tokio::time::timeout(crate::SHUTDOWN_TIMEOUT, transport.close())
                .await
                .is_err()
            {
                warn!(bus = %self.name, transport = %transport.kind(), "Transport close timed out");
            }
        }
        let dedup = self.gate.dedup.write().take();
        if let Some(dedup) = dedup {
            dedup.close();
        }
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    /// Broadcast `envelope` to every other instance.
    ///
    /// Resolves to `false` when the bus is not running, when no tokio
    /// runtime is available, or when the transport fails. Failures are
    /// logged and never retried.
    pub fn send(&self, envelope: MessageEnvelope) -> SendFuture {
        let transport = match (self.gate.state(), self.current_transport()) {
            (BusState::Running, Some(transport)) => transport,
            (state, _) => {
                debug!(bus = %self.name, state = %state, "Bus not running, send rejected");
                bump(&self.gate.counters.send_failures);
                return SendFuture::ready(false);
            }
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(bus = %self.name, "No tokio runtime, send rejected");
            bump(&self.gate.counters.send_failures);
            return SendFuture::ready(false);
        };

        if !self.self_delivery {
            if let Some(dedup) = self.gate.dedup() {
                dedup.add(envelope.id());
            }
        }

        let gate = self.gate.clone();
        let task = runtime.spawn(async move {
            match transport.send(&envelope).await {
                Ok(()) => {
                    bump(&gate.counters.sent);
                    true
                }
                Err(e) => {
                    warn!(id = %envelope.id(), error = %e, "Failed to send message");
                    bump(&gate.counters.send_failures);
                    false
                }
            }
        });
        SendFuture {
            inner: SendInner::Pending(task),
        }
    }

    /// Accept one inbound envelope: dropped unless running or when already
    /// seen, otherwise handed to the receiver.
    pub fn consume(&self, envelope: MessageEnvelope) {
        self.gate.consume(envelope);
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        self.gate.state()
    }

    /// `true` while running.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.gate.state() == BusState::Running
    }

    /// Configured transport, or `store` when messaging is disabled.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        if self.config.enabled() {
            self.config.transport_kind()
        } else {
            TransportKind::Store
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.gate.counters.snapshot()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.name)
            .field("state", &self.gate.state())
            .field("transport", &self.transport_kind())
            .field("self_delivery", &self.self_delivery)
            .finish()
    }
}
