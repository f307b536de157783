//! # Shared Bus - Cross-Instance Message Bus
//!
//! Propagates small application events between independent runtime
//! instances. One publish/subscribe contract is implemented over five
//! transports:
//!
//! | Kind                 | Mechanism                               |
//! |----------------------|-----------------------------------------|
//! | `store`              | shared relational store, polled         |
//! | `kv-pubsub`          | Redis pub/sub                           |
//! | `amqp`               | AMQP topic exchange                     |
//! | `lightweight-pubsub` | NATS subjects                           |
//! | `host-local`         | host-provided point-to-point channel    |
//!
//! ## Flow
//!
//! ```text
//!  send()                                             receiver.deliver()
//!    │                                                        ▲
//!    ▼                                                        │
//! ┌────────────┐  encode  ┌───────────┐  bytes  ┌───────────┐ │ dedup
//! │ MessageBus │ ───────▶ │ Transport │ ──────▶ │ Transport │─┘
//! └────────────┘          └───────────┘         └───────────┘
//!   instance A              broker / store         instance B
//! ```
//!
//! Every sent id is remembered for ten minutes so an instance never handles
//! its own broadcast.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod config;
pub mod dedup_cache;
pub mod error;
pub mod host;
pub mod receiver;
pub mod scheduler;
pub mod store;
pub mod transport;

use std::time::Duration;

pub use bus::{BusContext, BusState, BusStats, MessageBus, SendFuture};
pub use config::{
    AmqpSettings, AuthMethod, BusConfig, LightweightSettings, RawBusConfig, TransportKind,
};
pub use dedup_cache::{DedupCache, ManualTimeSource, SystemTimeSource, TimeSource};
pub use error::{BusError, TransportError};
pub use host::{HostChannel, HostChannelError, InboundHook, LocalHostHub, LocalHostPort};
pub use receiver::{ChannelReceiver, FnReceiver, Inbox, InboxError, MessageReceiver};
pub use scheduler::{TaskHandle, TaskScheduler, TokioScheduler};
pub use store::{InMemoryStore, MessageStore, StoreError};
pub use transport::{build_transport, MessageConsumer, Transport, TransportContext};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

pub use shared_types::{Codec, MessageEnvelope, PayloadRegistry};

/// How long a seen message id suppresses redelivery.
pub const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// Delay between reconnect attempts of the push transports.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on a transport's `close` during shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel/subject/routing key used by a bus called `name`.
#[must_use]
pub fn channel_name(name: &str) -> String {
    format!("{}:message", name.to_lowercase())
}

/// AMQP exchange used by a bus called `name`.
#[must_use]
pub fn exchange_name(name: &str) -> String {
    name.to_lowercase()
}
