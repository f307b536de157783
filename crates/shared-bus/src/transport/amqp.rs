//! AMQP transport.
//!
//! Each instance declares a non-durable, auto-delete topic exchange named
//! after the bus and binds its own exclusive, server-named queue with the
//! routing key `{name}:message`. Publishing goes to the exchange with the
//! same routing key, so every bound queue gets a copy.
//!
//! Endpoints are tried in order on every connect. The first connect retries
//! once after the reconnect delay before `init` gives up; after that the
//! supervisor reconnects indefinitely.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use parking_lot::Mutex;
use shared_types::{Endpoint, MessageEnvelope};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::reconnect::{sleep_or_shutdown, supervise, Shutdown};
use super::{Transport, TransportContext};
use crate::config::{AuthMethod, BusConfig, TransportKind};
use crate::error::TransportError;

const KIND: TransportKind = TransportKind::Amqp;

/// Broker URI for one endpoint.
pub(crate) fn broker_uri(endpoint: &Endpoint, config: &BusConfig) -> AMQPUri {
    let tls = config.tls();
    let userinfo = match config.auth_method() {
        AuthMethod::Password if !config.username().is_empty() => AMQPUserInfo {
            username: config.username().to_string(),
            password: config.password().to_string(),
        },
        _ => AMQPUserInfo::default(),
    };
    AMQPUri {
        scheme: if tls {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo,
            host: endpoint.host().to_string(),
            port: endpoint.port_or(KIND.default_port(tls).unwrap_or(5672)),
        },
        vhost: config.amqp().virtual_host.clone(),
        query: AMQPQueryString::default(),
    }
}

/// One connected channel with its consumer.
struct Session {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

struct Shared {
    ctx: TransportContext,
    exchange: String,
    routing_key: String,
    uris: Mutex<Vec<AMQPUri>>,
    /// Channel used for publishing; replaced on reconnect.
    channel: Mutex<Option<Channel>>,
    connection: Mutex<Option<Connection>>,
    /// Session opened by `init`, handed to the supervisor on `enable`.
    pending: Mutex<Option<Session>>,
}

impl Shared {
    async fn open_session(&self) -> Result<Session, String> {
        let uris = self.uris.lock().clone();
        let mut last_error = String::from("no endpoints");
        let mut connected = None;
        for uri in uris {
            let host = uri.authority.host.clone();
            match Connection::connect_uri(uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    connected = Some(connection);
                    break;
                }
                Err(e) => {
                    debug!(host = %host, error = %e, "AMQP endpoint unreachable");
                    last_error = e.to_string();
                }
            }
        }
        let connection = connected.ok_or(last_error)?;

        let setup = async {
            let channel = connection.create_channel().await?;
            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        durable: false,
                        exclusive: true,
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .exchange_declare(
                    &self.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: false,
                        auto_delete: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &self.exchange,
                    &self.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            let consumer = channel
                .basic_consume(
                    queue.name().as_str(),
                    "",
                    BasicConsumeOptions {
                        no_ack: true,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Ok::<_, lapin::Error>((channel, consumer))
        };

        match setup.await {
            Ok((channel, consumer)) => Ok(Session {
                connection,
                channel,
                consumer,
            }),
            Err(e) => {
                let _ = connection.close(200, "setup failed").await;
                Err(e.to_string())
            }
        }
    }

    /// Make `session` the live one and return its consumer.
    fn install(&self, session: Session) -> Consumer {
        *self.channel.lock() = Some(session.channel);
        *self.connection.lock() = Some(session.connection);
        session.consumer
    }

    async fn close_live(&self) {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close(200, "closing").await {
                debug!(error = %e, "AMQP channel close failed");
            }
        }
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close(200, "closing").await {
                debug!(error = %e, "AMQP connection close failed");
            }
        }
    }

    /// One supervised session: reuse the `init` session or connect anew,
    /// then deliver until the consumer ends.
    async fn run(self: Arc<Self>, attempt: u64) -> Result<(), String> {
        let pending = self.pending.lock().take();
        let session = match pending {
            Some(session) => session,
            None => self.open_session().await?,
        };
        if attempt > 0 {
            info!("Connection to AMQP broker reestablished");
        }

        let mut consumer = self.install(session);
        let outcome = loop {
            match consumer.next().await {
                Some(Ok(delivery)) => self.ctx.deliver(KIND, &delivery.data),
                Some(Err(e)) => break Err(e.to_string()),
                None => break Err("consumer cancelled".to_string()),
            }
        };
        self.close_live().await;
        outcome
    }
}

/// The `amqp` transport.
pub struct AmqpTransport {
    shared: Arc<Shared>,
    shutdown: Mutex<Shutdown>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    #[must_use]
    pub fn new(ctx: TransportContext) -> Self {
        let exchange = crate::exchange_name(&ctx.name);
        let routing_key = ctx.channel();
        Self {
            shared: Arc::new(Shared {
                ctx,
                exchange,
                routing_key,
                uris: Mutex::new(Vec::new()),
                channel: Mutex::new(None),
                connection: Mutex::new(None),
                pending: Mutex::new(None),
            }),
            shutdown: Mutex::new(Shutdown::new()),
            supervisor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn init(&self, config: &BusConfig) -> Result<(), TransportError> {
        *self.shared.uris.lock() = config
            .endpoints()
            .iter()
            .map(|endpoint| broker_uri(endpoint, config))
            .collect();
        let shutdown = Shutdown::new();
        let mut stop = shutdown.subscribe();
        *self.shutdown.lock() = shutdown;

        let session = match self.shared.open_session().await {
            Ok(session) => session,
            Err(first) => {
                warn!(
                    error = %first,
                    "Unable to connect to AMQP broker, retrying in {:?}",
                    self.shared.ctx.reconnect_delay
                );
                if !sleep_or_shutdown(self.shared.ctx.reconnect_delay, &mut stop).await {
                    return Err(TransportError::init(KIND, "closed while connecting"));
                }
                self.shared
                    .open_session()
                    .await
                    .map_err(|e| TransportError::init(KIND, e))?
            }
        };

        *self.shared.channel.lock() = Some(session.channel.clone());
        *self.shared.pending.lock() = Some(session);
        info!(endpoints = %config.endpoints(), exchange = %self.shared.exchange, "Connected to AMQP broker");
        Ok(())
    }

    async fn enable(&self, _config: &BusConfig) -> Result<(), TransportError> {
        if self.shared.channel.lock().is_none() {
            return Err(TransportError::enable(KIND, "transport not initialized"));
        }
        let shared = self.shared.clone();
        let delay = shared.ctx.reconnect_delay;
        let stop = self.shutdown.lock().subscribe();

        let task = tokio::spawn(supervise(KIND, delay, stop, move |attempt| {
            shared.clone().run(attempt)
        }));
        if let Some(previous) = self.supervisor.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let channel = self
            .shared
            .channel
            .lock()
            .clone()
            .ok_or_else(|| TransportError::io(KIND, "no open channel"))?;
        let bytes = self.shared.ctx.encode(KIND, envelope)?;
        channel
            .basic_publish(
                &self.shared.exchange,
                &self.shared.routing_key,
                BasicPublishOptions::default(),
                &bytes,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| TransportError::io(KIND, e))?
            .await
            .map_err(|e| TransportError::io(KIND, e))?;
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.lock().trigger();
        let supervisor = self.supervisor.lock().take();
        if let Some(task) = supervisor {
            if tokio::time::timeout(crate::SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("AMQP supervisor did not stop in time");
            }
        }

        let pending = self.shared.pending.lock().take();
        if let Some(session) = pending {
            self.shared.install(session);
        }
        self.shared.close_live().await;
    }
}
