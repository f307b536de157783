//! NATS transport.
//!
//! Reconnects are left to the client: unlimited attempts, a fixed delay
//! between them, and subscriptions that survive a reconnect. The delivery
//! task only has to pump the subscriber; it is still supervised so a
//! subscriber that ends is re-created.

use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, Event, ServerAddr};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{Endpoint, MessageEnvelope};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::reconnect::{supervise, Shutdown};
use super::{Transport, TransportContext};
use crate::config::{AuthMethod, BusConfig, TransportKind};
use crate::error::TransportError;

const KIND: TransportKind = TransportKind::LightweightPubsub;

/// `nats://host:port`, or `tls://` when TLS is on.
pub(crate) fn server_url(endpoint: &Endpoint, config: &BusConfig) -> String {
    let tls = config.tls();
    let scheme = if tls { "tls" } else { "nats" };
    let port = endpoint.port_or(KIND.default_port(tls).unwrap_or(4222));
    format!("{scheme}://{}:{port}", endpoint.host())
}

/// Creds file contents assembled from a user JWT and its nkey seed.
pub(crate) fn creds_document(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{}\n------END NATS USER JWT------\n\n\
         -----BEGIN USER NKEY SEED-----\n{}\n------END USER NKEY SEED------\n",
        jwt.trim(),
        seed.trim()
    )
}

async fn read_trimmed(path: &std::path::Path) -> std::io::Result<String> {
    Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
}

/// Delay before every reconnect attempt: the transport's configured delay,
/// whatever the attempt count.
fn reconnect_schedule(ctx: &TransportContext) -> impl Fn(usize) -> Duration + Send + Sync + 'static {
    let delay = ctx.reconnect_delay;
    move |_attempts| delay
}

/// Client options for `config`, credentials included.
async fn connect_options(ctx: &TransportContext, config: &BusConfig) -> std::io::Result<ConnectOptions> {
    let mut options = ConnectOptions::new()
        .name(ctx.name.as_str())
        .max_reconnects(None::<usize>)
        .reconnect_delay_callback(reconnect_schedule(ctx))
        .require_tls(config.tls())
        .event_callback(|event| async move {
            match event {
                Event::Disconnected => warn!("Disconnected from NATS, reconnecting"),
                Event::Connected => info!("Connected to NATS"),
                other => debug!(event = %other, "NATS client event"),
            }
        });

    match config.auth_method() {
        AuthMethod::Password if !config.username().is_empty() => {
            options = options
                .user_and_password(config.username().to_string(), config.password().to_string());
        }
        AuthMethod::Token if !config.auth_token().is_empty() => {
            options = options.token(config.auth_token().to_string());
        }
        _ => {}
    }

    let settings = config.lightweight();
    if let Some(path) = &settings.credentials_path {
        options = options.credentials_file(path).await?;
    } else if let Some(seed_path) = &settings.nkey_seed_path {
        let seed = read_trimmed(seed_path).await?;
        options = match &settings.jwt_file_path {
            Some(jwt_path) => {
                let jwt = read_trimmed(jwt_path).await?;
                options.credentials(&creds_document(&jwt, &seed))?
            }
            None => options.nkey(seed),
        };
    }
    Ok(options)
}

/// Subscribe and deliver until the subscriber ends.
async fn run_subscription(
    client: Client,
    subject: String,
    ctx: TransportContext,
) -> Result<(), String> {
    let mut subscriber = client
        .subscribe(subject.clone())
        .await
        .map_err(|e| e.to_string())?;
    debug!(subject = %subject, "Subscribed to NATS subject");
    while let Some(message) = subscriber.next().await {
        ctx.deliver(KIND, &message.payload);
    }
    Err("subscription ended".to_string())
}

/// The `lightweight-pubsub` transport.
pub struct LightweightTransport {
    ctx: TransportContext,
    subject: String,
    client: Mutex<Option<Client>>,
    shutdown: Mutex<Shutdown>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl LightweightTransport {
    #[must_use]
    pub fn new(ctx: TransportContext) -> Self {
        let subject = ctx.channel();
        Self {
            ctx,
            subject,
            client: Mutex::new(None),
            shutdown: Mutex::new(Shutdown::new()),
            subscriber: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for LightweightTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn init(&self, config: &BusConfig) -> Result<(), TransportError> {
        let servers = config
            .endpoints()
            .iter()
            .map(|endpoint| server_url(endpoint, config).parse::<ServerAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::init(KIND, e))?;

        let options = connect_options(&self.ctx, config)
            .await
            .map_err(|e| TransportError::init(KIND, format!("credentials: {e}")))?;
        let client = options
            .connect(servers.as_slice())
            .await
            .map_err(|e| TransportError::init(KIND, e))?;

        *self.client.lock() = Some(client);
        *self.shutdown.lock() = Shutdown::new();
        info!(endpoints = %config.endpoints(), subject = %self.subject, "Connected to NATS");
        Ok(())
    }

    async fn enable(&self, _config: &BusConfig) -> Result<(), TransportError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| TransportError::enable(KIND, "transport not initialized"))?;

        let subject = self.subject.clone();
        let ctx = self.ctx.clone();
        let delay = self.ctx.reconnect_delay;
        let shutdown = self.shutdown.lock().subscribe();

        let task = tokio::spawn(supervise(KIND, delay, shutdown, move |_| {
            run_subscription(client.clone(), subject.clone(), ctx.clone())
        }));
        if let Some(previous) = self.subscriber.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or_else(|| TransportError::io(KIND, "transport not initialized"))?;
        let bytes = self.ctx.encode(KIND, envelope)?;
        client
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| TransportError::io(KIND, e))?;
        client.flush().await.map_err(|e| TransportError::io(KIND, e))
    }

    async fn close(&self) {
        self.shutdown.lock().trigger();
        let subscriber = self.subscriber.lock().take();
        if let Some(task) = subscriber {
            if tokio::time::timeout(crate::SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("NATS subscriber did not stop in time");
            }
        }
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "NATS flush on close failed");
            }
        }
    }
}
