//! Poll-based transport over a shared [`MessageStore`].
//!
//! Sends append a row. Every polling interval the transport fetches rows
//! above its watermark, delivers them in id order and raises the watermark to
//! the highest id seen. Every cleanup interval it deletes rows older than
//! the cleanup interval.
//!
//! Appends take the write side of a lock; fetch and cleanup take the read
//! side. Ids only grow, so a cleanup racing a fetch cannot make a later row
//! fall under the watermark.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::MessageEnvelope;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Transport, TransportContext};
use crate::config::{BusConfig, TransportKind};
use crate::error::TransportError;
use crate::scheduler::{RecurringTask, TaskHandle};
use crate::store::MessageStore;

const KIND: TransportKind = TransportKind::Store;

/// Watermark before anything has been read.
pub const NO_WATERMARK: i64 = -1;

struct Poller {
    ctx: TransportContext,
    store: Arc<dyn MessageStore>,
    channel: String,
    watermark: AtomicI64,
    lock: RwLock<()>,
    retention: Mutex<Duration>,
}

impl Poller {
    async fn poll(&self) -> Result<usize, TransportError> {
        let _read = self.lock.read().await;
        let since = self.watermark.load(Ordering::SeqCst);
        let rows = self
            .store
            .fetch_since(&self.channel, since)
            .await
            .map_err(|e| TransportError::io(KIND, e))?;

        let mut newest = since;
        let count = rows.len();
        for (id, body) in rows {
            newest = newest.max(id);
            self.ctx.deliver(KIND, body.as_bytes());
        }
        self.watermark.fetch_max(newest, Ordering::SeqCst);
        Ok(count)
    }

    async fn cleanup(&self) -> Result<u64, TransportError> {
        let _read = self.lock.read().await;
        let retention = *self.retention.lock();
        self.store
            .delete_older_than(&self.channel, retention)
            .await
            .map_err(|e| TransportError::io(KIND, e))
    }
}

/// The `store` transport.
pub struct StoreTransport {
    ctx: TransportContext,
    poller: Mutex<Option<Arc<Poller>>>,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl StoreTransport {
    #[must_use]
    pub fn new(ctx: TransportContext) -> Self {
        Self {
            ctx,
            poller: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn poller(
        &self,
        fail: fn(TransportKind, String) -> TransportError,
    ) -> Result<Arc<Poller>, TransportError> {
        self.poller
            .lock()
            .clone()
            .ok_or_else(|| fail(KIND, "transport not initialized".to_string()))
    }

    /// Current read position; `-1` before init and after close.
    #[must_use]
    pub fn watermark(&self) -> i64 {
        self.poller
            .lock()
            .as_ref()
            .map_or(NO_WATERMARK, |p| p.watermark.load(Ordering::SeqCst))
    }

    /// Run one fetch outside the schedule. Returns the rows delivered.
    ///
    /// # Errors
    ///
    /// `TransportError::Io` if the store fails; `Enable` before `init`.
    pub async fn poll_now(&self) -> Result<usize, TransportError> {
        self.poller(TransportError::enable)?.poll().await
    }

    /// Run one cleanup outside the schedule. Returns the rows deleted.
    ///
    /// # Errors
    ///
    /// `TransportError::Io` if the store fails; `Enable` before `init`.
    pub async fn cleanup_now(&self) -> Result<u64, TransportError> {
        self.poller(TransportError::enable)?.cleanup().await
    }
}

#[async_trait]
impl Transport for StoreTransport {
    fn kind(&self) -> TransportKind {
        KIND
    }

    async fn init(&self, config: &BusConfig) -> Result<(), TransportError> {
        let store = self
            .ctx
            .store
            .clone()
            .ok_or_else(|| TransportError::init(KIND, "no message store configured"))?;
        if !store.is_available().await {
            return Err(TransportError::init(KIND, "message store is not available"));
        }

        let channel = self.ctx.channel();
        let latest = store
            .latest_id(&channel)
            .await
            .map_err(|e| TransportError::init(KIND, e))?
            .unwrap_or(NO_WATERMARK);

        debug!(channel = %channel, watermark = latest, "Store transport initialized");
        *self.poller.lock() = Some(Arc::new(Poller {
            ctx: self.ctx.clone(),
            store,
            channel,
            watermark: AtomicI64::new(latest),
            lock: RwLock::new(()),
            retention: Mutex::new(config.cleanup_interval()),
        }));
        Ok(())
    }

    async fn enable(&self, config: &BusConfig) -> Result<(), TransportError> {
        let poller = self.poller(TransportError::enable)?;
        *poller.retention.lock() = config.cleanup_interval();

        let polling = config.polling_interval();
        let cleanup = config.cleanup_interval();

        let fetcher = poller.clone();
        let poll_task: RecurringTask = Box::new(move || {
            let poller = fetcher.clone();
            Box::pin(async move {
                if let Err(e) = poller.poll().await {
                    warn!(error = %e, "Store poll failed");
                }
            })
        });

        let sweeper = poller;
        let cleanup_task: RecurringTask = Box::new(move || {
            let poller = sweeper.clone();
            Box::pin(async move {
                match poller.cleanup().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "Store cleanup removed old messages"),
                    Err(e) => warn!(error = %e, "Store cleanup failed"),
                }
            })
        });

        let scheduler = &self.ctx.scheduler;
        let handles = vec![
            scheduler.schedule("store-poll", polling, polling, poll_task),
            scheduler.schedule("store-cleanup", cleanup, cleanup, cleanup_task),
        ];
        self.tasks.lock().extend(handles);

        info!(?polling, ?cleanup, "Store transport enabled");
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let poller = self.poller(TransportError::io)?;
        let body = self
            .ctx
            .codec
            .encode(envelope)
            .map_err(|e| TransportError::io(KIND, e))?;

        let _write = poller.lock.write().await;
        poller
            .store
            .append(&poller.channel, &body)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::io(KIND, e))
    }

    async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.cancel();
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.watermark.store(NO_WATERMARK, Ordering::SeqCst);
        }
    }
}
