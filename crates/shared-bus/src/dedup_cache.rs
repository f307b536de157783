//! # Self-Dedup Cache
//!
//! Remembers message ids the local instance has sent or handled so that a
//! broadcast echoed back by the transport, or a message redelivered after a
//! reconnect, is not handed to the receiver twice.
//!
//! ## Expiry
//!
//! - Every read treats an entry older than the TTL as absent.
//! - When a tokio runtime is available, a sweeper task drops expired entries
//!   once per TTL, so memory never holds an entry past 2x TTL.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Millisecond clock used for expiry decisions.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds.
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: AtomicU64,
}

impl ManualTimeSource {
    /// Start the clock at `start_millis`.
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct Entries {
    /// id -> insertion time in ms.
    seen: Mutex<HashMap<Uuid, u64>>,
    ttl_ms: u64,
    clock: Arc<dyn TimeSource>,
}

impl Entries {
    fn is_live(&self, inserted_at: u64, now: u64) -> bool {
        now.saturating_sub(inserted_at) < self.ttl_ms
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, inserted_at| now.saturating_sub(*inserted_at) < self.ttl_ms);
        before - seen.len()
    }
}

/// Time-bounded set of seen message ids.
pub struct DedupCache {
    entries: Arc<Entries>,
    sweeper: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl DedupCache {
    /// Cache with the given TTL on the wall clock.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_time_source(ttl, Arc::new(SystemTimeSource))
    }

    /// Cache with the given TTL on a custom clock.
    #[must_use]
    pub fn with_time_source(ttl: Duration, clock: Arc<dyn TimeSource>) -> Self {
        let entries = Arc::new(Entries {
            seen: Mutex::new(HashMap::new()),
            ttl_ms: (ttl.as_millis() as u64).max(1),
            clock,
        });
        let sweeper = Self::spawn_sweeper(Arc::downgrade(&entries), ttl);
        Self {
            entries,
            sweeper: Mutex::new(sweeper),
        }
    }

    fn spawn_sweeper(
        entries: Weak<Entries>,
        period: Duration,
    ) -> Option<(watch::Sender<bool>, JoinHandle<()>)> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let period = period.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = handle.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(entries) = entries.upgrade() else { break };
                        let removed = entries.sweep();
                        if removed > 0 {
                            debug!(removed, "Expired dedup entries swept");
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Some((stop_tx, task))
    }

    /// Remember `id`. Re-adding refreshes its insertion time.
    pub fn add(&self, id: Uuid) {
        let now = self.entries.clock.now_millis();
        self.entries.seen.lock().insert(id, now);
    }

    /// Whether `id` was seen within the TTL.
    #[must_use]
    pub fn contains(&self, id: &Uuid) -> bool {
        let now = self.entries.clock.now_millis();
        let mut seen = self.entries.seen.lock();
        match seen.get(id) {
            Some(&inserted_at) if self.entries.is_live(inserted_at, now) => true,
            Some(_) => {
                seen.remove(id);
                false
            }
            None => false,
        }
    }

    /// Remember `id` unless it is already live. Returns `true` when it was
    /// newly added.
    pub fn insert_if_absent(&self, id: Uuid) -> bool {
        let now = self.entries.clock.now_millis();
        let mut seen = self.entries.seen.lock();
        match seen.get(&id) {
            Some(&inserted_at) if self.entries.is_live(inserted_at, now) => false,
            _ => {
                seen.insert(id, now);
                true
            }
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.entries.clock.now_millis();
        self.entries
            .seen
            .lock()
            .values()
            .filter(|&&inserted_at| self.entries.is_live(inserted_at, now))
            .count()
    }

    /// Whether no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and stop the sweeper. Idempotent.
    pub fn close(&self) {
        self.entries.seen.lock().clear();
        if let Some((stop_tx, task)) = self.sweeper.lock().take() {
            let _ = stop_tx.send(true);
            task.abort();
        }
    }

    /// Entries held in memory, expired or not.
    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.seen.lock().len()
    }
}

impl Drop for DedupCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("ttl_ms", &self.entries.ttl_ms)
            .field("entries", &self.entries.seen.lock().len())
            .finish()
    }
}
