//! # Message Store
//!
//! Storage behind the `store` transport. Rows carry a store-assigned id that
//! only grows, which is what lets readers track a watermark instead of
//! per-row read state.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryStore`]: process-local, shared between bus instances by `Arc`.
//! - `SqliteStore` (feature `sqlite`): a file shared between processes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::dedup_cache::{SystemTimeSource, TimeSource};

/// Errors from a message store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is not reachable.
    #[error("Message store unavailable")]
    Unavailable,

    /// The backend rejected the operation.
    #[error("Message store error: {0}")]
    Backend(String),
}

/// Append-only message log with id watermarks.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Whether the store can be used at all.
    async fn is_available(&self) -> bool;

    /// Append `body` to `channel` and return the new row id.
    async fn append(&self, channel: &str, body: &str) -> Result<i64, StoreError>;

    /// Every row on `channel` with an id above `watermark`, by id.
    async fn fetch_since(
        &self,
        channel: &str,
        watermark: i64,
    ) -> Result<BTreeMap<i64, String>, StoreError>;

    /// Highest id on `channel`, if any row exists.
    async fn latest_id(&self, channel: &str) -> Result<Option<i64>, StoreError>;

    /// Delete rows on `channel` older than `retention`. Returns the count.
    async fn delete_older_than(&self, channel: &str, retention: Duration)
        -> Result<u64, StoreError>;
}

#[derive(Debug)]
struct Row {
    channel: String,
    body: String,
    created_at_ms: u64,
}

#[derive(Debug, Default)]
struct Rows {
    last_id: i64,
    rows: BTreeMap<i64, Row>,
}

/// Process-local store. Ids are never reused, even after deletion.
pub struct InMemoryStore {
    rows: Mutex<Rows>,
    available: AtomicBool,
    clock: Arc<dyn TimeSource>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }

    /// Store whose row ages are measured on `clock`.
    #[must_use]
    pub fn with_time_source(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            rows: Mutex::new(Rows::default()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Toggle availability, to simulate an unreachable database.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Rows currently held, across channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("rows", &self.len())
            .field("available", &self.available())
            .finish()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn is_available(&self) -> bool {
        self.available()
    }

    async fn append(&self, channel: &str, body: &str) -> Result<i64, StoreError> {
        self.check()?;
        let created_at_ms = self.clock.now_millis();
        let mut rows = self.rows.lock();
        rows.last_id += 1;
        let id = rows.last_id;
        rows.rows.insert(
            id,
            Row {
                channel: channel.to_string(),
                body: body.to_string(),
                created_at_ms,
            },
        );
        Ok(id)
    }

    async fn fetch_since(
        &self,
        channel: &str,
        watermark: i64,
    ) -> Result<BTreeMap<i64, String>, StoreError> {
        self.check()?;
        let rows = self.rows.lock();
        let start = watermark.saturating_add(1);
        Ok(rows
            .rows
            .range(start..)
            .filter(|(_, row)| row.channel == channel)
            .map(|(id, row)| (*id, row.body.clone()))
            .collect())
    }

    async fn latest_id(&self, channel: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        let rows = self.rows.lock();
        Ok(rows
            .rows
            .iter()
            .rev()
            .find(|(_, row)| row.channel == channel)
            .map(|(id, _)| *id))
    }

    async fn delete_older_than(
        &self,
        channel: &str,
        retention: Duration,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(retention.as_millis() as u64);
        let mut rows = self.rows.lock();
        let before = rows.rows.len();
        rows.rows
            .retain(|_, row| row.channel != channel || row.created_at_ms >= cutoff);
        Ok((before - rows.rows.len()) as u64)
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use std::path::Path;

    use rusqlite::{params, Connection, OptionalExtension};
    use tracing::debug;

    /// SQLite-backed store. Several processes may open the same file.
    pub struct SqliteStore {
        conn: Arc<Mutex<Connection>>,
        clock: Arc<dyn TimeSource>,
    }

    impl SqliteStore {
        /// Open or create the database at `path`.
        ///
        /// # Errors
        ///
        /// `StoreError::Backend` if the file cannot be opened or the schema
        /// cannot be created.
        pub fn open(path: &Path) -> Result<Self, StoreError> {
            let conn = Connection::open(path)
                .map_err(|e| StoreError::Backend(format!("Failed to open database: {e}")))?;
            Self::with_connection(conn, Arc::new(SystemTimeSource))
        }

        /// Private in-memory database, mostly for tests.
        ///
        /// # Errors
        ///
        /// `StoreError::Backend` if the schema cannot be created.
        pub fn open_in_memory() -> Result<Self, StoreError> {
            let conn = Connection::open_in_memory()
                .map_err(|e| StoreError::Backend(format!("Failed to open database: {e}")))?;
            Self::with_connection(conn, Arc::new(SystemTimeSource))
        }

        /// Wrap an open connection, using `clock` for row ages.
        ///
        /// # Errors
        ///
        /// `StoreError::Backend` if the schema cannot be created.
        pub fn with_connection(
            conn: Connection,
            clock: Arc<dyn TimeSource>,
        ) -> Result<Self, StoreError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS bus_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    channel TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_bus_messages_channel
                    ON bus_messages(channel, id);
                CREATE INDEX IF NOT EXISTS idx_bus_messages_created
                    ON bus_messages(created_at);",
            )
            .map_err(|e| StoreError::Backend(format!("Failed to create schema: {e}")))?;

            debug!("SQLite message store ready");
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
                clock,
            })
        }

        async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        {
            let conn = self.conn.clone();
            tokio::task::spawn_blocking(move || {
                let guard = conn.lock();
                op(&guard)
            })
            .await
            .map_err(|e| StoreError::Backend(format!("Store task failed: {e}")))?
            .map_err(|e| StoreError::Backend(e.to_string()))
        }
    }

    #[async_trait]
    impl MessageStore for SqliteStore {
        async fn is_available(&self) -> bool {
            self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .await
                .is_ok()
        }

        async fn append(&self, channel: &str, body: &str) -> Result<i64, StoreError> {
            let channel = channel.to_string();
            let body = body.to_string();
            let now = self.clock.now_millis() as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO bus_messages (channel, body, created_at) VALUES (?1, ?2, ?3)",
                    params![channel, body, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
        }

        async fn fetch_since(
            &self,
            channel: &str,
            watermark: i64,
        ) -> Result<BTreeMap<i64, String>, StoreError> {
            let channel = channel.to_string();
            self.with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, body FROM bus_messages WHERE channel = ?1 AND id > ?2 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![channel, watermark], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect()
            })
            .await
        }

        async fn latest_id(&self, channel: &str) -> Result<Option<i64>, StoreError> {
            let channel = channel.to_string();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT MAX(id) FROM bus_messages WHERE channel = ?1",
                    params![channel],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .map(Option::flatten)
            })
            .await
        }

        async fn delete_older_than(
            &self,
            channel: &str,
            retention: Duration,
        ) -> Result<u64, StoreError> {
            let channel = channel.to_string();
            let cutoff = self
                .clock
                .now_millis()
                .saturating_sub(retention.as_millis() as u64) as i64;
            self.with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM bus_messages WHERE channel = ?1 AND created_at < ?2",
                    params![channel, cutoff],
                )
                .map(|n| n as u64)
            })
            .await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_availability_check_waits_off_the_executor() {
            let store = SqliteStore::open_in_memory().unwrap();
            let conn = store.conn.clone();
            let busy = tokio::task::spawn_blocking(move || {
                let _guard = conn.lock();
                std::thread::sleep(Duration::from_millis(300));
            });
            tokio::time::sleep(Duration::from_millis(50)).await;

            let check = store.is_available();
            tokio::pin!(check);
            let timer_fired_first = tokio::select! {
                biased;
                _ = &mut check => false,
                _ = tokio::time::sleep(Duration::from_millis(50)) => true,
            };
            assert!(timer_fired_first);
            assert!(check.await);
            busy.await.unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup_cache::ManualTimeSource;

    #[tokio::test]
    async fn test_append_and_fetch() {
        let store = InMemoryStore::new();
        let a = store.append("bus:message", "one").await.unwrap();
        let b = store.append("bus:message", "two").await.unwrap();
        store.append("other:message", "x").await.unwrap();

        assert!(b > a);
        let all = store.fetch_since("bus:message", -1).await.unwrap();
        assert_eq!(all.values().cloned().collect::<Vec<_>>(), vec!["one", "two"]);

        let newer = store.fetch_since("bus:message", a).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer.get(&b).map(String::as_str), Some("two"));
    }

    #[tokio::test]
    async fn test_latest_id_per_channel() {
        let store = InMemoryStore::new();
        assert_eq!(store.latest_id("bus:message").await.unwrap(), None);

        let id = store.append("bus:message", "one").await.unwrap();
        store.append("other:message", "x").await.unwrap();
        assert_eq!(store.latest_id("bus:message").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let store = InMemoryStore::with_time_source(clock.clone());

        let first = store.append("c", "old").await.unwrap();
        clock.advance(Duration::from_secs(60));
        let removed = store
            .delete_older_than("c", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.is_empty());

        let next = store.append("c", "new").await.unwrap();
        assert!(next > first);
    }

    #[tokio::test]
    async fn test_delete_keeps_recent_and_other_channels() {
        let clock = Arc::new(ManualTimeSource::new(0));
        let store = InMemoryStore::with_time_source(clock.clone());

        store.append("c", "old").await.unwrap();
        store.append("d", "old-other").await.unwrap();
        clock.advance(Duration::from_secs(20));
        store.append("c", "recent").await.unwrap();

        let removed = store
            .delete_older_than("c", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(!store.is_available().await);
        assert_eq!(store.append("c", "x").await, Err(StoreError::Unavailable));
        assert_eq!(store.latest_id("c").await, Err(StoreError::Unavailable));
    }

    #[cfg(feature = "sqlite")]
    mod sqlite {
        use super::*;

        #[tokio::test]
        async fn test_sqlite_round_trip() {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteStore::open(&dir.path().join("bus.db")).unwrap();
            assert!(store.is_available().await);
            assert_eq!(store.latest_id("c").await.unwrap(), None);

            let a = store.append("c", "one").await.unwrap();
            let b = store.append("c", "two").await.unwrap();
            store.append("d", "other").await.unwrap();

            assert_eq!(store.latest_id("c").await.unwrap(), Some(b));
            let newer = store.fetch_since("c", a).await.unwrap();
            assert_eq!(newer.into_iter().collect::<Vec<_>>(), vec![(b, "two".to_string())]);
        }

        #[tokio::test]
        async fn test_sqlite_cleanup_keeps_ids_monotonic() {
            let clock = Arc::new(ManualTimeSource::new(1_000));
            let conn = rusqlite::Connection::open_in_memory().unwrap();
            let store = SqliteStore::with_connection(conn, clock.clone()).unwrap();

            let first = store.append("c", "old").await.unwrap();
            clock.advance(Duration::from_secs(60));
            assert_eq!(
                store
                    .delete_older_than("c", Duration::from_secs(30))
                    .await
                    .unwrap(),
                1
            );
            let next = store.append("c", "new").await.unwrap();
            assert!(next > first);
        }

        #[tokio::test]
        async fn test_shared_file_between_handles() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bus.db");
            let writer = SqliteStore::open(&path).unwrap();
            let reader = SqliteStore::open(&path).unwrap();

            let id = writer.append("c", "hello").await.unwrap();
            let rows = reader.fetch_since("c", -1).await.unwrap();
            assert_eq!(rows.get(&id).map(String::as_str), Some("hello"));
        }
    }
}
