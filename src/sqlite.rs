//! SQLite key-value store.
//!
//! The embedded, durable backend used for the local scope by default.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Conditional writes and deletes inside one transaction each
//! - Store-wide revision counter persisted alongside the data
//! - Watch via in-memory channels (per-process)

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::store::{dir_prefix, parent_prefixes, validate_key, Entry, KvStore};
use crate::watch::{WatchEvent, WatchSender, WatchStream, DEFAULT_EVENT_CAPACITY};

type EntryRow = (String, Vec<u8>, i64, i64, i64);

/// SQLite implementation of KvStore.
///
/// Watch notifications are in-process only (not shared across processes).
pub struct SqliteStore {
    pool: SqlitePool,
    watcher: WatchSender,
}

impl SqliteStore {
    /// Open or create a SQLite store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_event_capacity(path, DEFAULT_EVENT_CAPACITY).await
    }

    /// Open or create a store whose watch channel buffers `capacity` events.
    pub async fn open_with_event_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening SQLite store");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StateError::StoreUnavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StateError::StoreUnavailable(e.to_string()))?;

        Self::with_pool(pool, capacity).await
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StateError::StoreUnavailable(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StateError::StoreUnavailable(e.to_string()))?;

        Self::with_pool(pool, DEFAULT_EVENT_CAPACITY).await
    }

    async fn with_pool(pool: SqlitePool, capacity: usize) -> Result<Self> {
        let store = Self {
            pool,
            watcher: WatchSender::new(capacity),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Directories are never removed: an emptied collection lists
            -- as empty rather than absent.
            CREATE TABLE IF NOT EXISTS kv_dirs (
                prefix TEXT PRIMARY KEY NOT NULL
            );

            CREATE TABLE IF NOT EXISTS kv_meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                revision INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO kv_meta (id, revision) VALUES (0, 0);
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Bump the revision counter. Being the first write of the
    /// transaction, this also takes the database write lock.
    async fn next_revision(tx: &mut Transaction<'_, Sqlite>) -> Result<u64> {
        let (revision,): (i64,) =
            sqlx::query_as("UPDATE kv_meta SET revision = revision + 1 WHERE id = 0 RETURNING revision")
                .fetch_one(&mut **tx)
                .await?;
        Ok(revision as u64)
    }

    /// Version of `key` inside the transaction, if it exists.
    async fn current_version(tx: &mut Transaction<'_, Sqlite>, key: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(row.map(|(version,)| version as u64))
    }

    /// Get current Unix timestamp.
    fn now_unix() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Convert Unix timestamp to SystemTime.
    fn unix_to_system_time(unix: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64)
    }

    fn row_to_entry((key, value, version, created_at, updated_at): EntryRow) -> Entry {
        Entry {
            key,
            value,
            version: version as u64,
            created_at: Self::unix_to_system_time(created_at),
            updated_at: Self::unix_to_system_time(updated_at),
        }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        validate_key(key)?;

        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, value, version, created_at, updated_at FROM kv_store WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_entry))
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<u64> {
        validate_key(key)?;

        let mut tx = self.pool.begin().await?;
        let version = Self::next_revision(&mut tx).await?;
        let existing = Self::current_version(&mut tx, key).await?;

        let current_version = existing.unwrap_or(0);
        if current_version != expected_version {
            // Dropping the transaction rolls the revision bump back.
            return Err(StateError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: current_version,
            });
        }

        let now = Self::now_unix();
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(version as i64)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for dir in parent_prefixes(key) {
            sqlx::query("INSERT OR IGNORE INTO kv_dirs (prefix) VALUES (?)")
                .bind(dir)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.watcher.send(match existing {
            Some(_) => WatchEvent::updated(key),
            None => WatchEvent::created(key),
        });

        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        validate_key(key)?;

        let mut tx = self.pool.begin().await?;
        Self::next_revision(&mut tx).await?;
        let Some(current_version) = Self::current_version(&mut tx, key).await? else {
            return Err(StateError::KeyNotFound(key.to_string()));
        };
        if current_version != expected_version {
            return Err(StateError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                found: current_version,
            });
        }

        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.watcher.send(WatchEvent::deleted(key));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let prefix = dir_prefix(prefix);

        let dir: Option<(String,)> = sqlx::query_as("SELECT prefix FROM kv_dirs WHERE prefix = ?")
            .bind(&prefix)
            .fetch_optional(&self.pool)
            .await?;
        if dir.is_none() {
            return Err(StateError::KeyNotFound(prefix));
        }

        // '0' sorts right after '/', so [prefix, upper) is exactly the subtree.
        let upper = format!("{}0", &prefix[..prefix.len() - 1]);
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT key, value, version, created_at, updated_at FROM kv_store WHERE key >= ? AND key < ? ORDER BY key",
        )
        .bind(&prefix)
        .bind(&upper)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_entry).collect())
    }

    fn watch(&self, pattern: &str) -> Result<WatchStream> {
        Ok(self.watcher.subscribe(pattern))
    }
}
