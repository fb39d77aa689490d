//! `SQLite`-backed implementation of [`CheckpointStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{self, StoreOp, StateError};
use crate::store::CheckpointStore;

/// `SQLite` datetime format (UTC, no timezone suffix). Sorts lexically.
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for the checkpoint table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    expires_at TEXT
);
";

/// `SQLite`-backed checkpoint storage.
///
/// Create with [`SqliteCheckpointStore::open`] for file-backed persistence
/// or [`SqliteCheckpointStore::in_memory`] for tests. Entries written while
/// a TTL is configured read as missing once expired.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
    ttl: Option<Duration>,
}

impl SqliteCheckpointStore {
    /// Open or create a checkpoint database at `path`, dropping expired
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CreateDir`] if the directory can't be created,
    /// or [`StateError::Database`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(StateError::database(StoreOp::Open))?;
        let store = Self::init(conn)?;
        let purged = store.purge_expired()?;
        if purged > 0 {
            tracing::debug!(purged, path = %path.display(), "Dropped expired checkpoints");
        }
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the in-memory database can't be
    /// initialized.
    pub fn in_memory() -> error::Result<Self> {
        Self::init(Connection::open_in_memory().map_err(StateError::database(StoreOp::Open))?)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::database(StoreOp::Open))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ttl: None,
        })
    }

    /// Expire entries `ttl` after they are written.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Store `value` under `key` with an explicit expiry (`None` never
    /// expires).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn put_until(
        &self,
        key: &str,
        value: &[u8],
        expires_at: Option<DateTime<Utc>>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoints (key, value, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
            params![
                key,
                value,
                Self::format_ts(Utc::now()),
                expires_at.map(Self::format_ts)
            ],
        )
        .map_err(StateError::database(StoreOp::Write))?;
        Ok(())
    }

    /// Delete every expired entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn purge_expired(&self) -> error::Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM checkpoints WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![Self::format_ts(Utc::now())],
        )
        .map_err(StateError::database(StoreOp::Purge))?;
        Ok(removed)
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn format_ts(ts: DateTime<Utc>) -> String {
        ts.format(SQLITE_DATETIME_FMT).to_string()
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get(&self, key: &str) -> error::Result<Option<Vec<u8>>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM checkpoints
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, Self::format_ts(Utc::now())],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::database(StoreOp::Read))?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> error::Result<()> {
        let expires_at = self
            .ttl
            .and_then(|ttl| chrono::TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self.put_until(key, value, expires_at)
    }
}
