//! wagate_memory
//! Keyed memory of already-relayed messages with per-entry expiry.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

/// Key prefix for messages already forwarded to the webhook
pub const SENT_MESSAGE_PREFIX: &str = "sent-message:";

pub fn sent_message_key(message_id: &str) -> String {
    format!("{}{}", SENT_MESSAGE_PREFIX, message_id)
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Time-bounded set of processed keys.
#[async_trait]
pub trait MessageDedupStore: Send + Sync {
    /// Record `key` with the time it was stored (unix seconds); the entry
    /// disappears once `ttl` has elapsed.
    async fn put(&self, key: &str, stored_at: i64, ttl: Duration) -> Result<(), DedupError>;

    /// Whether an unexpired entry exists for `key`.
    async fn contains(&self, key: &str) -> Result<bool, DedupError>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, DedupError>;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// SQLite-backed store, one row per key
pub struct SqliteDedupStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteDedupStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DedupError> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS dedup (
                key TEXT PRIMARY KEY,
                stored_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dedup_expires ON dedup (expires_at);
            "#,
        )?;

        tracing::debug!(path = %db_path.display(), "dedup store opened");
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait]
impl MessageDedupStore for SqliteDedupStore {
    async fn put(&self, key: &str, stored_at: i64, ttl: Duration) -> Result<(), DedupError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO dedup (key, stored_at, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET stored_at = excluded.stored_at,
                                            expires_at = excluded.expires_at",
            params![key, stored_at, expiry_millis(ttl)],
        )?;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, DedupError> {
        let conn = self.conn.lock().await;
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM dedup WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at.is_some_and(|at| at > now_millis()))
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM dedup WHERE expires_at <= ?1",
            params![now_millis()],
        )?;
        Ok(removed)
    }
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryDedupStore {
    // key -> (stored_at, expires_at millis)
    entries: Mutex<HashMap<String, (i64, i64)>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Stored-at timestamp of `key`, expired or not.
    pub async fn stored_at(&self, key: &str) -> Option<i64> {
        self.entries.lock().await.get(key).map(|(stored, _)| *stored)
    }
}

#[async_trait]
impl MessageDedupStore for InMemoryDedupStore {
    async fn put(&self, key: &str, stored_at: i64, ttl: Duration) -> Result<(), DedupError> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (stored_at, expiry_millis(ttl)));
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, DedupError> {
        let now = now_millis();
        Ok(self
            .entries
            .lock()
            .await
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > now))
    }

    async fn purge_expired(&self) -> Result<usize, DedupError> {
        let now = now_millis();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_sent_message_key() {
        assert_eq!(sent_message_key("ABC123"), "sent-message:ABC123");
    }

    #[tokio::test]
    async fn test_sqlite_put_contains() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SqliteDedupStore::open(temp.path().join("dedup.sqlite")).expect("open");

        assert!(!store.contains("sent-message:m1").await.expect("contains"));
        store
            .put("sent-message:m1", 1_700_000_000, 30 * DAY)
            .await
            .expect("put");
        assert!(store.contains("sent-message:m1").await.expect("contains"));
        assert!(!store.contains("sent-message:m2").await.expect("contains"));
    }

    #[tokio::test]
    async fn test_sqlite_expired_entry_is_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SqliteDedupStore::open(temp.path().join("dedup.sqlite")).expect("open");

        store.put("k", 1, Duration::ZERO).await.expect("put");
        assert!(!store.contains("k").await.expect("contains"));
        assert_eq!(store.purge_expired().await.expect("purge"), 1);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("dedup.sqlite");
        {
            let store = SqliteDedupStore::open(&path).expect("open");
            store.put("k", 1, DAY).await.expect("put");
        }
        let store = SqliteDedupStore::open(&path).expect("reopen");
        assert!(store.contains("k").await.expect("contains"));
    }

    #[tokio::test]
    async fn test_in_memory_expiry_and_purge() {
        let store = InMemoryDedupStore::new();
        store.put("live", 5, DAY).await.expect("put");
        store.put("dead", 6, Duration::ZERO).await.expect("put");

        assert!(store.contains("live").await.expect("contains"));
        assert!(!store.contains("dead").await.expect("contains"));
        assert_eq!(store.stored_at("live").await, Some(5));

        assert_eq!(store.purge_expired().await.expect("purge"), 1);
        assert_eq!(store.len().await, 1);
    }
}
