use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};

use crate::error::SyncError;

/// Durable key-value blob storage for the outbox. Owned exclusively by the
/// [`OutboxManager`](super::OutboxManager); nothing else reads or writes it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), SyncError>;
}

/// Sqlite-backed queue store, WAL-journaled so a crash mid-write leaves the
/// previous blob intact.
#[derive(Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, SyncError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_blobs (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let value = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT value FROM queue_blobs WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO queue_blobs (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Volatile queue store for tests and ephemeral profiles.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), SyncError> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
