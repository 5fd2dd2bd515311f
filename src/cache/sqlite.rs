use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::backend::CacheBackend;
use super::CacheEntry;
use crate::error::CacheError;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS feature_cache (
    key         TEXT    PRIMARY KEY,
    value       TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    expires_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feature_cache_expires ON feature_cache(expires_at);
"#;

/// Feature cache persisted in SQLite so warm entries survive a restart.
///
/// Single connection behind a mutex; statements are short point lookups.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the cache database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open cache database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let backend = Self::with_connection(conn)?;
        let purged = backend.purge_expired()?;
        if purged > 0 {
            info!("Purged {} expired cache entries from {}", purged, path);
        }
        Ok(backend)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to create feature_cache schema")?;
        Ok(SqliteBackend {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `op` against the connection on the blocking pool, so waiting for
    /// the lock or the disk never stalls a runtime worker.
    async fn blocking<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CacheError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&guard)
        })
        .await
        .map_err(|e| CacheError::Unavailable(format!("sqlite task failed: {}", e)))?
    }

    /// Drop every expired row. Returns the number removed.
    pub fn purge_expired(&self) -> Result<u64, CacheError> {
        let removed = self.conn().execute(
            "DELETE FROM feature_cache WHERE expires_at <= ?1",
            params![Utc::now()],
        )?;
        Ok(removed as u64)
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, created_at, expires_at FROM feature_cache WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, DateTime<Utc>>(1)?,
                            row.get::<_, DateTime<Utc>>(2)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((value, created_at, expires_at)) => Ok(Some(CacheEntry {
                    key,
                    value: serde_json::from_str(&value)?,
                    created_at,
                    expires_at,
                })),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let value = serde_json::to_string(&entry.value)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO feature_cache (key, value, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    created_at = excluded.created_at,
                    expires_at = excluded.expires_at",
                params![entry.key, value, entry.created_at, entry.expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM feature_cache WHERE key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let prefix = prefix.to_string();
        self.blocking(move |conn| {
            // substr instead of LIKE so '%' and '_' in feature names stay literal
            let removed = conn.execute(
                "DELETE FROM feature_cache WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(removed as u64)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), CacheError> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
