//! SQLite-backed [`BlobStore`].
//!
//! Connections run in WAL mode and the schema is managed by embedded
//! migrations. Writes that lose the lock race are retried.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::retry::write_with_retry;
use super::{BlobStore, Progress, Record, RecordKind};
use crate::error::{CacheError, Result};

/// How long a connection waits for the write lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Payloads are whole media fragments, so cap how far the WAL may grow
/// between checkpoints.
const JOURNAL_SIZE_LIMIT_BYTES: i64 = 64 * 1024 * 1024;

/// Open a pool in WAL mode.
pub async fn init_pool(
    database_url: &str,
    max_connections: u32,
) -> std::result::Result<SqlitePool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .pragma("journal_size_limit", JOURNAL_SIZE_LIMIT_BYTES.to_string())
        .create_if_missing(true);

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30));

    // Every connection to ":memory:" is its own database, so keep exactly one alive.
    if database_url.contains(":memory:") || database_url.contains("mode=memory") {
        pool_options = pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = pool_options.connect_with(connect_options).await?;

    // In-memory databases report "memory" and cannot switch to WAL.
    let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if journal_mode != "wal" && journal_mode != "memory" {
        warn!(mode = %journal_mode, "Blob store is not in WAL mode");
    }

    info!(
        max_connections = pool.options().get_max_connections(),
        journal_mode = %journal_mode,
        "Blob store pool initialized"
    );

    Ok(pool)
}

/// Durable blob store over a single `records` table.
#[derive(Debug, Clone)]
pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    /// Connect to `database_url` and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = init_pool(database_url, max_connections)
            .await
            .map_err(|e| CacheError::storage_read("connect", e))?;
        Self::from_pool(pool).await
    }

    /// Private database that lives as long as the store.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Wrap an existing pool, running pending migrations on it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Blob store migrations applied");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Record> {
    let key: String = row
        .try_get("key")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let kind_label: String = row
        .try_get("kind")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let kind = RecordKind::parse(&kind_label)
        .ok_or_else(|| CacheError::invalid_record(&key, format!("unknown kind `{kind_label}`")))?;
    let owner: String = row
        .try_get("owner")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let payload: Vec<u8> = row
        .try_get("payload")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let completed: Option<i64> = row
        .try_get("completed")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let expected: Option<i64> = row
        .try_get("expected")
        .map_err(|e| CacheError::storage_read("decode record", e))?;
    let settled: Option<bool> = row
        .try_get("settled")
        .map_err(|e| CacheError::storage_read("decode record", e))?;

    let progress = match (completed, expected) {
        (Some(completed), Some(expected)) => Some(Progress::new(
            u64::try_from(completed)
                .map_err(|_| CacheError::invalid_record(&key, "negative completed count"))?,
            u64::try_from(expected)
                .map_err(|_| CacheError::invalid_record(&key, "negative expected count"))?,
            settled.unwrap_or(false),
        )),
        _ => None,
    };

    Ok(Record {
        key,
        kind,
        owner,
        payload: Bytes::from(payload),
        progress,
    })
}

fn to_db_count(key: &str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| CacheError::invalid_record(key, "progress count overflow"))
}

fn collect_keys(rows: Vec<sqlx::sqlite::SqliteRow>, column: &str) -> Result<BTreeSet<String>> {
    rows.iter()
        .map(|row| {
            row.try_get::<String, _>(column)
                .map_err(|e| CacheError::storage_read("decode key", e))
        })
        .collect()
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, record: &Record) -> Result<()> {
        let (completed, expected, settled) = match record.progress {
            Some(p) => {
                if p.completed > p.expected {
                    return Err(CacheError::invalid_record(
                        &record.key,
                        format!("completed {} exceeds expected {}", p.completed, p.expected),
                    ));
                }
                (
                    Some(to_db_count(&record.key, p.completed)?),
                    Some(to_db_count(&record.key, p.expected)?),
                    Some(p.settled),
                )
            }
            None => (None, None, None),
        };

        write_with_retry("put", || async {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO records (key, kind, owner, payload, completed, expected, settled, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    kind = excluded.kind,
                    owner = excluded.owner,
                    payload = excluded.payload,
                    completed = excluded.completed,
                    expected = excluded.expected,
                    settled = excluded.settled,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.key)
            .bind(record.kind.as_str())
            .bind(&record.owner)
            .bind(record.payload.as_ref())
            .bind(completed)
            .bind(expected)
            .bind(settled)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        let row = sqlx::query(
            "SELECT key, kind, owner, payload, completed, expected, settled FROM records WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CacheError::storage_read("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CacheError::storage_read("contains", e))?;
        Ok(row.is_some())
    }

    async fn keys_by_owner(&self, owner: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT key FROM records WHERE owner = ?")
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CacheError::storage_read("keys_by_owner", e))?;
        collect_keys(rows, "key")
    }

    async fn keys_by_kind(&self, kind: RecordKind) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT key FROM records WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CacheError::storage_read("keys_by_kind", e))?;
        collect_keys(rows, "key")
    }

    async fn owners(&self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT DISTINCT owner FROM records")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| CacheError::storage_read("owners", e))?;
        collect_keys(rows, "owner")
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        // Dropping the transaction without commit rolls every delete back.
        let deleted = write_with_retry("delete_many", || async {
            let mut tx = self.pool.begin().await?;
            let mut deleted = 0u64;
            for key in keys {
                deleted += sqlx::query("DELETE FROM records WHERE key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok(deleted)
        })
        .await?;

        debug!(requested = keys.len(), deleted, "Deleted records");
        Ok(deleted)
    }
}
