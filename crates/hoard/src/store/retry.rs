//! Write retries for SQLite lock contention.
//!
//! `busy_timeout` already makes a connection wait for the lock; this covers
//! what it cannot, such as a WAL snapshot that went stale mid-transaction.
//! Backoff comes from the same [`RetryPolicy`] the fetcher uses.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// SQLITE_BUSY and SQLITE_LOCKED; extended codes share the low byte.
const BUSY: i32 = 5;
const LOCKED: i32 = 6;

fn lock_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 8,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_secs(1),
        jitter: true,
    }
}

/// Whether `err` means another connection held the database lock.
pub(crate) fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, BUSY | LOCKED)),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Run a write, repeating it while the database is locked.
///
/// Any failure comes back as [`CacheError::StorageWrite`] tagged with `operation`.
pub(crate) async fn write_with_retry<T, F, Fut>(operation: &'static str, write: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    // Writes are never abandoned halfway; cancellation is the caller's concern.
    let never = CancellationToken::new();
    retry_with_backoff(&lock_policy(), &never, |_| {
        let attempt = write();
        async move {
            match attempt.await {
                Ok(value) => RetryAction::Success(value),
                Err(e) if is_lock_contention(&e) => {
                    RetryAction::Retry(CacheError::storage_write(operation, e))
                }
                Err(e) => RetryAction::Fail(CacheError::storage_write(operation, e)),
            }
        }
    })
    .await
}
