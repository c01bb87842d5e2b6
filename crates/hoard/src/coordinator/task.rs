use std::future::Future;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, Result};
use crate::fetcher::Fetcher;
use crate::store::{BlobStore, Record, RecordKind};

/// Where a task's bytes come from.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    /// Fetched over the network when the task runs.
    Remote,
    /// Already in hand, e.g. a playlist the parser just downloaded.
    Inline(Bytes),
}

/// One resource to bring into the store.
#[derive(Debug, Clone)]
pub(crate) struct ResourceTask {
    pub key: String,
    pub kind: RecordKind,
    pub playback_offset: f64,
    pub payload: Payload,
}

impl ResourceTask {
    pub fn remote(key: impl Into<String>, kind: RecordKind, playback_offset: f64) -> Self {
        Self {
            key: key.into(),
            kind,
            playback_offset,
            payload: Payload::Remote,
        }
    }

    pub fn inline(key: impl Into<String>, kind: RecordKind, bytes: Bytes) -> Self {
        Self {
            key: key.into(),
            kind,
            playback_offset: 0.0,
            payload: Payload::Inline(bytes),
        }
    }

    pub async fn run(
        &self,
        store: &dyn BlobStore,
        fetcher: &dyn Fetcher,
        owner: &str,
        token: &CancellationToken,
    ) -> TaskOutcome {
        let fetch = || async {
            let bytes = match &self.payload {
                Payload::Inline(bytes) => bytes.clone(),
                Payload::Remote => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(CacheError::Cancelled),
                        result = fetcher.fetch(&self.key) => result?,
                    }
                }
            };
            if token.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            Ok(bytes)
        };

        match ensure_stored(store, &self.key, self.kind, owner, fetch).await {
            Ok(true) => TaskOutcome::Stored,
            Ok(false) => TaskOutcome::AlreadyPresent,
            Err(CacheError::Cancelled) => TaskOutcome::Cancelled,
            Err(err) => TaskOutcome::Failed(err),
        }
    }
}

#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Stored,
    AlreadyPresent,
    Failed(CacheError),
    Cancelled,
}

/// Store `key` unless it is already present.
///
/// Returns `true` when `fetch` ran and its bytes were written.
pub(crate) async fn ensure_stored<F, Fut>(
    store: &dyn BlobStore,
    key: &str,
    kind: RecordKind,
    owner: &str,
    fetch: F,
) -> Result<bool>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Bytes>>,
{
    if store.contains(key).await? {
        return Ok(false);
    }
    let payload = fetch().await?;
    store.put(&Record::new(key, kind, owner, payload)).await?;
    Ok(true)
}
