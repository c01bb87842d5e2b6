//! Public entry point: start, inspect and delete cached manifests by URL.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument, warn};

use crate::checker::{ConsistencyChecker, ConsistencyReport};
use crate::config::CacheConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::handle::{DownloadHandle, DownloadStatus, ProgressStream};
use crate::hls::HlsManifestSource;
use crate::manifest::ManifestSource;
use crate::store::{BlobStore, SqliteBlobStore};

/// Collaborators shared by the facade and every coordinator it spawns.
pub(crate) struct EngineContext {
    pub store: Arc<dyn BlobStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub source: Arc<dyn ManifestSource>,
    /// At most one running coordinator per root manifest URL.
    pub in_flight: DashMap<String, DownloadHandle>,
    pub concurrency: usize,
    pub checkpoint_interval: u64,
}

/// Offline cache of streaming manifests and everything they reference.
///
/// Must be used from within a Tokio runtime; downloads run as spawned tasks.
#[derive(Clone)]
pub struct OfflineCache {
    ctx: Arc<EngineContext>,
    check_lock: Arc<tokio::sync::Mutex<()>>,
}

impl OfflineCache {
    /// Wire the SQLite store, HTTP fetcher and HLS parser from `config`.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteBlobStore::connect(&config.database_url, config.max_connections).await?;
        let fetcher: Arc<dyn Fetcher> =
            Arc::new(HttpFetcher::from_config(&config.http, config.retry.clone())?);
        let source = Arc::new(HlsManifestSource::new(Arc::clone(&fetcher)));
        Ok(Self::new(&config, Arc::new(store), fetcher, source))
    }

    pub fn new(
        config: &CacheConfig,
        store: Arc<dyn BlobStore>,
        fetcher: Arc<dyn Fetcher>,
        source: Arc<dyn ManifestSource>,
    ) -> Self {
        Self {
            ctx: Arc::new(EngineContext {
                store,
                fetcher,
                source,
                in_flight: DashMap::new(),
                concurrency: config.concurrency,
                checkpoint_interval: config.checkpoint_interval,
            }),
            check_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.ctx.store
    }

    /// Start caching `url`, or return the handle of the download already running for it.
    ///
    /// While `url` is being deleted the deleted download's handle is returned;
    /// it ends as `Cancelled` and no new download starts.
    pub fn start(&self, url: &str) -> DownloadHandle {
        match self.ctx.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                if handle.is_deleting() {
                    warn!(url = %url, "Download requested while it is being deleted");
                } else {
                    debug!(url = %url, "Download already running");
                }
                handle
            }
            Entry::Vacant(entry) => {
                let (coordinator, handle) = Coordinator::new(Arc::clone(&self.ctx), url.to_string());
                entry.insert(handle.clone());
                coordinator.spawn();
                handle
            }
        }
    }

    /// Handle of the running download for `url`, if any.
    pub fn handle(&self, url: &str) -> Option<DownloadHandle> {
        self.ctx.in_flight.get(url).map(|entry| entry.value().clone())
    }

    /// URLs with a running coordinator.
    pub fn active(&self) -> Vec<String> {
        self.ctx
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub async fn status(&self, url: &str) -> Result<DownloadStatus> {
        if let Some(handle) = self.handle(url).filter(|handle| !handle.is_deleting()) {
            let progress = handle.progress();
            return Ok(DownloadStatus::Downloading {
                completed: progress.completed,
                total: progress.total,
            });
        }

        let status = match self.ctx.store.get(url).await? {
            Some(record) if record.is_root() => match record.progress {
                Some(progress) if progress.is_complete() => DownloadStatus::Complete,
                _ => DownloadStatus::IncompleteResumable,
            },
            _ => DownloadStatus::Absent,
        };
        Ok(status)
    }

    /// Progress snapshots of the running download for `url`.
    ///
    /// `None` when nothing is running. The stream ends when the download
    /// finishes or is deleted.
    pub fn progress_stream(&self, url: &str) -> Option<ProgressStream> {
        self.handle(url).map(|handle| handle.progress_stream())
    }

    /// Cached bytes stored under `url`, for playback.
    pub async fn read(&self, url: &str) -> Result<Option<Bytes>> {
        Ok(self.ctx.store.get(url).await?.map(|record| record.payload))
    }

    /// Remove `url` and every record it owns.
    ///
    /// A running download is cancelled first and its workers drained, so no
    /// record is written after the cascade. The URL keeps its in-flight slot
    /// until the cascade is done, so no other download can start for it in
    /// between. Returns the number of records removed.
    #[instrument(skip(self))]
    pub async fn delete(&self, url: &str) -> Result<u64> {
        // The coordinator's own cleanup checks the flag under the same shard
        // lock, so it either removed the entry already or leaves it to us.
        let slot = match self.ctx.in_flight.entry(url.to_string()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                handle.mark_deleting();
                handle
            }
            Entry::Vacant(entry) => entry.insert(DownloadHandle::tombstone(url.to_string())).clone(),
        };

        slot.cancel();
        let last = slot.wait().await;
        debug!(phase = ?last.phase, completed = last.completed, "Running download stopped");

        let result = self.cascade(url).await;
        self.ctx
            .in_flight
            .remove_if(url, |_, handle| handle.same_download(&slot));
        let deleted = result?;
        info!(deleted, "Deleted cached manifest");
        Ok(deleted)
    }

    async fn cascade(&self, url: &str) -> Result<u64> {
        let keys: Vec<String> = self.ctx.store.keys_by_owner(url).await?.into_iter().collect();
        self.ctx.store.delete_many(&keys).await
    }

    /// Garbage-collect orphans and resume incomplete downloads.
    ///
    /// Concurrent calls are serialized.
    pub async fn run_consistency_check(&self) -> ConsistencyReport {
        let _guard = self.check_lock.lock().await;
        ConsistencyChecker::new(self).run().await
    }
}
