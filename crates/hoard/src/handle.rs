use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a single download run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The root is being resolved or child playlists are still arriving.
    #[default]
    Discovering,
    /// Every discovery channel has reported; only fetches remain.
    Downloading,
    /// A manifest could not be loaded. Fetches already queued still run,
    /// but the download cannot complete until it is deleted and restarted.
    Stalled,
    /// Every discovered resource has been processed.
    Finished,
    /// Stopped because the download was deleted.
    Cancelled,
    /// Stopped because the root record could not be persisted.
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled | Self::Aborted)
    }
}

/// Snapshot published on every change of a download's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    /// Resources processed, failures included.
    pub completed: u64,
    /// Resources discovered so far.
    pub total: u64,
    /// Resources that could not be fetched or stored.
    pub failed: u64,
    pub phase: Phase,
}

/// What the engine knows about a manifest URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Nothing is stored for this URL.
    Absent,
    /// A coordinator is running for this URL.
    Downloading { completed: u64, total: u64 },
    /// Every resource was processed.
    Complete,
    /// A previous run stopped early; starting again resumes it.
    IncompleteResumable,
}

/// Lazily yields progress snapshots; ends when the download stops.
pub type ProgressStream = WatchStream<DownloadProgress>;

/// Shared reference to a running download.
///
/// Cloning is cheap; every clone observes the same coordinator.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: Uuid,
    url: String,
    started_at: DateTime<Utc>,
    cancellation_token: CancellationToken,
    progress: watch::Receiver<DownloadProgress>,
    /// Set once a delete owns this entry of the in-flight map.
    deleting: AtomicBool,
}

impl DownloadHandle {
    pub(crate) fn new(
        url: String,
        cancellation_token: CancellationToken,
        progress: watch::Receiver<DownloadProgress>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                url,
                started_at: Utc::now(),
                cancellation_token,
                progress,
                deleting: AtomicBool::new(false),
            }),
        }
    }

    /// Placeholder that holds a URL's slot while a delete cascades over it.
    ///
    /// It has no coordinator behind it and reads as `Cancelled` from the start.
    pub(crate) fn tombstone(url: String) -> Self {
        let (_tx, rx) = watch::channel(DownloadProgress {
            phase: Phase::Cancelled,
            ..DownloadProgress::default()
        });
        let handle = Self::new(url, CancellationToken::new(), rx);
        handle.mark_deleting();
        handle
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Root manifest URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Latest published snapshot.
    pub fn progress(&self) -> DownloadProgress {
        *self.inner.progress.borrow()
    }

    pub fn progress_stream(&self) -> ProgressStream {
        WatchStream::new(self.inner.progress.clone())
    }

    /// Whether both handles refer to the same coordinator.
    pub fn same_download(&self, other: &DownloadHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve once the coordinator has stopped, returning its last snapshot.
    pub async fn wait(&self) -> DownloadProgress {
        let mut rx = self.inner.progress.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current.phase.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancellation_token.cancel();
    }

    pub(crate) fn mark_deleting(&self) {
        self.inner.deleting.store(true, Ordering::Release);
    }

    /// Whether a delete is removing this download's records.
    pub fn is_deleting(&self) -> bool {
        self.inner.deleting.load(Ordering::Acquire)
    }
}
