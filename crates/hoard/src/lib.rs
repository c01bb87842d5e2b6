//! # hoard-engine
//!
//! Offline cache for streaming media manifests. Given the URL of a root
//! playlist, the engine discovers every sub-playlist and fragment it
//! references, fetches each one once under a bounded worker budget, and
//! stores it as a keyed blob. Progress is checkpointed on the root record so
//! that an interrupted download resumes without re-fetching what is already
//! stored.
//!
//! ```no_run
//! # async fn demo() -> hoard_engine::Result<()> {
//! use hoard_engine::{CacheConfig, OfflineCache};
//!
//! let cache = OfflineCache::open(CacheConfig::default()).await?;
//! cache.run_consistency_check().await;
//!
//! let handle = cache.start("https://example.com/vod/master.m3u8");
//! let last = handle.wait().await;
//! println!("{}/{} resources", last.completed, last.total);
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod config;
mod coordinator;
pub mod error;
pub mod facade;
pub mod fetcher;
pub mod handle;
pub mod hls;
pub mod manifest;
pub mod retry;
pub mod store;

pub use checker::ConsistencyReport;
pub use config::{CacheConfig, CacheConfigBuilder, HttpConfig};
pub use error::{CacheError, Result};
pub use facade::OfflineCache;
pub use fetcher::{Fetcher, HttpFetcher};
pub use handle::{DownloadHandle, DownloadProgress, DownloadStatus, Phase, ProgressStream};
pub use hls::{HlsManifestSource, VariantSelection};
pub use manifest::{
    DiscoveryEvent, Fragment, ManifestSource, RootManifest, SideTrack, SubManifest, TrackRef,
};
pub use retry::RetryPolicy;
pub use store::{BlobStore, Progress, Record, RecordKind, SqliteBlobStore};
