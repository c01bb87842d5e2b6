//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hoard_engine::{
    BlobStore, CacheConfig, CacheError, Fetcher, Fragment, ManifestSource, OfflineCache, Progress,
    Record, RecordKind, Result, RootManifest, SideTrack, SqliteBlobStore, SubManifest,
};
use parking_lot::Mutex;

pub const ROOT: &str = "https://cdn.test/vod/master.m3u8";

/// Fetcher that serves canned bodies (or a body derived from the URL) and
/// records how it was called.
#[derive(Default)]
pub struct CountingFetcher {
    bodies: HashMap<String, Bytes>,
    failing: HashSet<String>,
    delay: Duration,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_body(mut self, url: &str, body: &str) -> Self {
        self.bodies
            .insert(url.to_string(), Bytes::copy_from_slice(body.as_bytes()));
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        *self.calls.lock().entry(url.to_string()).or_default() += 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(url) {
            return Err(CacheError::FetchExhausted {
                url: url.to_string(),
                attempts: 6,
                reason: "HTTP 503".to_string(),
            });
        }
        Ok(self
            .bodies
            .get(url)
            .cloned()
            .unwrap_or_else(|| Bytes::from(format!("payload:{url}"))))
    }
}

/// Manifest source returning a fixed presentation.
pub struct ScriptedSource {
    root: RootManifest,
    primary: Vec<SubManifest>,
    side: Vec<SubManifest>,
    fail_primary: bool,
    side_delay: Duration,
    side_loading: AtomicUsize,
    max_side_loading: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(primary: Vec<SubManifest>, side: Vec<SubManifest>) -> Self {
        let side_tracks = side
            .iter()
            .enumerate()
            .map(|(i, m)| SideTrack {
                name: format!("track {i}"),
                language: None,
                url: m.url.clone(),
            })
            .collect();
        Self {
            root: RootManifest {
                url: ROOT.to_string(),
                raw: Bytes::from_static(b"#EXTM3U\n"),
                primary: primary.iter().map(|m| m.url.clone()).collect(),
                side_tracks,
            },
            primary,
            side,
            fail_primary: false,
            side_delay: Duration::ZERO,
            side_loading: AtomicUsize::new(0),
            max_side_loading: AtomicUsize::new(0),
        }
    }

    pub fn failing_primary(mut self) -> Self {
        self.fail_primary = true;
        self
    }

    pub fn with_side_delay(mut self, delay: Duration) -> Self {
        self.side_delay = delay;
        self
    }

    pub fn max_concurrent_side_loads(&self) -> usize {
        self.max_side_loading.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for ScriptedSource {
    async fn load_root(&self, url: &str) -> Result<RootManifest> {
        assert_eq!(url, ROOT);
        Ok(self.root.clone())
    }

    async fn load_primary(&self, _root: &RootManifest) -> Result<Vec<SubManifest>> {
        if self.fail_primary {
            return Err(CacheError::ManifestDiscovery {
                url: ROOT.to_string(),
                reason: "variant playlist unavailable".to_string(),
            });
        }
        Ok(self.primary.clone())
    }

    async fn load_side_track(&self, _root: &RootManifest, index: usize) -> Result<SubManifest> {
        let now = self.side_loading.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_side_loading.fetch_max(now, Ordering::SeqCst);
        if !self.side_delay.is_zero() {
            tokio::time::sleep(self.side_delay).await;
        }
        self.side_loading.fetch_sub(1, Ordering::SeqCst);
        Ok(self.side[index].clone())
    }
}

/// Store wrapper that records root checkpoints and can refuse root writes.
pub struct RecordingStore {
    pub inner: SqliteBlobStore,
    root_writes: Mutex<Vec<Progress>>,
    refuse_root_writes: bool,
}

impl RecordingStore {
    pub async fn new() -> Self {
        Self {
            inner: SqliteBlobStore::in_memory().await.unwrap(),
            root_writes: Mutex::new(Vec::new()),
            refuse_root_writes: false,
        }
    }

    pub fn refusing_root_writes(mut self) -> Self {
        self.refuse_root_writes = true;
        self
    }

    pub fn root_writes(&self) -> Vec<Progress> {
        self.root_writes.lock().clone()
    }
}

#[async_trait]
impl BlobStore for RecordingStore {
    async fn put(&self, record: &Record) -> Result<()> {
        if let Some(progress) = record.progress {
            if self.refuse_root_writes {
                return Err(CacheError::StorageWrite {
                    operation: "put",
                    reason: "disk full".to_string(),
                });
            }
            self.root_writes.lock().push(progress);
        }
        self.inner.put(record).await
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.inner.get(key).await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        self.inner.contains(key).await
    }

    async fn keys_by_owner(&self, owner: &str) -> Result<BTreeSet<String>> {
        self.inner.keys_by_owner(owner).await
    }

    async fn keys_by_kind(&self, kind: RecordKind) -> Result<BTreeSet<String>> {
        self.inner.keys_by_kind(kind).await
    }

    async fn owners(&self) -> Result<BTreeSet<String>> {
        self.inner.owners().await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete_many(keys).await
    }
}

/// A media playlist at `url` listing `count` fragments, 4 seconds each.
pub fn playlist(url: &str, count: usize) -> SubManifest {
    let base = url.trim_end_matches(".m3u8");
    SubManifest {
        url: url.to_string(),
        raw: Bytes::from(format!("#EXTM3U\n# {count} fragments\n")),
        fragments: (0..count)
            .map(|i| Fragment::new(format!("{base}/frag{i}.ts"), i as f64 * 4.0))
            .collect(),
    }
}

/// Two primary playlists (10 and 8 fragments) and one side track (3 fragments).
pub fn scenario_source() -> ScriptedSource {
    ScriptedSource::new(
        vec![
            playlist("https://cdn.test/vod/video.m3u8", 10),
            playlist("https://cdn.test/vod/audio.m3u8", 8),
        ],
        vec![playlist("https://cdn.test/vod/subs.m3u8", 3)],
    )
}

pub fn fragment_urls(source_manifests: &[SubManifest]) -> Vec<String> {
    source_manifests
        .iter()
        .flat_map(|m| m.fragments.iter().map(|f| f.url.clone()))
        .collect()
}

pub fn config() -> CacheConfig {
    CacheConfig::builder()
        .database_url("sqlite::memory:")
        .build()
        .unwrap()
}

pub fn cache_with(
    store: Arc<dyn BlobStore>,
    fetcher: Arc<CountingFetcher>,
    source: Arc<dyn ManifestSource>,
) -> OfflineCache {
    OfflineCache::new(&config(), store, fetcher, source)
}

pub async fn memory_store() -> Arc<SqliteBlobStore> {
    Arc::new(SqliteBlobStore::in_memory().await.unwrap())
}
