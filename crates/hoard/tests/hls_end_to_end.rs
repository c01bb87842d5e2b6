//! Full pipeline against a loopback HLS origin: HTTP fetcher, m3u8 parsing
//! and a file-backed SQLite store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use bytes::Bytes;
use hoard_engine::{BlobStore, CacheConfig, DownloadStatus, OfflineCache, Phase};
use parking_lot::Mutex;

const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,URI=\"audio/en.m3u8\"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"English\",LANGUAGE=\"en\",URI=\"subs/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=1200000,AUDIO=\"aac\",SUBTITLES=\"subs\"
video/index.m3u8
";

const VIDEO: &str = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:6.0,
seg0.m4s
#EXTINF:6.0,
seg1.m4s
#EXT-X-ENDLIST
";

const AUDIO: &str = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
a0.aac
#EXTINF:6.0,
a1.aac
#EXT-X-ENDLIST
";

const SUBS: &str = "#EXTM3U
#EXT-X-TARGETDURATION:12
#EXTINF:12.0,
s0.vtt
#EXTINF:12.0,
gone.vtt
#EXT-X-ENDLIST
";

#[derive(Default)]
struct Origin {
    hits: Mutex<HashMap<String, u32>>,
}

async fn serve_file(State(origin): State<Arc<Origin>>, uri: Uri) -> (StatusCode, Bytes) {
    let path = uri.path().to_string();
    *origin.hits.lock().entry(path.clone()).or_default() += 1;

    let playlist = match path.as_str() {
        "/vod/master.m3u8" => Some(MASTER),
        "/vod/video/index.m3u8" => Some(VIDEO),
        "/vod/audio/en.m3u8" => Some(AUDIO),
        "/vod/subs/en.m3u8" => Some(SUBS),
        _ => None,
    };
    match playlist {
        Some(body) => (StatusCode::OK, Bytes::from_static(body.as_bytes())),
        None if path.ends_with("gone.vtt") => (StatusCode::NOT_FOUND, Bytes::new()),
        None => (StatusCode::OK, Bytes::from(format!("data:{path}"))),
    }
}

async fn origin() -> (String, Arc<Origin>) {
    let origin = Arc::new(Origin::default());
    let app = Router::new()
        .fallback(serve_file)
        .with_state(Arc::clone(&origin));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), origin)
}

fn config(database_url: &str) -> CacheConfig {
    CacheConfig::builder()
        .database_url(database_url)
        .max_retries(1)
        .build()
        .unwrap()
}

#[tokio::test]
async fn hls_presentation_is_cached_and_survives_reopen() {
    let (base, origin) = origin().await;
    let master = format!("{base}/vod/master.m3u8");
    let dir = tempfile::tempdir().unwrap();
    let database = format!("sqlite:{}?mode=rwc", dir.path().join("hoard.db").display());

    {
        let cache = OfflineCache::open(config(&database)).await.unwrap();
        let last = cache.start(&master).wait().await;

        // 3 playlists + 3 video + 2 audio + 2 subtitle fragments
        assert_eq!(last.phase, Phase::Finished);
        assert_eq!(last.total, 10);
        assert_eq!(last.completed, 10);
        assert_eq!(last.failed, 1);
    }

    let hits = origin.hits.lock().clone();
    assert_eq!(hits.get("/vod/video/seg1.m4s"), Some(&1));
    assert_eq!(hits.get("/vod/video/init.mp4"), Some(&1));
    // a missing fragment gets the same retry budget as any other failure
    assert_eq!(hits.get("/vod/subs/gone.vtt"), Some(&2));

    let cache = OfflineCache::open(config(&database)).await.unwrap();
    assert!(cache.run_consistency_check().await.is_clean());
    assert_eq!(cache.status(&master).await.unwrap(), DownloadStatus::Complete);
    assert_eq!(
        cache.read(&format!("{base}/vod/audio/a1.aac")).await.unwrap(),
        Some(Bytes::from("data:/vod/audio/a1.aac"))
    );
    assert_eq!(
        cache.read(&master).await.unwrap(),
        Some(Bytes::from_static(MASTER.as_bytes()))
    );
    assert_eq!(cache.read(&format!("{base}/vod/subs/gone.vtt")).await.unwrap(), None);

    assert_eq!(cache.delete(&master).await.unwrap(), 10);
    assert_eq!(cache.status(&master).await.unwrap(), DownloadStatus::Absent);
}

#[tokio::test]
async fn unreachable_root_stalls_without_writing() {
    let (base, _origin) = origin().await;
    let cache = OfflineCache::open(config("sqlite::memory:")).await.unwrap();
    let missing = format!("{base}/vod/nothing.m3u8");

    let handle = cache.start(&missing);
    let mut rx = handle.progress_stream();
    while let Some(progress) = futures::StreamExt::next(&mut rx).await {
        if progress.phase == Phase::Stalled {
            break;
        }
    }

    assert!(cache.store().owners().await.unwrap().is_empty());
    assert_eq!(cache.delete(&missing).await.unwrap(), 0);
    assert_eq!(handle.wait().await.phase, Phase::Cancelled);
}
