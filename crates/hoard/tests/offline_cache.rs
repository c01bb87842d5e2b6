mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use hoard_engine::{
    BlobStore, DownloadStatus, Phase, Progress, Record, RecordKind, SqliteBlobStore,
};

use common::*;

async fn scenario() -> (OfflineCacheParts, hoard_engine::OfflineCache) {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new());
    let source = Arc::new(scenario_source());
    let cache = cache_with(store.clone(), fetcher.clone(), source);
    (OfflineCacheParts { store, fetcher }, cache)
}

struct OfflineCacheParts {
    store: Arc<SqliteBlobStore>,
    fetcher: Arc<CountingFetcher>,
}

fn scenario_fragments() -> Vec<String> {
    let mut urls = fragment_urls(&[
        playlist("https://cdn.test/vod/video.m3u8", 10),
        playlist("https://cdn.test/vod/audio.m3u8", 8),
        playlist("https://cdn.test/vod/subs.m3u8", 3),
    ]);
    urls.sort();
    urls
}

#[tokio::test]
async fn scenario_download_completes_with_every_resource_stored() {
    let (parts, cache) = scenario().await;

    let last = cache.start(ROOT).wait().await;

    assert_eq!(last.phase, Phase::Finished);
    assert_eq!(last.total, 24);
    assert_eq!(last.completed, 24);
    assert_eq!(last.failed, 0);
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
    assert!(cache.active().is_empty());

    let owned = parts.store.keys_by_owner(ROOT).await.unwrap();
    assert_eq!(owned.len(), 25);
    assert!(owned.contains("https://cdn.test/vod/subs.m3u8"));

    let root = parts.store.get(ROOT).await.unwrap().unwrap();
    assert_eq!(root.progress, Some(Progress::new(24, 24, true)));

    let subs = parts.store.get("https://cdn.test/vod/subs.m3u8").await.unwrap().unwrap();
    assert_eq!(subs.kind, RecordKind::SideTrack);
    let video = parts.store.get("https://cdn.test/vod/video.m3u8").await.unwrap().unwrap();
    assert_eq!(video.kind, RecordKind::SubManifest);

    // sub-manifests arrive with discovery; only fragments hit the network
    for url in scenario_fragments() {
        assert_eq!(parts.fetcher.calls(&url), 1, "{url}");
    }
    assert_eq!(parts.fetcher.total_calls(), 21);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_is_published_after_checkpoint_and_release() {
    for _ in 0..20 {
        let (parts, cache) = scenario().await;

        let last = cache.start(ROOT).wait().await;

        assert_eq!(last.phase, Phase::Finished);
        assert!(cache.handle(ROOT).is_none());
        assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
        let root = parts.store.get(ROOT).await.unwrap().unwrap();
        assert_eq!(root.progress, Some(Progress::new(24, 24, true)));
    }
}

#[tokio::test]
async fn cached_bytes_are_readable_by_url() {
    let (_parts, cache) = scenario().await;
    cache.start(ROOT).wait().await;

    let frag = "https://cdn.test/vod/video/frag3.ts";
    assert_eq!(
        cache.read(frag).await.unwrap(),
        Some(Bytes::from(format!("payload:{frag}")))
    );
    assert_eq!(
        cache.read(ROOT).await.unwrap(),
        Some(Bytes::from_static(b"#EXTM3U\n"))
    );
    assert_eq!(cache.read("https://cdn.test/unknown.ts").await.unwrap(), None);
}

#[tokio::test]
async fn starting_twice_shares_one_download() {
    let (parts, cache) = scenario().await;

    let first = cache.start(ROOT);
    let second = cache.start(ROOT);
    assert!(first.same_download(&second));
    assert_eq!(cache.active(), vec![ROOT.to_string()]);

    second.wait().await;
    for url in scenario_fragments() {
        assert_eq!(parts.fetcher.calls(&url), 1, "{url}");
    }

    // a later run finds everything already stored
    let third = cache.start(ROOT);
    assert!(!third.same_download(&first));
    let last = third.wait().await;
    assert_eq!(last.completed, 24);
    assert_eq!(parts.fetcher.total_calls(), 21);
}

#[tokio::test]
async fn fetches_never_exceed_the_worker_budget() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new().with_delay(Duration::from_millis(20)));
    let source = Arc::new(ScriptedSource::new(
        vec![playlist("https://cdn.test/vod/video.m3u8", 23)],
        Vec::new(),
    ));
    let cache = cache_with(store, fetcher.clone(), source);

    let last = cache.start(ROOT).wait().await;

    assert_eq!(last.total, 24);
    assert_eq!(last.completed, 24);
    assert!(fetcher.max_in_flight() <= 5, "saw {}", fetcher.max_in_flight());
    assert!(fetcher.max_in_flight() > 1);
}

#[tokio::test]
async fn progress_snapshots_never_go_backwards() {
    let (_parts, cache) = scenario().await;
    let handle = cache.start(ROOT);

    let snapshots: Vec<_> = handle.progress_stream().collect().await;

    assert!(!snapshots.is_empty());
    for pair in snapshots.windows(2) {
        assert!(pair[0].completed <= pair[1].completed, "{pair:?}");
        assert!(pair[1].completed <= pair[1].total, "{pair:?}");
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.phase, Phase::Finished);
    assert_eq!((last.completed, last.total), (24, 24));
    assert!(cache.progress_stream(ROOT).is_none());
}

#[tokio::test]
async fn root_progress_is_checkpointed_every_ten_completions() {
    let store = Arc::new(RecordingStore::new().await);
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = cache_with(store.clone(), fetcher, Arc::new(scenario_source()));

    cache.start(ROOT).wait().await;

    let writes = store.root_writes();
    let completed: Vec<u64> = writes.iter().map(|p| p.completed).collect();
    assert_eq!(completed, vec![0, 10, 20, 24]);
    assert_eq!(writes[0], Progress::default());
    assert!(writes.last().unwrap().is_complete());
}

#[tokio::test]
async fn side_tracks_are_discovered_one_at_a_time() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new());
    let source = Arc::new(
        ScriptedSource::new(
            vec![playlist("https://cdn.test/vod/video.m3u8", 2)],
            vec![
                playlist("https://cdn.test/vod/subs-en.m3u8", 2),
                playlist("https://cdn.test/vod/subs-fr.m3u8", 2),
                playlist("https://cdn.test/vod/subs-de.m3u8", 2),
            ],
        )
        .with_side_delay(Duration::from_millis(10)),
    );
    let cache = cache_with(store, fetcher, source.clone());

    let last = cache.start(ROOT).wait().await;

    // each child playlist counts once, side tracks included; the root does not
    assert_eq!(last.total, 3 + 9);
    assert_eq!(last.phase, Phase::Finished);
    assert_eq!(source.max_concurrent_side_loads(), 1);
}

#[tokio::test]
async fn failed_fetches_still_count_as_completed() {
    let store = memory_store().await;
    let broken = "https://cdn.test/vod/video/frag4.ts";
    let fetcher = Arc::new(
        CountingFetcher::new()
            .failing(broken)
            .failing("https://cdn.test/vod/subs/frag1.ts"),
    );
    let cache = cache_with(store.clone(), fetcher, Arc::new(scenario_source()));

    let last = cache.start(ROOT).wait().await;

    assert_eq!(last.phase, Phase::Finished);
    assert_eq!(last.completed, 24);
    assert_eq!(last.failed, 2);
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
    assert!(!store.contains(broken).await.unwrap());
    assert_eq!(store.keys_by_owner(ROOT).await.unwrap().len(), 23);
}

#[tokio::test]
async fn empty_presentation_finishes_immediately() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new());
    // a bare media playlist with no fragments
    let source = Arc::new(ScriptedSource::new(vec![playlist(ROOT, 0)], Vec::new()));
    let cache = cache_with(store.clone(), fetcher.clone(), source);

    let last = cache.start(ROOT).wait().await;

    assert_eq!(last.phase, Phase::Finished);
    assert_eq!((last.completed, last.total), (0, 0));
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
    assert_eq!(fetcher.total_calls(), 0);

    let root = store.get(ROOT).await.unwrap().unwrap();
    assert_eq!(root.progress, Some(Progress::new(0, 0, true)));
}

#[tokio::test]
async fn discovery_failure_stalls_until_deleted() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new());
    let source = Arc::new(scenario_source().failing_primary());
    let cache = cache_with(store.clone(), fetcher, source);

    let handle = cache.start(ROOT);
    let mut stream = handle.progress_stream();
    while let Some(progress) = stream.next().await {
        if progress.phase == Phase::Stalled && progress.completed == progress.total {
            break;
        }
    }

    assert!(matches!(
        cache.status(ROOT).await.unwrap(),
        DownloadStatus::Downloading { .. }
    ));
    let root = store.get(ROOT).await.unwrap().unwrap();
    assert!(!root.progress.unwrap().is_complete());

    cache.delete(ROOT).await.unwrap();
    assert_eq!(handle.wait().await.phase, Phase::Cancelled);
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Absent);
    assert!(store.keys_by_owner(ROOT).await.unwrap().is_empty());
}

#[tokio::test]
async fn unwritable_root_aborts_the_download() {
    let store = Arc::new(RecordingStore::new().await.refusing_root_writes());
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = cache_with(store.clone(), fetcher.clone(), Arc::new(scenario_source()));

    let last = cache.start(ROOT).wait().await;

    assert_eq!(last.phase, Phase::Aborted);
    assert!(cache.handle(ROOT).is_none());
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Absent);
    assert_eq!(fetcher.total_calls(), 0);
    assert!(store.inner.owners().await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_removes_every_owned_record() {
    let (parts, cache) = scenario().await;
    cache.start(ROOT).wait().await;

    let removed = cache.delete(ROOT).await.unwrap();

    assert_eq!(removed, 25);
    assert!(parts.store.keys_by_owner(ROOT).await.unwrap().is_empty());
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Absent);
    assert_eq!(cache.delete(ROOT).await.unwrap(), 0);
}

#[tokio::test]
async fn delete_during_download_leaves_nothing_behind() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new().with_delay(Duration::from_millis(30)));
    let cache = cache_with(store.clone(), fetcher.clone(), Arc::new(scenario_source()));

    let handle = cache.start(ROOT);
    let mut stream = handle.progress_stream();
    while let Some(progress) = stream.next().await {
        if progress.completed >= 6 {
            break;
        }
    }

    cache.delete(ROOT).await.unwrap();

    let last = handle.wait().await;
    assert_eq!(last.phase, Phase::Cancelled);
    assert!(last.completed < 24);
    assert!(cache.handle(ROOT).is_none());

    // nothing lands after the cascade
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.owners().await.unwrap().is_empty());
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Absent);
}

#[tokio::test]
async fn start_during_delete_does_not_spawn_a_second_download() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new().with_delay(Duration::from_millis(30)));
    let cache = cache_with(store.clone(), fetcher.clone(), Arc::new(scenario_source()));

    let first = cache.start(ROOT);
    let mut stream = first.progress_stream();
    while let Some(progress) = stream.next().await {
        if progress.completed >= 3 {
            break;
        }
    }

    let mut delete = Box::pin(cache.delete(ROOT));
    assert!(futures::poll!(delete.as_mut()).is_pending());

    let second = cache.start(ROOT);
    assert!(second.same_download(&first));
    assert!(second.is_deleting());
    assert_eq!(
        cache.status(ROOT).await.unwrap(),
        DownloadStatus::IncompleteResumable
    );

    delete.await.unwrap();
    assert_eq!(second.wait().await.phase, Phase::Cancelled);
    assert!(cache.handle(ROOT).is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.owners().await.unwrap().is_empty());
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Absent);

    // the slot is free again once the cascade is done
    let again = cache.start(ROOT);
    assert!(!again.same_download(&first));
    assert_eq!(again.wait().await.phase, Phase::Finished);
    assert_eq!(store.keys_by_owner(ROOT).await.unwrap().len(), 25);
}

#[tokio::test]
async fn delete_is_all_or_nothing() {
    let (parts, cache) = scenario().await;
    cache.start(ROOT).wait().await;

    sqlx::query(
        "CREATE TRIGGER keep_frag BEFORE DELETE ON records \
         WHEN OLD.key = 'https://cdn.test/vod/audio/frag2.ts' \
         BEGIN SELECT RAISE(ABORT, 'pinned'); END",
    )
    .execute(parts.store.pool())
    .await
    .unwrap();

    assert!(cache.delete(ROOT).await.is_err());
    assert_eq!(parts.store.keys_by_owner(ROOT).await.unwrap().len(), 25);
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
}

#[tokio::test]
async fn consistency_check_collects_orphans() {
    let (parts, cache) = scenario().await;
    cache.start(ROOT).wait().await;

    let gone = "https://cdn.test/gone/master.m3u8";
    for n in 0..3 {
        let record = Record::new(
            format!("https://cdn.test/gone/frag{n}.ts"),
            RecordKind::Segment,
            gone,
            Bytes::from_static(b"stale"),
        );
        parts.store.put(&record).await.unwrap();
    }

    let report = cache.run_consistency_check().await;

    assert_eq!(report.orphaned_owners, vec![gone.to_string()]);
    assert_eq!(report.records_removed, 3);
    assert!(report.resumed.is_empty());
    assert!(report.errors.is_empty());
    assert!(parts.store.keys_by_owner(gone).await.unwrap().is_empty());
    assert_eq!(parts.store.keys_by_owner(ROOT).await.unwrap().len(), 25);

    assert!(cache.run_consistency_check().await.is_clean());
}

#[tokio::test]
async fn consistency_check_resumes_without_refetching() {
    let store = memory_store().await;
    let fetcher = Arc::new(CountingFetcher::new());
    let cache = cache_with(store.clone(), fetcher.clone(), Arc::new(scenario_source()));

    // state left by a run interrupted after five fragments
    store
        .put(&Record::root(
            ROOT,
            Bytes::from_static(b"#EXTM3U\n"),
            Progress::new(5, 24, true),
        ))
        .await
        .unwrap();
    let stored: Vec<String> = (0..5)
        .map(|n| format!("https://cdn.test/vod/video/frag{n}.ts"))
        .collect();
    for url in &stored {
        let record = Record::new(url, RecordKind::Segment, ROOT, Bytes::from_static(b"kept"));
        store.put(&record).await.unwrap();
    }
    assert_eq!(
        cache.status(ROOT).await.unwrap(),
        DownloadStatus::IncompleteResumable
    );

    let report = cache.run_consistency_check().await;
    assert_eq!(report.resumed, vec![ROOT.to_string()]);
    assert!(report.orphaned_owners.is_empty());

    let last = cache.handle(ROOT).unwrap().wait().await;
    assert_eq!(last.phase, Phase::Finished);
    assert_eq!(last.completed, 24);

    for url in &stored {
        assert_eq!(fetcher.calls(url), 0, "{url}");
        assert_eq!(cache.read(url).await.unwrap(), Some(Bytes::from_static(b"kept")));
    }
    assert_eq!(fetcher.total_calls(), 16);
    assert_eq!(cache.status(ROOT).await.unwrap(), DownloadStatus::Complete);
}

#[tokio::test]
async fn complete_downloads_are_not_resumed() {
    let (parts, cache) = scenario().await;
    cache.start(ROOT).wait().await;

    let report = cache.run_consistency_check().await;

    assert!(report.is_clean());
    assert!(cache.active().is_empty());
    assert_eq!(parts.fetcher.total_calls(), 21);
}
