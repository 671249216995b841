//! Preload scheduler integration tests
//!
//! Exercises the scheduler against a scripted origin:
//!
//! 1. **Basic prefetch** - prefix lands on disk, task completes
//! 2. **Cancellation** - mid-flight cancel keeps the partial cache
//! 3. **Concurrency bound** - never more than `max_concurrent` running
//! 4. **Pause/resume** - parked tasks skip dispatch until resumed
//! 5. **Failure** - terminal and retried failures, timeouts
//! 6. **HLS** - playlist segments fan out into their own tasks

use bmcache::net::{RemoteSource, RetryPolicy, StubRemoteSource};
use bmcache::preload::{SchedulerConfig, SchedulerSnapshot, TaskState};
use bmcache::ranges::ByteRange;
use bmcache::types::ResourcePriority;
use bmcache::{CacheConfig, MediaCache};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.cache_directory = dir.path().to_path_buf();
    config.min_free_disk_bytes = 0;
    config.write_flush_interval_ms = 20;
    config
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(10),
        factor: 2.0,
        max_delay: Duration::from_millis(50),
    }
}

fn scheduler_config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent,
        batch_size: max_concurrent,
        max_retries: 1,
        retry_initial_secs: 0,
        dynamic_aging_enabled: true,
        aging_threshold: Duration::from_secs(30),
        history_limit: 100,
        task_timeout: Duration::from_secs(30),
    }
}

async fn test_cache(
    dir: &TempDir,
    remote: Arc<dyn RemoteSource>,
    scheduler: SchedulerConfig,
) -> MediaCache {
    let cache = MediaCache::builder(test_config(dir))
        .with_remote_source(remote)
        .with_retry_policy(fast_retry())
        .with_scheduler_config(scheduler)
        .build()
        .expect("build");
    cache.initialize().await.expect("initialize");
    cache
}

async fn wait_for_snapshot<F>(cache: &MediaCache, deadline: Duration, predicate: F) -> SchedulerSnapshot
where
    F: Fn(&SchedulerSnapshot) -> bool,
{
    let until = tokio::time::Instant::now() + deadline;
    loop {
        let snapshot = cache.preload_snapshot().await.expect("snapshot");
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < until,
            "snapshot condition not reached: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_preload_prefetches_prefix() {
    let dir = TempDir::new().unwrap();
    let body: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    let stub = StubRemoteSource::new(body.clone());
    let cache = test_cache(&dir, stub.clone(), scheduler_config(3)).await;

    let id = cache
        .preload("https://cdn.example.com/v.mp4", Some(2_048), ResourcePriority::High)
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&cache, Duration::from_secs(5), |s| {
        s.counters.completed == 1
    })
    .await;
    assert_eq!(snapshot.counters.created, 1);
    let done = snapshot.history.iter().find(|t| t.id == id).unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert!(done.started_at.is_some());
    assert!(done.ended_at.is_some());

    // The prefix is on disk and readable.
    let key = cache.key_for("https://cdn.example.com/v.mp4");
    let read = cache
        .read(&key, ByteRange::new(0, 2_047).unwrap())
        .await
        .unwrap()
        .expect("prefix cached");
    assert_eq!(&read[..], &body[..2_048]);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_preload_of_cached_resource_completes_without_fetch() {
    let dir = TempDir::new().unwrap();
    let body = vec![6u8; 4_096];
    let stub = StubRemoteSource::new(body);
    let cache = test_cache(&dir, stub.clone(), scheduler_config(3)).await;

    let id = cache
        .preload("https://cdn.example.com/v.mp4", Some(4_096), ResourcePriority::Normal)
        .await
        .unwrap();
    wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.counters.completed == 1).await;
    let fetches = stub.call_count();
    let _ = id;

    // Same prefix again: satisfied straight from the cache.
    cache
        .preload("https://cdn.example.com/v.mp4", Some(4_096), ResourcePriority::Normal)
        .await
        .unwrap();
    wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.counters.completed == 2).await;
    assert_eq!(stub.call_count(), fetches);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_cancel_mid_flight_keeps_partial_cache() {
    let dir = TempDir::new().unwrap();
    let total = 2 * 1024 * 1024;
    let stub = StubRemoteSource::builder(vec![9u8; total])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(30))
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    let id = cache
        .preload("https://cdn.example.com/big.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();

    // Wait for bytes to land, then cancel.
    let key = cache.key_for("https://cdn.example.com/big.mp4");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cache.current_size() > 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no bytes arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cache.cancel_preload(id).await);

    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.counters.cancelled == 1).await;
    let task = snapshot.history.iter().find(|t| t.id == id).unwrap();
    assert_eq!(task.state, TaskState::Cancelled);

    // Partial bytes survive and serve hits.
    let metadata = cache.get_metadata(&key).unwrap();
    assert!(metadata.cached_bytes > 0);
    assert!(metadata.cached_bytes < total as i64);
    assert!(!metadata.is_complete);
    let read = cache
        .read(&key, ByteRange::new(0, 1_023).unwrap())
        .await
        .unwrap();
    assert!(read.is_some());

    // Cancelling a terminal task is a no-op.
    assert!(!cache.cancel_preload(id).await);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_running_set_respects_concurrency_bound() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(vec![1u8; 256 * 1024])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(20))
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(2)).await;

    for i in 0..5 {
        cache
            .preload(
                &format!("https://cdn.example.com/{i}.mp4"),
                None,
                ResourcePriority::Normal,
            )
            .await
            .unwrap();
    }

    let until = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = cache.preload_snapshot().await.unwrap();
        assert!(
            snapshot.running.len() <= 2,
            "bound violated: {} running",
            snapshot.running.len()
        );
        if snapshot.counters.completed == 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < until, "preloads never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cache.shutdown().await;
}

#[tokio::test]
async fn test_priority_orders_dispatch() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(vec![1u8; 128 * 1024])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(30))
        .build();
    // One slot: the first task occupies it while the rest queue up.
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    cache
        .preload("https://cdn.example.com/first.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();
    cache
        .preload("https://cdn.example.com/low.mp4", None, ResourcePriority::Low)
        .await
        .unwrap();
    let high = cache
        .preload("https://cdn.example.com/high.mp4", None, ResourcePriority::High)
        .await
        .unwrap();

    let snapshot = wait_for_snapshot(&cache, Duration::from_secs(2), |s| s.queued.len() == 2).await;
    // High priority jumped the queue despite enqueueing last.
    assert_eq!(snapshot.queued[0].id, high);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(vec![2u8; 512 * 1024])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(30))
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    cache
        .preload("https://cdn.example.com/running.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();
    let parked = cache
        .preload("https://cdn.example.com/parked.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();

    assert!(cache.pause_preload(parked).await);
    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(2), |s| s.paused.len() == 1).await;
    assert_eq!(snapshot.paused[0].id, parked);
    assert_eq!(snapshot.paused[0].state, TaskState::Paused);

    // The slot frees up but the parked task is not dispatched.
    wait_for_snapshot(&cache, Duration::from_secs(10), |s| s.counters.completed == 1).await;
    let snapshot = cache.preload_snapshot().await.unwrap();
    assert!(snapshot.running.is_empty());
    assert_eq!(snapshot.paused.len(), 1);

    assert!(cache.resume_preload(parked).await);
    wait_for_snapshot(&cache, Duration::from_secs(10), |s| s.counters.completed == 2).await;

    cache.shutdown().await;
}

#[tokio::test]
async fn test_pause_running_task_keeps_partial_and_requeues() {
    let dir = TempDir::new().unwrap();
    let total = 1024 * 1024;
    let stub = StubRemoteSource::builder(vec![4u8; total])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(30))
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    let id = cache
        .preload("https://cdn.example.com/paused.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if cache.current_size() > 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no bytes arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cache.pause_preload(id).await);

    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.paused.len() == 1).await;
    assert_eq!(snapshot.paused[0].id, id);
    assert_eq!(snapshot.counters.cancelled, 0, "pause is not a cancel");

    // Partial cache survived the pause.
    let key = cache.key_for("https://cdn.example.com/paused.mp4");
    assert!(cache.get_metadata(&key).unwrap().cached_bytes > 0);

    // Resuming finishes the job from where the cache left off.
    assert!(cache.resume_preload(id).await);
    wait_for_snapshot(&cache, Duration::from_secs(10), |s| s.counters.completed == 1).await;
    let metadata = cache.get_metadata(&key).unwrap();
    assert!(metadata.is_complete);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_terminal_failure_after_retries() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::new(vec![0u8; 1_000]);
    stub.set_fail_status(Some(503));
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    let id = cache
        .preload("https://cdn.example.com/down.mp4", Some(1_000), ResourcePriority::Normal)
        .await
        .unwrap();

    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(10), |s| s.counters.failed == 1).await;
    let task = snapshot.history.iter().find(|t| t.id == id).unwrap();
    assert!(matches!(task.state, TaskState::Failed(_)));
    assert_eq!(task.retry_count, 1);

    // Loader-level retries (4 fetches) times scheduler attempts (2).
    assert_eq!(stub.call_count(), 8);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_non_retriable_failure_is_terminal_immediately() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::new(vec![0u8; 1_000]);
    stub.set_fail_status(Some(403));
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    let id = cache
        .preload("https://cdn.example.com/forbidden.mp4", Some(1_000), ResourcePriority::Normal)
        .await
        .unwrap();

    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.counters.failed == 1).await;
    let task = snapshot.history.iter().find(|t| t.id == id).unwrap();
    assert!(matches!(task.state, TaskState::Failed(_)));
    assert_eq!(task.retry_count, 0);
    assert_eq!(stub.call_count(), 1);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_task_timeout_fails_the_task() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(vec![1u8; 10 * 1024 * 1024])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(50))
        .build();
    let mut config = scheduler_config(1);
    config.task_timeout = Duration::from_millis(200);
    let cache = test_cache(&dir, stub.clone(), config).await;

    let id = cache
        .preload("https://cdn.example.com/endless.mp4", None, ResourcePriority::Normal)
        .await
        .unwrap();

    let snapshot =
        wait_for_snapshot(&cache, Duration::from_secs(5), |s| s.counters.failed == 1).await;
    let task = snapshot.history.iter().find(|t| t.id == id).unwrap();
    match &task.state {
        TaskState::Failed(reason) => assert!(reason.contains("timed out"), "reason: {reason}"),
        other => panic!("expected timeout failure, got {other:?}"),
    }

    cache.shutdown().await;
}

#[tokio::test]
async fn test_cancel_all_clears_everything() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(vec![1u8; 1024 * 1024])
        .chunk_size(64 * 1024)
        .chunk_delay(Duration::from_millis(30))
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(1)).await;

    for i in 0..4 {
        cache
            .preload(
                &format!("https://cdn.example.com/{i}.mp4"),
                None,
                ResourcePriority::Normal,
            )
            .await
            .unwrap();
    }

    cache.cancel_all_preloads();
    let snapshot = wait_for_snapshot(&cache, Duration::from_secs(5), |s| {
        s.counters.cancelled == 4 && s.running.is_empty() && s.queued.is_empty()
    })
    .await;
    assert!(snapshot
        .history
        .iter()
        .all(|t| t.state == TaskState::Cancelled));

    cache.shutdown().await;
}

#[tokio::test]
async fn test_hls_playlist_fans_out_segments() {
    let dir = TempDir::new().unwrap();
    let playlist = "#EXTM3U\n\
                    #EXT-X-TARGETDURATION:10\n\
                    #EXTINF:9.0,\n\
                    seg0.ts\n\
                    #EXTINF:9.0,\n\
                    seg1.ts\n\
                    #EXT-X-ENDLIST\n";
    let stub = StubRemoteSource::builder(playlist.as_bytes().to_vec())
        .content_type("application/vnd.apple.mpegurl")
        .build();
    let cache = test_cache(&dir, stub.clone(), scheduler_config(3)).await;

    cache
        .preload(
            "https://cdn.example.com/live/index.m3u8",
            None,
            ResourcePriority::Normal,
        )
        .await
        .unwrap();

    // The playlist task plus one task per referenced segment.
    let snapshot = wait_for_snapshot(&cache, Duration::from_secs(10), |s| {
        s.counters.created >= 3 && s.counters.completed >= 3
    })
    .await;
    assert!(snapshot.counters.created >= 3);

    let seg_key = cache.key_for("https://cdn.example.com/live/seg0.ts");
    assert!(cache.get_metadata(&seg_key).is_some());

    cache.shutdown().await;
}
