//! Loader integration tests
//!
//! Drives the full player pathway against a scripted origin:
//!
//! 1. **Cold read** - miss, byte-range fetch, cache fill, delivery
//! 2. **Warm seek** - hit served without a second origin request
//! 3. **Composition** - cached prefix plus network tail in one request
//! 4. **Retries** - transient body failures resume at the first missing
//!    offset
//! 5. **Terminal failures** - non-retriable statuses fail fast
//! 6. **Cancellation** - a cancelled request stops the session

use bmcache::loader::PlayerEvent;
use bmcache::net::{FetchRange, RemoteSource, RetryPolicy, StubRemoteSource};
use bmcache::types::ContentInfo;
use bmcache::{CacheConfig, CacheError, MediaCache};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

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

async fn test_cache(dir: &TempDir, remote: Arc<dyn RemoteSource>) -> MediaCache {
    let cache = MediaCache::builder(test_config(dir))
        .with_remote_source(remote)
        .with_retry_policy(fast_retry())
        .build()
        .expect("build");
    cache.initialize().await.expect("initialize");
    cache
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

struct Collected {
    info: Option<ContentInfo>,
    data: Vec<u8>,
    finished: bool,
    failure: Option<CacheError>,
}

async fn collect(rx: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> Collected {
    let mut out = Collected {
        info: None,
        data: Vec::new(),
        finished: false,
        failure: None,
    };
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            match event {
                PlayerEvent::Info(info) => out.info = Some(info),
                PlayerEvent::Data(bytes) => out.data.extend_from_slice(&bytes),
                PlayerEvent::Finished => {
                    out.finished = true;
                    break;
                }
                PlayerEvent::Failed(e) => {
                    out.failure = Some(e);
                    break;
                }
            }
        }
    })
    .await;
    assert!(drained.is_ok(), "player events timed out");
    out
}

#[tokio::test]
async fn test_cold_read_of_seekable_resource() {
    let dir = TempDir::new().unwrap();
    let body = pattern(1_048_576);
    let stub = StubRemoteSource::new(body.clone());
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/movie.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(65_536), true)
        .await
        .unwrap();

    let got = collect(&mut events).await;
    assert!(got.finished, "failure: {:?}", got.failure);
    assert_eq!(got.data, &body[..65_536]);

    let info = got.info.expect("content info");
    assert_eq!(info.total_length, Some(1_048_576));
    assert!(info.supports_range);
    assert_eq!(info.content_type.as_deref(), Some("video/mp4"));

    // The fetch was scoped to exactly the requested span.
    assert_eq!(
        stub.calls(),
        vec![Some(FetchRange {
            start: 0,
            end: Some(65_535)
        })]
    );

    // The final flush trails the Finished event slightly.
    let key = cache.key_for("https://cdn.example.com/movie.mp4");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cache.get_metadata(&key).map(|m| m.cached_bytes) == Some(65_536) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "write never committed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let metadata = cache.get_metadata(&key).unwrap();
    assert_eq!(metadata.total_length, Some(1_048_576));
    assert!(metadata.supports_range);
    assert!(!metadata.is_complete);
    assert_eq!(cache.current_size(), 65_536);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_warm_seek_is_served_locally() {
    let dir = TempDir::new().unwrap();
    let body = pattern(262_144);
    let stub = StubRemoteSource::new(body.clone());
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/movie.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(65_536), false)
        .await
        .unwrap();
    assert!(collect(&mut events).await.finished);
    assert_eq!(stub.call_count(), 1);

    // Seek into the cached span: no new origin request.
    let (_id, mut events) = cache
        .handle_player_request(&url, 10_000, Some(10_001), false)
        .await
        .unwrap();
    let got = collect(&mut events).await;
    assert!(got.finished);
    assert_eq!(got.data, &body[10_000..=20_000]);
    assert_eq!(stub.call_count(), 1);

    let key = cache.key_for("https://cdn.example.com/movie.mp4");
    assert!(cache.get_metadata(&key).unwrap().access_count >= 1);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_request_composes_cached_prefix_with_network_tail() {
    let dir = TempDir::new().unwrap();
    let body = pattern(100_000);
    let stub = StubRemoteSource::new(body.clone());
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/clip.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(50_000), false)
        .await
        .unwrap();
    assert!(collect(&mut events).await.finished);

    // Second request overlaps the cached prefix and extends past it.
    let (_id, mut events) = cache
        .handle_player_request(&url, 25_000, Some(75_000), false)
        .await
        .unwrap();
    let got = collect(&mut events).await;
    assert!(got.finished, "failure: {:?}", got.failure);
    assert_eq!(got.data, &body[25_000..100_000]);

    // The tail fetch resumed at the first missing offset.
    assert_eq!(
        stub.calls(),
        vec![
            Some(FetchRange {
                start: 0,
                end: Some(49_999)
            }),
            Some(FetchRange {
                start: 50_000,
                end: Some(99_999)
            }),
        ]
    );

    cache.shutdown().await;
}

#[tokio::test]
async fn test_transient_body_failures_resume_and_recover() {
    let dir = TempDir::new().unwrap();
    let body = pattern(10_000);
    let stub = StubRemoteSource::builder(body.clone())
        .chunk_size(1_000)
        .build();
    stub.set_fail_body_after(Some(3_000));
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/flaky.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(10_000), false)
        .await
        .unwrap();

    let got = collect(&mut events).await;
    assert!(got.finished, "failure: {:?}", got.failure);
    assert_eq!(got.data, body);

    // Each retry resumed at the first missing offset.
    let starts: Vec<i64> = stub.calls().into_iter().flatten().map(|r| r.start).collect();
    assert_eq!(starts, vec![0, 3_000, 6_000, 9_000]);

    // Full coverage was verified and recorded.
    let key = cache.key_for("https://cdn.example.com/flaky.mp4");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if cache.get_metadata(&key).map(|m| m.is_complete) == Some(true) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "never marked complete");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cache.shutdown().await;
}

#[tokio::test]
async fn test_non_retriable_status_fails_fast() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::new(pattern(1_000));
    stub.set_fail_status(Some(404));
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/missing.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(1_000), false)
        .await
        .unwrap();

    let got = collect(&mut events).await;
    assert!(!got.finished);
    assert!(matches!(got.failure, Some(CacheError::HttpStatus(404))));
    // Terminal for the attempt: no retries.
    assert_eq!(stub.call_count(), 1);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_retriable_status_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::new(pattern(1_000));
    stub.set_fail_status(Some(503));
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/down.mp4");
    let (_id, mut events) = cache
        .handle_player_request(&url, 0, Some(1_000), false)
        .await
        .unwrap();

    let got = collect(&mut events).await;
    assert!(matches!(got.failure, Some(CacheError::HttpStatus(503))));
    // Initial attempt plus max_retries.
    assert_eq!(stub.call_count(), 4);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_player_cancel_stops_the_session() {
    let dir = TempDir::new().unwrap();
    let stub = StubRemoteSource::builder(pattern(1_048_576))
        .chunk_size(65_536)
        .chunk_delay(Duration::from_millis(25))
        .build();
    let cache = test_cache(&dir, stub.clone()).await;

    let url = cache.cache_url_for("https://cdn.example.com/slow.mp4");
    let (id, mut events) = cache
        .handle_player_request(&url, 0, None, false)
        .await
        .unwrap();

    // Let a few chunks arrive, then cancel.
    tokio::time::sleep(Duration::from_millis(80)).await;
    cache.handle_player_cancel(&url, id);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut finished = false;
        while let Some(event) = events.recv().await {
            if matches!(event, PlayerEvent::Finished) {
                finished = true;
            }
        }
        finished
    })
    .await
    .expect("event stream never closed");
    assert!(!drained, "cancelled request must not finish normally");

    // Bytes already written stay cached.
    let key = cache.key_for("https://cdn.example.com/slow.mp4");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let cached = cache.get_metadata(&key).map(|m| m.cached_bytes).unwrap_or(0);
        if cached > 0 {
            assert!(cached < 1_048_576);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no bytes were kept");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cache.shutdown().await;
}
