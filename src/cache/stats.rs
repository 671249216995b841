//! Aggregate cache statistics
//!
//! Counters are process-wide atomics owned by the cache core; observers get
//! immutable snapshots. Persistence is best-effort and debounced: the
//! counters survive a clean shutdown but make no crash-durability promise.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum interval between statistics file rewrites
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(5);

/// Atomic statistics counters
#[derive(Debug, Default)]
pub struct CacheStatistics {
    /// Reads fully served from disk
    hits: AtomicU64,
    /// Reads that needed the network
    misses: AtomicU64,
    /// Bytes served from the local cache
    bytes_served: AtomicU64,
    /// Bytes fetched from origins
    bytes_fetched: AtomicU64,
    /// Bytes committed to cache files
    bytes_written: AtomicU64,
    /// Entries removed by the eviction engine
    evictions: AtomicU64,
    /// Preload tasks that completed
    preloads_completed: AtomicU64,
    /// Preload tasks that failed terminally
    preloads_failed: AtomicU64,
    /// Preload tasks that were cancelled
    preloads_cancelled: AtomicU64,

    /// Last time the statistics file was rewritten
    last_persist: parking_lot::Mutex<Option<Instant>>,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    /// Reads fully served from disk
    pub hits: u64,
    /// Reads that needed the network
    pub misses: u64,
    /// Bytes served from the local cache
    pub bytes_served: u64,
    /// Bytes fetched from origins
    pub bytes_fetched: u64,
    /// Bytes committed to cache files
    pub bytes_written: u64,
    /// Entries removed by the eviction engine
    pub evictions: u64,
    /// Preload tasks that completed
    pub preloads_completed: u64,
    /// Preload tasks that failed terminally
    pub preloads_failed: u64,
    /// Preload tasks that were cancelled
    pub preloads_cancelled: u64,
}

impl StatisticsSnapshot {
    /// Hit ratio over all reads, `0.0` when nothing was read yet
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl CacheStatistics {
    /// Fresh zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume counters from a snapshot loaded off disk
    pub fn from_snapshot(s: &StatisticsSnapshot) -> Self {
        let stats = Self::new();
        stats.resume_from(s);
        stats
    }

    /// Overwrite the counters with a snapshot's values
    pub fn resume_from(&self, s: &StatisticsSnapshot) {
        self.hits.store(s.hits, Ordering::Relaxed);
        self.misses.store(s.misses, Ordering::Relaxed);
        self.bytes_served.store(s.bytes_served, Ordering::Relaxed);
        self.bytes_fetched.store(s.bytes_fetched, Ordering::Relaxed);
        self.bytes_written.store(s.bytes_written, Ordering::Relaxed);
        self.evictions.store(s.evictions, Ordering::Relaxed);
        self.preloads_completed
            .store(s.preloads_completed, Ordering::Relaxed);
        self.preloads_failed
            .store(s.preloads_failed, Ordering::Relaxed);
        self.preloads_cancelled
            .store(s.preloads_cancelled, Ordering::Relaxed);
    }

    /// Record a read hit serving `bytes` from disk
    pub fn record_hit(&self, bytes: u64) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a read miss
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes fetched from an origin
    pub fn record_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes committed to a cache file
    pub fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record an eviction
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preload outcome
    pub fn record_preload_outcome(&self, completed: bool, cancelled: bool) {
        if completed {
            self.preloads_completed.fetch_add(1, Ordering::Relaxed);
        } else if cancelled {
            self.preloads_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.preloads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bytes_served: self.bytes_served.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            preloads_completed: self.preloads_completed.load(Ordering::Relaxed),
            preloads_failed: self.preloads_failed.load(Ordering::Relaxed),
            preloads_cancelled: self.preloads_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Write the counters to `path` if the debounce interval has elapsed
    ///
    /// Best-effort: failures are logged, never surfaced, and there is no
    /// fsync.
    pub async fn maybe_persist(&self, path: &Path) {
        {
            let mut last = self.last_persist.lock();
            if let Some(at) = *last {
                if at.elapsed() < PERSIST_DEBOUNCE {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        self.persist(path).await;
    }

    /// Write the counters to `path` unconditionally (used at shutdown)
    pub async fn persist(&self, path: &Path) {
        let snapshot = self.snapshot();
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(contents) => {
                if let Err(e) = tokio::fs::write(path, contents).await {
                    debug!(path = %path.display(), error = %e, "statistics persist failed");
                }
            }
            Err(e) => debug!(error = %e, "statistics encode failed"),
        }
    }

    /// Load a snapshot from `path`, empty when missing or unreadable
    pub async fn load(path: &Path) -> StatisticsSnapshot {
        match tokio::fs::read(path).await {
            Ok(contents) => serde_json::from_slice(&contents).unwrap_or_default(),
            Err(_) => StatisticsSnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_counters_and_hit_rate() {
        let stats = CacheStatistics::new();
        stats.record_hit(100);
        stats.record_hit(50);
        stats.record_miss();
        stats.record_fetched(4096);

        let snap = stats.snapshot();
        assert_eq!(snap.hits, 2);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.bytes_served, 150);
        assert_eq!(snap.bytes_fetched, 4096);
        assert!((snap.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_preload_outcomes() {
        let stats = CacheStatistics::new();
        stats.record_preload_outcome(true, false);
        stats.record_preload_outcome(false, true);
        stats.record_preload_outcome(false, false);

        let snap = stats.snapshot();
        assert_eq!(snap.preloads_completed, 1);
        assert_eq!(snap.preloads_cancelled, 1);
        assert_eq!(snap.preloads_failed, 1);
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statistics.json");

        let stats = CacheStatistics::new();
        stats.record_hit(10);
        stats.record_eviction();
        stats.persist(&path).await;

        let loaded = CacheStatistics::load(&path).await;
        assert_eq!(loaded, stats.snapshot());

        let resumed = CacheStatistics::from_snapshot(&loaded);
        assert_eq!(resumed.snapshot(), loaded);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = CacheStatistics::load(&dir.path().join("nope.json")).await;
        assert_eq!(loaded, StatisticsSnapshot::default());
    }
}
