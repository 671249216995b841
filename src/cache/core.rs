//! Cache core: the single coordination point for metadata and data files
//!
//! All metadata mutation and `current_cache_size` accounting runs through
//! one async mutex, making the core a single-consumer serialization domain.
//! Disk and network I/O still overlap freely across resources because the
//! heavy streaming work happens in loaders; the core only serializes the
//! commit path.
//!
//! # Buffered writes
//!
//! The network delivers many small chunks. Writes land in a per-key batch
//! buffer and are committed when the flush window (default 500 ms) elapses
//! or the buffer grows past a threshold, coalescing file writes while
//! bounding staleness. Reads flush the key's pending batch first, so a read
//! that follows a successful write always observes the written bytes. A
//! failed flush applies only the ranges of chunks that reached the file;
//! the tentative additions for the remainder are rolled back.

use crate::cache::eviction::{Candidate, EvictionEngine};
use crate::cache::stats::CacheStatistics;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::ranges::ByteRange;
use crate::storage::{FileSlotManager, MetadataStore, ResourceMetadata};
use crate::types::{
    now_millis, ContentInfo, MemoryPressure, ProgressCallback, ProgressUpdate, ResourceKey,
    ResourcePriority,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Flush a key's batch once it holds this many buffered bytes, regardless
/// of the flush window
const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Minimum interval between progress callbacks for one resource
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum percent change between progress callbacks for one resource
const PROGRESS_MIN_DELTA: f64 = 0.005;

/// Non-suspending view of which keys have in-flight loaders
///
/// Held by the core so eviction can skip live entries; the loader registry
/// implements it. This is the only capability the core has toward the
/// loader side, which keeps the reference graph acyclic.
pub trait ActiveKeys: Send + Sync {
    /// Whether a loader with attached requests exists for `key`
    fn is_active(&self, key: &ResourceKey) -> bool;
}

/// Pending buffered chunks for one key
struct WriteBatch {
    chunks: Vec<(i64, Bytes)>,
    buffered: usize,
    last_flush: Instant,
}

impl WriteBatch {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            buffered: 0,
            last_flush: Instant::now(),
        }
    }
}

/// Throttle state for one resource's progress callback
struct ProgressGate {
    last_call: Instant,
    last_percent: f64,
}

/// Public cache operations: read-range, write-range, completion, removal
pub struct CacheCore {
    config: Arc<CacheConfig>,
    store: MetadataStore,
    eviction: EvictionEngine,
    stats: Arc<CacheStatistics>,

    /// Serializes metadata mutation, flushes, and size accounting
    commit_lock: tokio::sync::Mutex<()>,

    slots: Mutex<HashMap<ResourceKey, Arc<FileSlotManager>>>,
    batches: Mutex<HashMap<ResourceKey, WriteBatch>>,
    progress_gates: Mutex<HashMap<ResourceKey, ProgressGate>>,

    current_size: AtomicI64,
    initialized: AtomicBool,

    active_view: RwLock<Option<Arc<dyn ActiveKeys>>>,
    progress: RwLock<Option<ProgressCallback>>,
}

impl CacheCore {
    /// Create a core over `config`; call [`initialize`](Self::initialize)
    /// before using it
    pub fn new(config: Arc<CacheConfig>) -> Self {
        let store = MetadataStore::new(Arc::clone(&config));
        let eviction = EvictionEngine::new(config.cleanup_strategy.clone());
        Self {
            config,
            store,
            eviction,
            stats: Arc::new(CacheStatistics::new()),
            commit_lock: tokio::sync::Mutex::new(()),
            slots: Mutex::new(HashMap::new()),
            batches: Mutex::new(HashMap::new()),
            progress_gates: Mutex::new(HashMap::new()),
            current_size: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
            active_view: RwLock::new(None),
            progress: RwLock::new(None),
        }
    }

    /// Run startup reconciliation and resume persisted statistics
    pub async fn initialize(&self) -> Result<()> {
        let total = self.store.load_all().await?;
        self.current_size.store(total, Ordering::SeqCst);

        let snapshot = CacheStatistics::load(&self.statistics_path()).await;
        self.stats.resume_from(&snapshot);
        self.initialized.store(true, Ordering::SeqCst);
        info!(cached_bytes = total, "cache core initialized");
        Ok(())
    }

    /// Wire the loader registry's activity view
    pub fn set_active_view(&self, view: Arc<dyn ActiveKeys>) {
        *self.active_view.write() = Some(view);
    }

    /// Install the download progress observer
    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.progress.write() = Some(callback);
    }

    /// Register a custom eviction ordering under a stable identifier
    pub fn register_eviction_ordering(
        &self,
        id: impl Into<String>,
        ordering: crate::cache::eviction::CustomOrdering,
    ) {
        self.eviction.register_custom(id, ordering);
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<CacheStatistics> {
        Arc::clone(&self.stats)
    }

    /// Sum of cached bytes across all resources
    pub fn current_size(&self) -> i64 {
        self.current_size.load(Ordering::SeqCst)
    }

    /// Configuration this core was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Path of the best-effort statistics file
    pub fn statistics_path(&self) -> std::path::PathBuf {
        self.config.cache_directory.join("statistics.json")
    }

    fn guard_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    /// Snapshot of one resource's metadata
    pub fn get_metadata(&self, key: &ResourceKey) -> Option<ResourceMetadata> {
        self.store.get(key)
    }

    /// Snapshot of every resource's metadata
    pub fn contents(&self) -> Vec<ResourceMetadata> {
        self.store.all()
    }

    /// Content info for the player's info sub-request, if known
    pub fn get_content_info(&self, key: &ResourceKey) -> Option<ContentInfo> {
        self.store.get(key).and_then(|m| m.content_info())
    }

    /// Create metadata for a resource if none exists yet
    ///
    /// Applies the configured default expiration interval to new entries.
    pub async fn ensure_resource(
        &self,
        key: &ResourceKey,
        url: &str,
        priority: ResourcePriority,
    ) -> Result<ResourceMetadata> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        if let Some(existing) = self.store.get(key) {
            return Ok(existing);
        }
        let mut metadata = ResourceMetadata::new(key.clone(), url.to_string());
        metadata.priority = priority;
        if let Some(interval) = self.config.default_expiration_interval_secs {
            metadata.expiration_at = Some(now_millis() + (interval as i64) * 1000);
        }
        self.store.put(metadata.clone()).await?;
        Ok(metadata)
    }

    /// Serve `range` from the cache, or `None` on a miss
    ///
    /// Partial overlap is a miss: composing partial reads with network
    /// fills is the loader's job. A hit bumps `access_count` and
    /// `last_access`.
    pub async fn read(&self, key: &ResourceKey, range: ByteRange) -> Result<Option<Bytes>> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        self.flush_key_locked(key).await?;

        let Some(mut metadata) = self.store.get(key) else {
            self.stats.record_miss();
            return Ok(None);
        };
        if !metadata.ranges.contains(range) {
            self.stats.record_miss();
            return Ok(None);
        }

        let slot = self.ensure_slot(key).await?;
        let data = slot.read(range.start, range.len() as usize).await?;
        if data.len() as i64 != range.len() {
            // The range set claims bytes the file does not hold; treat as a
            // miss so the loader re-fetches.
            warn!(key = %key, range = %range, "range set ahead of file contents");
            self.stats.record_miss();
            return Ok(None);
        }

        metadata.access_count += 1;
        metadata.touch();
        self.store.put(metadata).await?;
        self.stats.record_hit(data.len() as u64);
        Ok(Some(data))
    }

    /// Buffer `data` at `offset` for `key`, flushing when the window
    /// elapses, then enforce `budget`
    pub async fn write(
        &self,
        key: &ResourceKey,
        offset: i64,
        data: Bytes,
        budget: u64,
    ) -> Result<()> {
        self.guard_initialized()?;
        if data.is_empty() {
            return Err(CacheError::Config("empty write rejected".to_string()));
        }
        if offset < 0 {
            return Err(CacheError::Config(format!(
                "negative write offset {}",
                offset
            )));
        }

        let flushed = {
            let _guard = self.commit_lock.lock().await;
            let metadata = self
                .store
                .get(key)
                .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
            if let Some(total) = metadata.total_length {
                if offset >= total || offset + data.len() as i64 > total {
                    return Err(CacheError::Config(format!(
                        "write [{}, {}) beyond total length {}",
                        offset,
                        offset + data.len() as i64,
                        total
                    )));
                }
            }

            let should_flush = {
                let mut batches = self.batches.lock();
                let batch = batches.entry(key.clone()).or_insert_with(WriteBatch::new);
                batch.buffered += data.len();
                batch.chunks.push((offset, data));
                batch.buffered >= MAX_BATCH_BYTES
                    || batch.last_flush.elapsed()
                        >= Duration::from_millis(self.config.write_flush_interval_ms)
            };

            if should_flush {
                self.flush_key_locked(key).await?;
                true
            } else {
                false
            }
        };

        if flushed {
            self.check_eviction(budget).await;
        }
        Ok(())
    }

    /// Commit every batch whose flush window has elapsed
    ///
    /// Driven by the facade's flush ticker so buffered chunks never go
    /// stale when writes pause.
    pub async fn flush_stale(&self, budget: u64) -> Result<()> {
        self.guard_initialized()?;
        let window = Duration::from_millis(self.config.write_flush_interval_ms);
        let stale: Vec<ResourceKey> = {
            let batches = self.batches.lock();
            batches
                .iter()
                .filter(|(_, b)| !b.chunks.is_empty() && b.last_flush.elapsed() >= window)
                .map(|(k, _)| k.clone())
                .collect()
        };
        if stale.is_empty() {
            return Ok(());
        }

        {
            let _guard = self.commit_lock.lock().await;
            for key in &stale {
                if let Err(e) = self.flush_key_locked(key).await {
                    warn!(key = %key, error = %e, "stale batch flush failed");
                }
            }
        }
        self.check_eviction(budget).await;
        Ok(())
    }

    /// Commit the pending batch for one key immediately
    ///
    /// Loaders call this before consulting the range set so buffered
    /// chunks are visible.
    pub async fn flush_resource(&self, key: &ResourceKey) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        self.flush_key_locked(key).await
    }

    /// Flush all pending chunks for every key
    pub async fn flush_all(&self) -> Result<()> {
        let keys: Vec<ResourceKey> = self.batches.lock().keys().cloned().collect();
        let _guard = self.commit_lock.lock().await;
        for key in keys {
            self.flush_key_locked(&key).await?;
        }
        Ok(())
    }

    /// Verify the file and mark the resource complete
    ///
    /// Flushes pending writes and fsyncs before the completion flag is
    /// set. Verification compares the on-disk size against `expected_size`
    /// (falling back to the known total length, then the sum of cached
    /// intervals) and requires the range set to cover that size exactly.
    /// On mismatch the entry stays incomplete, the partial cache is kept,
    /// and an integrity error is returned.
    pub async fn mark_complete(&self, key: &ResourceKey, expected_size: Option<i64>) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        self.flush_key_locked(key).await?;

        let mut metadata = self
            .store
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        let slot = self.ensure_slot(key).await?;
        slot.sync().await?;
        let actual = slot.file_size().await?;

        let expected = expected_size
            .or(metadata.total_length)
            .unwrap_or_else(|| metadata.ranges.total_len());

        if actual == expected && metadata.ranges.covers_exactly(expected) {
            metadata.total_length = Some(expected);
            metadata.is_complete = true;
            metadata.touch();
            self.store.put(metadata).await?;
            debug!(key = %key, size = expected, "resource marked complete");
            Ok(())
        } else {
            metadata.is_complete = false;
            metadata.touch();
            self.store.put(metadata).await?;
            Err(CacheError::Integrity { expected, actual })
        }
    }

    /// Remove a resource: pending batch, file slot, data file, record
    pub async fn remove(&self, key: &ResourceKey) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        self.remove_locked(key).await
    }

    async fn remove_locked(&self, key: &ResourceKey) -> Result<()> {
        // Pending chunks are dropped, not flushed: the entry is going away.
        self.batches.lock().remove(key);
        self.progress_gates.lock().remove(key);

        let slot = self.slots.lock().remove(key);
        if let Some(slot) = slot {
            if let Err(e) = slot.close().await {
                debug!(key = %key, error = %e, "slot close during removal failed");
            }
        }

        match tokio::fs::remove_file(self.config.data_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(removed) = self.store.remove(key).await? {
            self.current_size
                .fetch_sub(removed.cached_bytes, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Remove every resource and reset the size counter
    pub async fn clear_all(&self) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        let keys: Vec<ResourceKey> = self.store.all().into_iter().map(|m| m.key).collect();
        for key in keys {
            self.remove_locked(&key).await?;
        }
        Ok(())
    }

    /// Fill content info learned from the first origin response
    ///
    /// Fill-once semantics: fields already learned are never overwritten,
    /// so a later response cannot change the resource's identity.
    pub async fn update_content_info(&self, key: &ResourceKey, info: &ContentInfo) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        let mut metadata = self
            .store
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        let mut changed = false;
        if metadata.content_type.is_none() && info.content_type.is_some() {
            metadata.content_type = info.content_type.clone();
            changed = true;
        }
        if metadata.total_length.is_none() && info.total_length.is_some() {
            metadata.total_length = info.total_length;
            changed = true;
        }
        if info.supports_range && !metadata.supports_range {
            metadata.supports_range = true;
            changed = true;
        }
        if changed {
            metadata.touch();
            self.store.put(metadata).await?;
        }
        Ok(())
    }

    /// Set the eviction priority of a resource
    pub async fn set_priority(&self, key: &ResourceKey, priority: ResourcePriority) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        let mut metadata = self
            .store
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        metadata.priority = priority;
        metadata.touch();
        self.store.put(metadata).await
    }

    /// Set or clear the expiration deadline of a resource
    pub async fn set_expiration_at(
        &self,
        key: &ResourceKey,
        expiration_at: Option<i64>,
    ) -> Result<()> {
        self.guard_initialized()?;
        let _guard = self.commit_lock.lock().await;
        let mut metadata = self
            .store
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        metadata.expiration_at = expiration_at;
        metadata.touch();
        self.store.put(metadata).await
    }

    /// Enforce the byte budget and disk floor with one eviction pass
    pub async fn check_eviction(&self, budget: u64) {
        let excess = self.current_size() - budget as i64;
        let disk_deficit = match crate::storage::disk::available_bytes(&self.config.cache_directory)
        {
            Some(available) if available < self.config.min_free_disk_bytes => {
                (self.config.min_free_disk_bytes - available) as i64
            }
            _ => 0,
        };
        if excess <= 0 && disk_deficit <= 0 {
            return;
        }
        let needed = excess.max(disk_deficit);

        let _guard = self.commit_lock.lock().await;
        let candidates = self.collect_candidates();
        let plan = self
            .eviction
            .plan(candidates, needed, now_millis());
        if plan.is_empty() {
            debug!(
                needed,
                "eviction pass found no eligible candidates; retrying on next event"
            );
            return;
        }

        for key in plan {
            match self.remove_locked(&key).await {
                Ok(()) => {
                    self.stats.record_eviction();
                    info!(key = %key, "evicted cache entry");
                }
                Err(e) => warn!(key = %key, error = %e, "eviction removal failed"),
            }
        }
    }

    /// Expired sweep followed by a budget pass; run on the cleanup timer
    pub async fn run_periodic_cleanup(&self, budget: u64) {
        {
            let _guard = self.commit_lock.lock().await;
            let candidates = self.collect_candidates();
            let expired = self.eviction.expired(&candidates, now_millis());
            for key in expired {
                match self.remove_locked(&key).await {
                    Ok(()) => {
                        self.stats.record_eviction();
                        info!(key = %key, "removed expired cache entry");
                    }
                    Err(e) => warn!(key = %key, error = %e, "expired removal failed"),
                }
            }
        }
        self.check_eviction(budget).await;
    }

    /// Apply a host-delivered memory pressure level
    pub async fn handle_memory_pressure(&self, level: MemoryPressure) {
        let _guard = self.commit_lock.lock().await;
        let candidates = self.collect_candidates();
        let plan = self.eviction.pressure_plan(&candidates, level);
        if plan.is_empty() {
            return;
        }
        info!(?level, count = plan.len(), "memory pressure eviction");
        for key in plan {
            if let Err(e) = self.remove_locked(&key).await {
                warn!(key = %key, error = %e, "pressure removal failed");
            } else {
                self.stats.record_eviction();
            }
        }
    }

    /// Candidates eligible for eviction: non-permanent, not active, and
    /// not touched by a pending batch
    fn collect_candidates(&self) -> Vec<Candidate> {
        let active_view = self.active_view.read().clone();
        let batches = self.batches.lock();
        self.store
            .all()
            .into_iter()
            .filter(|m| m.priority != ResourcePriority::Permanent)
            .filter(|m| {
                active_view
                    .as_ref()
                    .map(|v| !v.is_active(&m.key))
                    .unwrap_or(true)
            })
            .filter(|m| {
                batches
                    .get(&m.key)
                    .map(|b| b.chunks.is_empty())
                    .unwrap_or(true)
            })
            .map(|m| Candidate {
                key: m.key,
                cached_bytes: m.cached_bytes,
                last_access: m.last_access,
                access_count: m.access_count,
                priority: m.priority,
                expiration_at: m.expiration_at,
                is_complete: m.is_complete,
            })
            .collect()
    }

    async fn ensure_slot(&self, key: &ResourceKey) -> Result<Arc<FileSlotManager>> {
        if let Some(slot) = self.slots.lock().get(key) {
            return Ok(Arc::clone(slot));
        }
        let slot = Arc::new(FileSlotManager::open(self.config.data_path(key)).await?);
        let mut slots = self.slots.lock();
        Ok(Arc::clone(slots.entry(key.clone()).or_insert(slot)))
    }

    /// Commit the pending batch for `key`; caller holds the commit lock
    ///
    /// Chunks are applied in enqueue order. Ranges and size accounting are
    /// updated only for chunks whose write succeeded; the first failure
    /// drops the remainder of the batch and surfaces the error after the
    /// partial success is recorded.
    async fn flush_key_locked(&self, key: &ResourceKey) -> Result<()> {
        let chunks: Vec<(i64, Bytes)> = {
            let mut batches = self.batches.lock();
            match batches.get_mut(key) {
                Some(batch) if !batch.chunks.is_empty() => {
                    batch.buffered = 0;
                    batch.last_flush = Instant::now();
                    std::mem::take(&mut batch.chunks)
                }
                _ => return Ok(()),
            }
        };

        let slot = self.ensure_slot(key).await?;
        let mut metadata = self
            .store
            .get(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;

        let old_total = metadata.ranges.total_len();
        let mut written: u64 = 0;
        let mut failure: Option<CacheError> = None;

        for (offset, data) in chunks {
            match slot.write(offset, &data).await {
                Ok(()) => {
                    metadata
                        .ranges
                        .add(ByteRange::with_len(offset, data.len() as i64)?);
                    written += data.len() as u64;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let new_total = metadata.ranges.total_len();
        let delta = new_total - old_total;
        metadata.cached_bytes = new_total;
        metadata.touch();
        self.current_size.fetch_add(delta, Ordering::SeqCst);
        self.stats.record_written(written);
        self.store.put(metadata.clone()).await?;
        self.emit_progress(&metadata);

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Throttled progress callback: at most one call per 100 ms or per
    /// 0.5 % change, whichever comes sooner
    fn emit_progress(&self, metadata: &ResourceMetadata) {
        let Some(total) = metadata.total_length.filter(|t| *t > 0) else {
            return;
        };
        let Some(callback) = self.progress.read().clone() else {
            return;
        };

        let percent = metadata.cached_bytes as f64 / total as f64;
        let should_emit = {
            let mut gates = self.progress_gates.lock();
            let gate = gates
                .entry(metadata.key.clone())
                .or_insert_with(|| ProgressGate {
                    last_call: Instant::now() - PROGRESS_MIN_INTERVAL,
                    last_percent: -1.0,
                });
            if gate.last_call.elapsed() >= PROGRESS_MIN_INTERVAL
                || (percent - gate.last_percent).abs() >= PROGRESS_MIN_DELTA
            {
                gate.last_call = Instant::now();
                gate.last_percent = percent;
                true
            } else {
                false
            }
        };

        if should_emit {
            callback(ProgressUpdate {
                key: metadata.key.clone(),
                url: metadata.original_url.clone(),
                percent,
                cached_bytes: metadata.cached_bytes,
                total_bytes: total,
            });
        }
    }
}
