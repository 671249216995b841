//! Facade wiring the cache core, loaders, and preload scheduler together
//!
//! # Example
//!
//! ```rust,no_run
//! use bmcache::{CacheConfig, MediaCache};
//! use bmcache::types::ResourcePriority;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = CacheConfig::default();
//! config.cache_directory = "/tmp/bmcache".into();
//!
//! let cache = MediaCache::builder(config).build()?;
//! cache.initialize().await?;
//!
//! // Out-of-band prefetch of the first megabyte.
//! let task = cache
//!     .preload("https://cdn.example.com/v.mp4", Some(1024 * 1024), ResourcePriority::High)
//!     .await?;
//!
//! // Player requests arrive through the interceptor with cache-scheme URLs.
//! let url = cache.cache_url_for("https://cdn.example.com/v.mp4");
//! let (_id, _events) = cache.handle_player_request(&url, 0, Some(65_536), true).await?;
//!
//! cache.cancel_preload(task).await;
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheCore, CustomOrdering, StatisticsSnapshot};
use crate::config::CacheConfig;
use crate::error::Result;
use crate::loader::{LoaderContext, LoaderRegistry, PlayerEvent, SegmentRequest};
use crate::net::{HttpRemoteSource, RemoteSource, RetryPolicy};
use crate::preload::{PreloadScheduler, SchedulerConfig, SchedulerSnapshot, TaskId};
use crate::ranges::ByteRange;
use crate::storage::ResourceMetadata;
use crate::types::{
    cache_url_for, ContentInfo, MemoryPressure, ProgressCallback, ResourceKey, ResourcePriority,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Builder for [`MediaCache`]
pub struct MediaCacheBuilder {
    config: CacheConfig,
    remote: Option<Arc<dyn RemoteSource>>,
    retry: RetryPolicy,
    scheduler: Option<SchedulerConfig>,
    progress: Option<ProgressCallback>,
}

impl MediaCacheBuilder {
    /// Start a builder from a configuration
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            remote: None,
            retry: RetryPolicy::default(),
            scheduler: None,
            progress: None,
        }
    }

    /// Replace the origin source (defaults to the HTTP client)
    pub fn with_remote_source(mut self, remote: Arc<dyn RemoteSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replace the retry policy for origin fetches
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the preload scheduler tunables
    ///
    /// By default `max_concurrent` and the task timeout come from the
    /// cache configuration.
    pub fn with_scheduler_config(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Install a download progress observer
    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Wire everything together
    ///
    /// The cache is not usable until [`MediaCache::initialize`] has run.
    pub fn build(self) -> Result<MediaCache> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let remote: Arc<dyn RemoteSource> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemoteSource::new(
                config.request_timeout(),
                &config.custom_http_headers,
            )?),
        };

        let core = Arc::new(CacheCore::new(Arc::clone(&config)));
        if let Some(progress) = self.progress {
            core.set_progress_callback(progress);
        }

        let (segment_tx, segment_rx) = mpsc::unbounded_channel::<SegmentRequest>();
        let ctx = LoaderContext {
            core: Arc::clone(&core),
            remote,
            retry: self.retry,
            budget: config.max_cache_size_bytes,
            segments: Some(segment_tx),
        };

        let (registry, tracker) = LoaderRegistry::new(Arc::clone(&core), ctx);
        core.set_active_view(tracker);

        let scheduler_config = self.scheduler.unwrap_or_else(|| SchedulerConfig {
            max_concurrent: config.max_concurrent_downloads,
            batch_size: config.max_concurrent_downloads,
            task_timeout: config.preload_task_timeout(),
            ..SchedulerConfig::default()
        });
        let scheduler =
            PreloadScheduler::spawn(scheduler_config, Arc::clone(&registry), core.stats())?;

        // Segments discovered in HLS playlists become preload tasks of
        // their own.
        let segment_scheduler = scheduler.clone();
        tokio::spawn(async move {
            let mut segment_rx = segment_rx;
            while let Some(segment) = segment_rx.recv().await {
                if let Err(e) = segment_scheduler
                    .add(&segment.url, None, segment.priority)
                    .await
                {
                    debug!(url = %segment.url, error = %e, "segment enqueue failed");
                    break;
                }
            }
        });

        Ok(MediaCache {
            config,
            core,
            registry,
            scheduler,
            shutdown: Mutex::new(None),
        })
    }
}

/// The streaming media cache
///
/// Owns the coordinators and the background maintenance task. One instance
/// assumes exclusive ownership of its cache directory.
pub struct MediaCache {
    config: Arc<CacheConfig>,
    core: Arc<CacheCore>,
    registry: Arc<LoaderRegistry>,
    scheduler: PreloadScheduler,
    shutdown: Mutex<Option<mpsc::Sender<()>>>,
}

impl MediaCache {
    /// Start building a cache
    pub fn builder(config: CacheConfig) -> MediaCacheBuilder {
        MediaCacheBuilder::new(config)
    }

    /// Run startup reconciliation and start background maintenance
    ///
    /// Every data-path operation fails with `NotInitialized` until this
    /// completes.
    pub async fn initialize(&self) -> Result<()> {
        self.core.initialize().await?;
        self.start_maintenance();
        info!(
            directory = %self.config.cache_directory.display(),
            budget = self.config.max_cache_size_bytes,
            "media cache ready"
        );
        Ok(())
    }

    fn start_maintenance(&self) {
        let mut guard = self.shutdown.lock();
        if guard.is_some() {
            warn!("maintenance already running");
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *guard = Some(shutdown_tx);

        let core = Arc::clone(&self.core);
        let budget = self.config.max_cache_size_bytes;
        let flush_every = std::time::Duration::from_millis(self.config.write_flush_interval_ms);
        let cleanup_every = std::time::Duration::from_secs(self.config.cleanup_interval_secs);
        let disk_every =
            std::time::Duration::from_secs(self.config.disk_space_monitor_interval_secs);

        tokio::spawn(async move {
            let mut flush = tokio::time::interval(flush_every);
            let mut cleanup = tokio::time::interval(cleanup_every);
            let mut disk = tokio::time::interval(disk_every);
            let stats_path = core.statistics_path();

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("maintenance stopping");
                        break;
                    }
                    _ = flush.tick() => {
                        if let Err(e) = core.flush_stale(budget).await {
                            warn!(error = %e, "stale flush failed");
                        }
                        core.stats().maybe_persist(&stats_path).await;
                    }
                    _ = cleanup.tick() => {
                        core.run_periodic_cleanup(budget).await;
                    }
                    _ = disk.tick() => {
                        core.check_eviction(budget).await;
                    }
                }
            }
        });
    }

    /// Player-facing cache URL for an origin URL
    pub fn cache_url_for(&self, original_url: &str) -> String {
        cache_url_for(original_url, &self.config.cache_scheme_prefix)
    }

    /// Resource key for an origin URL
    pub fn key_for(&self, original_url: &str) -> ResourceKey {
        self.config.key_for(original_url)
    }

    /// Route a player loading request; returns its id and event stream
    pub async fn handle_player_request(
        &self,
        cache_url: &str,
        offset: i64,
        length: Option<i64>,
        wants_content_info: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<PlayerEvent>)> {
        self.registry
            .handle_player_request(cache_url, offset, length, wants_content_info)
            .await
    }

    /// Cancel a player request by id
    pub fn handle_player_cancel(&self, cache_url: &str, request_id: u64) {
        self.registry.handle_player_cancel(cache_url, request_id);
    }

    /// Whether a key has in-flight work; non-suspending
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.registry.is_active(key)
    }

    /// Enqueue a preload of the first `length` bytes of `url`
    pub async fn preload(
        &self,
        url: &str,
        length: Option<i64>,
        priority: ResourcePriority,
    ) -> Result<TaskId> {
        self.scheduler.add(url, length, priority).await
    }

    /// Cancel a preload task; `true` iff it was not yet terminal
    pub async fn cancel_preload(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id).await
    }

    /// Cancel every non-terminal preload task
    pub fn cancel_all_preloads(&self) {
        self.scheduler.cancel_all();
    }

    /// Pause a queued or running preload task
    pub async fn pause_preload(&self, id: TaskId) -> bool {
        self.scheduler.pause(id).await
    }

    /// Return a paused preload task to the queue
    pub async fn resume_preload(&self, id: TaskId) -> bool {
        self.scheduler.resume(id).await
    }

    /// Scheduler queue, running set, history, and counters
    pub async fn preload_snapshot(&self) -> Result<SchedulerSnapshot> {
        self.scheduler.snapshot().await
    }

    /// Read a byte range directly from the cache; `None` on a miss
    pub async fn read(&self, key: &ResourceKey, range: ByteRange) -> Result<Option<Bytes>> {
        self.core.read(key, range).await
    }

    /// Metadata snapshot for one resource
    pub fn get_metadata(&self, key: &ResourceKey) -> Option<ResourceMetadata> {
        self.core.get_metadata(key)
    }

    /// Content info for one resource, when known
    pub fn get_content_info(&self, key: &ResourceKey) -> Option<ContentInfo> {
        self.core.get_content_info(key)
    }

    /// Metadata snapshots for every cached resource
    pub fn contents(&self) -> Vec<ResourceMetadata> {
        self.core.contents()
    }

    /// Set the eviction priority of a resource
    pub async fn set_priority(&self, key: &ResourceKey, priority: ResourcePriority) -> Result<()> {
        self.core.set_priority(key, priority).await
    }

    /// Set or clear the expiration deadline of a resource
    pub async fn set_expiration_at(
        &self,
        key: &ResourceKey,
        expiration_at: Option<i64>,
    ) -> Result<()> {
        self.core.set_expiration_at(key, expiration_at).await
    }

    /// Register a custom eviction ordering under a stable identifier
    pub fn register_eviction_ordering(&self, id: impl Into<String>, ordering: CustomOrdering) {
        self.core.register_eviction_ordering(id, ordering);
    }

    /// Remove one resource: cancels its loader, deletes file and record
    pub async fn remove(&self, key: &ResourceKey) -> Result<()> {
        self.registry.cancel_key(key);
        self.core.remove(key).await
    }

    /// Remove everything: cancels all loaders, deletes all files and
    /// records
    pub async fn clear_all(&self) -> Result<()> {
        self.cancel_all_preloads();
        self.registry.cancel_all();
        self.core.clear_all().await
    }

    /// Apply a host-delivered memory pressure level
    ///
    /// One sweep per call; no level is latched and no automatic decay
    /// runs.
    pub async fn on_memory_pressure(&self, level: MemoryPressure) {
        self.core.handle_memory_pressure(level).await;
    }

    /// Aggregate statistics snapshot
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.core.stats().snapshot()
    }

    /// Sum of cached bytes across all resources
    pub fn current_size(&self) -> i64 {
        self.core.current_size()
    }

    /// Stop background work, flush buffers, persist statistics
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.registry.cancel_all();
        let shutdown_tx = self.shutdown.lock().take();
        if let Some(shutdown_tx) = shutdown_tx {
            let _ = shutdown_tx.send(()).await;
        }
        if let Err(e) = self.core.flush_all().await {
            warn!(error = %e, "final flush failed");
        }
        self.core.stats().persist(&self.core.statistics_path()).await;
        info!("media cache shut down");
    }
}
