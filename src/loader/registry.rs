//! Loader registry: demultiplexes requests to per-resource loaders
//!
//! The registry owns the key-to-loader map; all mutations go through one
//! lock. Activity is tracked in a separate shared structure so the cache
//! core can ask "is this key live?" without holding a reference to the
//! registry itself: the core owns a view of the tracker, the registry owns
//! the core, and no cycle of owning handles exists.

use crate::cache::{ActiveKeys, CacheCore};
use crate::error::{CacheError, Result};
use crate::loader::loader::{Loader, LoaderContext, PreloadTicket};
use crate::loader::request::{PlayerEvent, PlayerRequest};
use crate::types::{original_url_for, ResourceKey, ResourcePriority};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Shared view of which keys have live attachments
///
/// Backed by the loaders' attachment counters, so `is_active` is one map
/// probe plus an atomic load: safe to call from a player-thread callback.
#[derive(Default)]
pub struct ActivityTracker {
    loaders: Mutex<HashMap<ResourceKey, Loader>>,
}

impl ActiveKeys for ActivityTracker {
    fn is_active(&self, key: &ResourceKey) -> bool {
        self.loaders
            .lock()
            .get(key)
            .map(|l| l.attachment_count() > 0)
            .unwrap_or(false)
    }
}

/// Routes player requests and preloads to per-resource loaders
pub struct LoaderRegistry {
    core: Arc<CacheCore>,
    ctx: LoaderContext,
    tracker: Arc<ActivityTracker>,
}

impl LoaderRegistry {
    /// Build a registry over the given core and loader context
    ///
    /// The returned tracker should be handed to
    /// [`CacheCore::set_active_view`].
    pub fn new(core: Arc<CacheCore>, ctx: LoaderContext) -> (Arc<Self>, Arc<ActivityTracker>) {
        let tracker = Arc::new(ActivityTracker::default());
        let registry = Arc::new(Self {
            core,
            ctx,
            tracker: Arc::clone(&tracker),
        });
        (registry, tracker)
    }

    /// Resource key for an origin URL
    pub fn key_for(&self, url: &str) -> ResourceKey {
        self.core.config().key_for(url)
    }

    /// Resolve a player-facing cache URL to the origin URL
    pub fn resolve_original_url(&self, cache_url: &str) -> Result<String> {
        original_url_for(cache_url, &self.core.config().cache_scheme_prefix)
            .map(str::to_string)
            .ok_or_else(|| {
                CacheError::Config(format!(
                    "URL {} does not carry the cache scheme prefix",
                    cache_url
                ))
            })
    }

    /// Loader for `key`, created on first use
    async fn ensure_loader(&self, key: &ResourceKey, url: &str) -> Result<Loader> {
        self.core
            .ensure_resource(key, url, ResourcePriority::Normal)
            .await?;

        let mut loaders = self.tracker.loaders.lock();
        if let Some(existing) = loaders.get(key) {
            return Ok(existing.clone());
        }
        debug!(key = %key, url, "spawning loader");
        let loader = Loader::spawn(key.clone(), url.to_string(), self.ctx.clone());
        loaders.insert(key.clone(), loader.clone());
        Ok(loader)
    }

    /// Route a player request for a cache-scheme URL
    ///
    /// Returns the request id (for cancellation) and the event stream.
    pub async fn handle_player_request(
        &self,
        cache_url: &str,
        offset: i64,
        length: Option<i64>,
        wants_content_info: bool,
    ) -> Result<(u64, mpsc::UnboundedReceiver<PlayerEvent>)> {
        let original_url = self.resolve_original_url(cache_url)?;
        let key = self.core.config().key_for(&original_url);
        let loader = self.ensure_loader(&key, &original_url).await?;

        let (request, events) = PlayerRequest::new(offset, length, wants_content_info);
        let id = request.id;
        loader.attach(request);
        Ok((id, events))
    }

    /// Cancel one player request; removes the loader when nothing else is
    /// attached to it
    pub fn handle_player_cancel(&self, cache_url: &str, request_id: u64) {
        let Ok(original_url) = self.resolve_original_url(cache_url) else {
            return;
        };
        let key = self.core.config().key_for(&original_url);

        let mut loaders = self.tracker.loaders.lock();
        let now_idle = match loaders.get(&key) {
            Some(loader) => {
                loader.detach(request_id);
                // A lone request being detached leaves the loader idle; a
                // concurrent attach is serialized behind this lock.
                loader.attachment_count() <= 1
            }
            None => false,
        };
        if now_idle {
            if let Some(loader) = loaders.remove(&key) {
                loader.cancel();
                debug!(key = %key, "idle loader removed");
            }
        }
    }

    /// Attach a preload for the first `length` bytes of `url`
    pub async fn preload(
        &self,
        url: &str,
        length: Option<i64>,
        priority: ResourcePriority,
    ) -> Result<(ResourceKey, PreloadTicket)> {
        let key = self.core.config().key_for(url);
        self.core.ensure_resource(&key, url, priority).await?;
        let loader = self.ensure_loader(&key, url).await?;
        Ok((key.clone(), loader.preload(length, priority)))
    }

    /// Cancel one preload attachment on `key`'s loader
    pub fn cancel_preload(&self, key: &ResourceKey, preload_id: u64) {
        if let Some(loader) = self.tracker.loaders.lock().get(key) {
            loader.cancel_preload(preload_id);
        }
    }

    /// Whether `key` has a loader with live attachments
    pub fn is_active(&self, key: &ResourceKey) -> bool {
        self.tracker.is_active(key)
    }

    /// Cancel and remove the loader for `key`, if any
    ///
    /// Called before a resource is destroyed so in-flight work stops.
    pub fn cancel_key(&self, key: &ResourceKey) {
        if let Some(loader) = self.tracker.loaders.lock().remove(key) {
            loader.cancel();
            debug!(key = %key, "loader cancelled");
        }
    }

    /// Cancel and remove every loader
    pub fn cancel_all(&self) {
        let mut loaders = self.tracker.loaders.lock();
        for (_, loader) in loaders.drain() {
            loader.cancel();
        }
    }

    /// Number of live loaders
    pub fn loader_count(&self) -> usize {
        self.tracker.loaders.lock().len()
    }
}
