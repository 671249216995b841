//! Configuration for the media cache
//!
//! Configuration is immutable once a cache is built; reconfiguration means
//! building a new instance. Supports TOML files with sensible defaults and
//! environment variable overrides for the common knobs.

use crate::cache::eviction::EvictionStrategy;
use crate::types::KeyFunction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Root directory for data and metadata files
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    /// Global byte budget enforced by eviction
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size_bytes: u64,

    /// Extension of per-resource data files
    #[serde(default = "default_cache_file_extension")]
    pub cache_file_extension: String,

    /// Extension of per-resource metadata records
    #[serde(default = "default_metadata_file_extension")]
    pub metadata_file_extension: String,

    /// Prefix prepended to the original URL's scheme to form the
    /// player-facing cache URL
    #[serde(default = "default_cache_scheme_prefix")]
    pub cache_scheme_prefix: String,

    /// Per-task timeout for preload downloads, in seconds
    #[serde(default = "default_preload_task_timeout_secs")]
    pub preload_task_timeout_secs: u64,

    /// Per-request timeout for origin fetches, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Advisory flag forwarded to the network layer; the HTTP client here
    /// has no interface binding, so hosts that care must honor it themselves
    #[serde(default = "default_true")]
    pub allows_cellular_access: bool,

    /// Maximum concurrently running preload downloads
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Expiration applied to new entries when set, in seconds
    #[serde(default)]
    pub default_expiration_interval_secs: Option<u64>,

    /// Cadence of the scheduled cleanup (expired sweep + budget pass),
    /// in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Cadence of the disk-space floor check, in seconds
    #[serde(default = "default_disk_space_monitor_interval_secs")]
    pub disk_space_monitor_interval_secs: u64,

    /// Ordering used when the byte budget or disk floor is exceeded
    #[serde(default)]
    pub cleanup_strategy: EvictionStrategy,

    /// Minimum free bytes to keep available on the cache volume
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,

    /// Interval at which buffered write chunks are committed to disk,
    /// in milliseconds
    #[serde(default = "default_write_flush_interval_ms")]
    pub write_flush_interval_ms: u64,

    /// Extra headers attached to every origin request
    #[serde(default)]
    pub custom_http_headers: HashMap<String, String>,

    /// Custom URL-to-key derivation; defaults to SHA-256 hex of the URL
    #[serde(skip)]
    pub key_function: Option<KeyFunction>,
}

// Default value functions
fn default_cache_directory() -> PathBuf {
    PathBuf::from("bmcache")
}
fn default_max_cache_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}
fn default_cache_file_extension() -> String {
    "bmv".to_string()
}
fn default_metadata_file_extension() -> String {
    "bmm".to_string()
}
fn default_cache_scheme_prefix() -> String {
    "bmcache-".to_string()
}
fn default_preload_task_timeout_secs() -> u64 {
    300
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_concurrent_downloads() -> usize {
    3
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_disk_space_monitor_interval_secs() -> u64 {
    300
}
fn default_min_free_disk_bytes() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}
fn default_write_flush_interval_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_directory: default_cache_directory(),
            max_cache_size_bytes: default_max_cache_size(),
            cache_file_extension: default_cache_file_extension(),
            metadata_file_extension: default_metadata_file_extension(),
            cache_scheme_prefix: default_cache_scheme_prefix(),
            preload_task_timeout_secs: default_preload_task_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            allows_cellular_access: true,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            custom_http_headers: HashMap::new(),
            default_expiration_interval_secs: None,
            cleanup_interval_secs: default_cleanup_interval_secs(),
            disk_space_monitor_interval_secs: default_disk_space_monitor_interval_secs(),
            cleanup_strategy: EvictionStrategy::default(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
            write_flush_interval_ms: default_write_flush_interval_ms(),
            key_function: None,
        }
    }
}

impl std::fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheConfig")
            .field("cache_directory", &self.cache_directory)
            .field("max_cache_size_bytes", &self.max_cache_size_bytes)
            .field("cache_file_extension", &self.cache_file_extension)
            .field("metadata_file_extension", &self.metadata_file_extension)
            .field("cache_scheme_prefix", &self.cache_scheme_prefix)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("cleanup_strategy", &self.cleanup_strategy)
            .field("min_free_disk_bytes", &self.min_free_disk_bytes)
            .field(
                "key_function",
                &self.key_function.as_ref().map(|_| "custom"),
            )
            .finish_non_exhaustive()
    }
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, crate::error::CacheError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::CacheError::Config(format!("failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            crate::error::CacheError::Config(format!("failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration from a TOML file with environment overrides applied
    pub fn from_file_with_env(path: &str) -> Result<Self, crate::error::CacheError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides for the common knobs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("BMCACHE_DIR") {
            self.cache_directory = PathBuf::from(dir);
        }
        if let Ok(size) = std::env::var("BMCACHE_MAX_CACHE_SIZE") {
            if let Ok(s) = size.parse() {
                self.max_cache_size_bytes = s;
            }
        }
        if let Ok(n) = std::env::var("BMCACHE_MAX_CONCURRENT") {
            if let Ok(n) = n.parse() {
                self.max_concurrent_downloads = n;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), crate::error::CacheError> {
        if self.cache_directory.as_os_str().is_empty() {
            return Err(crate::error::CacheError::Config(
                "cache directory cannot be empty".to_string(),
            ));
        }
        if self.max_cache_size_bytes == 0 {
            return Err(crate::error::CacheError::Config(
                "max cache size must be > 0".to_string(),
            ));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(crate::error::CacheError::Config(
                "max concurrent downloads must be >= 1".to_string(),
            ));
        }
        if self.cache_scheme_prefix.is_empty() {
            return Err(crate::error::CacheError::Config(
                "cache scheme prefix cannot be empty".to_string(),
            ));
        }
        if self.cache_file_extension.is_empty() || self.metadata_file_extension.is_empty() {
            return Err(crate::error::CacheError::Config(
                "file extensions cannot be empty".to_string(),
            ));
        }
        if self.write_flush_interval_ms == 0 {
            return Err(crate::error::CacheError::Config(
                "write flush interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding metadata records
    pub fn metadata_directory(&self) -> PathBuf {
        self.cache_directory.join("Metadata")
    }

    /// Data file path for a key
    pub fn data_path(&self, key: &crate::types::ResourceKey) -> PathBuf {
        self.cache_directory
            .join(format!("{}.{}", key, self.cache_file_extension))
    }

    /// Metadata record path for a key
    pub fn metadata_path(&self, key: &crate::types::ResourceKey) -> PathBuf {
        self.metadata_directory()
            .join(format!("{}.{}", key, self.metadata_file_extension))
    }

    /// Per-request timeout as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Per-preload-task timeout as a `Duration`
    pub fn preload_task_timeout(&self) -> Duration {
        Duration::from_secs(self.preload_task_timeout_secs)
    }

    /// Derive the resource key for a URL, honoring a custom key function
    pub fn key_for(&self, url: &str) -> crate::types::ResourceKey {
        match &self.key_function {
            Some(f) => crate::types::ResourceKey::from_string(&f(url))
                .unwrap_or_else(|_| crate::types::resource_key_for(url)),
            None => crate::types::resource_key_for(url),
        }
    }
}
