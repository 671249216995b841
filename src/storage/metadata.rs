//! Per-resource metadata and its durable record format

use crate::ranges::RangeSet;
use crate::types::{now_millis, ContentInfo, ResourceKey, ResourcePriority};
use serde::{Deserialize, Serialize};

/// Current version of the persisted metadata record
pub const METADATA_RECORD_VERSION: u32 = 1;

/// Everything the cache knows about one resource
///
/// Mutated only by the cache core; observed elsewhere through snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceMetadata {
    /// Stable key derived from the URL
    pub key: ResourceKey,

    /// URL used for origin fetches
    pub original_url: String,

    /// MIME type learned from the first successful origin response
    pub content_type: Option<String>,

    /// Total resource length, absent until the first response
    pub total_length: Option<i64>,

    /// Whether the origin serves byte ranges
    pub supports_range: bool,

    /// Byte intervals present on disk
    pub ranges: RangeSet,

    /// Sum of range lengths
    pub cached_bytes: i64,

    /// Whether `ranges` covers exactly `[0, total_length - 1]` and the file
    /// has been synced
    pub is_complete: bool,

    /// Unix-millis timestamp of the last read or write
    pub last_access: i64,

    /// Read hits served for this resource
    pub access_count: u64,

    /// Eviction priority
    pub priority: ResourcePriority,

    /// Optional wall-clock expiration deadline, unix millis
    pub expiration_at: Option<i64>,
}

impl ResourceMetadata {
    /// Fresh metadata for a resource seen for the first time
    pub fn new(key: ResourceKey, original_url: String) -> Self {
        Self {
            key,
            original_url,
            content_type: None,
            total_length: None,
            supports_range: false,
            ranges: RangeSet::new(),
            cached_bytes: 0,
            is_complete: false,
            last_access: now_millis(),
            access_count: 0,
            priority: ResourcePriority::Normal,
            expiration_at: None,
        }
    }

    /// Refresh the last-access timestamp
    pub fn touch(&mut self) {
        self.last_access = now_millis();
    }

    /// Whether the expiration deadline has passed
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_at.map(|at| at < now).unwrap_or(false)
    }

    /// Content description for the player's info sub-request
    ///
    /// `None` until the total length has been learned.
    pub fn content_info(&self) -> Option<ContentInfo> {
        self.total_length.map(|len| ContentInfo {
            content_type: self.content_type.clone(),
            total_length: Some(len),
            supports_range: self.supports_range,
        })
    }

    /// Recompute `cached_bytes` and `is_complete` from the range set
    ///
    /// Completion additionally requires the caller to have verified and
    /// synced the file; this only clears a completion claim the ranges no
    /// longer support.
    pub fn reconcile_derived(&mut self) {
        self.cached_bytes = self.ranges.total_len();
        if self.is_complete {
            self.is_complete = self
                .total_length
                .map(|len| self.ranges.covers_exactly(len))
                .unwrap_or(false);
        }
    }
}

/// Durable on-disk record for one resource
///
/// Versioned and self-describing; unknown fields in newer records are
/// skipped on decode, absent fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    /// Record format version
    #[serde(default)]
    pub version: u32,

    /// Resource key
    pub key: String,

    /// Origin URL
    pub original_url: String,

    /// MIME type
    #[serde(default)]
    pub content_type: Option<String>,

    /// Total resource length
    #[serde(default)]
    pub total_length: Option<i64>,

    /// Range support flag
    #[serde(default)]
    pub supports_range: bool,

    /// Cached intervals as `(start, end)` pairs
    #[serde(default)]
    pub ranges: Vec<(i64, i64)>,

    /// Sum of interval lengths
    #[serde(default)]
    pub cached_bytes: i64,

    /// Completion flag
    #[serde(default)]
    pub is_complete: bool,

    /// Last access, unix millis
    #[serde(default)]
    pub last_access: i64,

    /// Read hit counter
    #[serde(default)]
    pub access_count: u64,

    /// Eviction priority
    #[serde(default)]
    pub priority: ResourcePriority,

    /// Expiration deadline, unix millis
    #[serde(default)]
    pub expiration_at: Option<i64>,
}

impl From<&ResourceMetadata> for MetadataRecord {
    fn from(m: &ResourceMetadata) -> Self {
        Self {
            version: METADATA_RECORD_VERSION,
            key: m.key.as_str().to_string(),
            original_url: m.original_url.clone(),
            content_type: m.content_type.clone(),
            total_length: m.total_length,
            supports_range: m.supports_range,
            ranges: m.ranges.to_pairs(),
            cached_bytes: m.cached_bytes,
            is_complete: m.is_complete,
            last_access: m.last_access,
            access_count: m.access_count,
            priority: m.priority,
            expiration_at: m.expiration_at,
        }
    }
}

impl MetadataRecord {
    /// Rebuild in-memory metadata from a decoded record
    ///
    /// Ranges are re-merged (the merge is idempotent for well-formed
    /// records) and the derived fields recomputed, so a record hand-edited
    /// or truncated by a crash still yields a consistent view.
    pub fn into_metadata(self) -> Result<ResourceMetadata, crate::error::CacheError> {
        let key = ResourceKey::from_string(&self.key)?;
        let ranges = RangeSet::from_pairs(&self.ranges);
        let mut metadata = ResourceMetadata {
            key,
            original_url: self.original_url,
            content_type: self.content_type,
            total_length: self.total_length,
            supports_range: self.supports_range,
            cached_bytes: ranges.total_len(),
            ranges,
            is_complete: self.is_complete,
            last_access: self.last_access,
            access_count: self.access_count,
            priority: self.priority,
            expiration_at: self.expiration_at,
        };
        metadata.reconcile_derived();
        Ok(metadata)
    }
}
