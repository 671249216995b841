//! Core value types shared across the cache
//!
//! # Key Types
//!
//! - **`ResourceKey`**: stable identifier for a cached resource, derived from
//!   its URL by a SHA-256 digest rendered as lowercase hex
//! - **`ResourcePriority`**: eviction priority, `Low < Normal < High < Permanent`
//! - **`ContentInfo`**: what the player needs to know before requesting data
//! - **`MemoryPressure`**: host-delivered pressure levels
//! - **`ProgressUpdate`**: payload of the download progress callback
//!
//! # Example
//!
//! ```rust
//! use bmcache::types::{resource_key_for, ResourcePriority};
//!
//! let key = resource_key_for("https://example.com/video.mp4");
//! assert_eq!(key.as_str().len(), 64);
//! assert!(ResourcePriority::Normal < ResourcePriority::Permanent);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for a cached resource
///
/// Derived from the canonical request URL by a SHA-256 digest rendered as
/// 64 lowercase hex characters. Identity is exact string equality, and the
/// key doubles as the on-disk file stem, so it must never contain path
/// separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Wrap an already-derived key string
    ///
    /// Rejects strings that could escape the cache directory when used as a
    /// file stem.
    pub fn from_string(s: &str) -> Result<Self, crate::error::CacheError> {
        if s.is_empty() || s.contains('/') || s.contains('\\') || s.contains("..") {
            return Err(crate::error::CacheError::Config(format!(
                "invalid resource key: {:?}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the default resource key for a URL: SHA-256 of the URL string,
/// lowercase hex
pub fn resource_key_for(url: &str) -> ResourceKey {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", byte);
    }
    ResourceKey(hex)
}

/// Eviction priority of a cached resource
///
/// Total order `Low < Normal < High < Permanent`. `Permanent` entries are
/// never chosen by the eviction engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePriority {
    /// First to go under pressure
    Low,
    /// Standard priority
    #[default]
    Normal,
    /// Kept longer than normal entries
    High,
    /// Exempt from eviction
    Permanent,
}

impl ResourcePriority {
    /// One level up, saturating at the top non-permanent level
    ///
    /// Dynamic aging never promotes a task into `Permanent`; that level is
    /// reserved for explicit pinning.
    pub fn bumped(self) -> Self {
        match self {
            ResourcePriority::Low => ResourcePriority::Normal,
            ResourcePriority::Normal => ResourcePriority::High,
            other => other,
        }
    }
}

/// Host-delivered memory pressure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// No action required
    Low,
    /// Evict all low-priority entries
    Medium,
    /// Additionally evict incomplete normal-priority entries
    High,
    /// Evict everything except permanent or active entries
    Critical,
}

/// Content description learned from the first successful origin response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentInfo {
    /// MIME type, if the origin sent one
    pub content_type: Option<String>,

    /// Total resource length in bytes, from `Content-Length` or the
    /// denominator of `Content-Range`
    pub total_length: Option<i64>,

    /// Whether the origin serves byte ranges
    pub supports_range: bool,
}

/// Payload of the download progress callback
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Resource key
    pub key: ResourceKey,
    /// Original origin URL
    pub url: String,
    /// Fraction cached, `0.0 ..= 1.0`
    pub percent: f64,
    /// Bytes currently cached
    pub cached_bytes: i64,
    /// Total resource length
    pub total_bytes: i64,
}

/// Progress observer invoked during writes once the total length is known
pub type ProgressCallback = std::sync::Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Custom URL-to-key derivation supplied through configuration
pub type KeyFunction = std::sync::Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Map an original URL to its player-facing cache URL by prepending the
/// scheme prefix
///
/// `https://host/a.mp4` with prefix `bmcache-` becomes
/// `bmcache-https://host/a.mp4`. The mapping is bijective: stripping the
/// prefix yields the origin URL exactly.
pub fn cache_url_for(original_url: &str, scheme_prefix: &str) -> String {
    format!("{}{}", scheme_prefix, original_url)
}

/// Recover the original URL from a player-facing cache URL
///
/// Returns `None` if the URL does not carry the prefix.
pub fn original_url_for<'a>(cache_url: &'a str, scheme_prefix: &str) -> Option<&'a str> {
    cache_url.strip_prefix(scheme_prefix)
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_sha256_hex() {
        let key = resource_key_for("https://example.com/video.mp4");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls
        assert_eq!(key, resource_key_for("https://example.com/video.mp4"));
        // Distinct URLs yield distinct keys
        assert_ne!(key, resource_key_for("https://example.com/other.mp4"));
    }

    #[test]
    fn test_key_rejects_path_traversal() {
        assert!(ResourceKey::from_string("../escape").is_err());
        assert!(ResourceKey::from_string("a/b").is_err());
        assert!(ResourceKey::from_string("").is_err());
        assert!(ResourceKey::from_string("abc123").is_ok());
    }

    #[test]
    fn test_priority_order() {
        assert!(ResourcePriority::Low < ResourcePriority::Normal);
        assert!(ResourcePriority::Normal < ResourcePriority::High);
        assert!(ResourcePriority::High < ResourcePriority::Permanent);
    }

    #[test]
    fn test_priority_bump_never_reaches_permanent() {
        assert_eq!(ResourcePriority::Low.bumped(), ResourcePriority::Normal);
        assert_eq!(ResourcePriority::Normal.bumped(), ResourcePriority::High);
        assert_eq!(ResourcePriority::High.bumped(), ResourcePriority::High);
        assert_eq!(
            ResourcePriority::Permanent.bumped(),
            ResourcePriority::Permanent
        );
    }

    #[test]
    fn test_cache_url_round_trip() {
        let original = "https://cdn.example.com/stream/seg1.ts?token=x";
        let cached = cache_url_for(original, "bmcache-");
        assert_eq!(cached, "bmcache-https://cdn.example.com/stream/seg1.ts?token=x");
        assert_eq!(original_url_for(&cached, "bmcache-"), Some(original));
        assert_eq!(original_url_for("https://plain", "bmcache-"), None);
    }
}
