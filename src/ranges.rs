//! Byte range arithmetic for cached resources
//!
//! A [`RangeSet`] records which byte intervals of a resource are present on
//! disk. It is kept sorted, disjoint, and non-touching: intervals `[a, b]`
//! and `[b+1, c]` are always merged into `[a, c]`, so membership and gap
//! queries are a binary search away.
//!
//! # Example
//!
//! ```rust
//! use bmcache::ranges::{ByteRange, RangeSet};
//!
//! let mut set = RangeSet::new();
//! set.add(ByteRange::new(0, 99).unwrap());
//! set.add(ByteRange::new(100, 199).unwrap()); // adjacent: coalesces
//! assert_eq!(set.len(), 1);
//! assert!(set.contains(ByteRange::new(50, 150).unwrap()));
//! assert_eq!(set.total_len(), 200);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed interval of byte offsets `[start, end]` with `0 <= start <= end`
///
/// Zero-length ranges do not exist: the constructor rejects `start > end`,
/// and a single byte is expressed as `[n, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte offset (inclusive)
    pub start: i64,

    /// Last byte offset (inclusive)
    pub end: i64,
}

impl ByteRange {
    /// Create a range with validation
    ///
    /// Returns an error when `start` is negative or `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self, crate::error::CacheError> {
        if start < 0 || start > end {
            return Err(crate::error::CacheError::Config(format!(
                "invalid byte range [{}, {}]",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range covering `len` bytes starting at `offset`
    ///
    /// Rejects non-positive lengths and negative offsets.
    pub fn with_len(offset: i64, len: i64) -> Result<Self, crate::error::CacheError> {
        if len <= 0 {
            return Err(crate::error::CacheError::Config(format!(
                "invalid byte range length {}",
                len
            )));
        }
        Self::new(offset, offset + len - 1)
    }

    /// Number of bytes covered
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Whether `offset` falls inside this range
    pub fn contains_offset(&self, offset: i64) -> bool {
        offset >= self.start && offset <= self.end
    }

    /// Whether this range wholly covers `other`
    pub fn covers(&self, other: ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the two ranges share at least one byte
    pub fn overlaps(&self, other: ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Whether the two ranges overlap or touch (gap of zero integers)
    fn touches(&self, other: ByteRange) -> bool {
        // [a, b] touches [b+1, c]; saturating to avoid overflow at i64::MAX
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }

    /// Intersection with `other`, if any
    pub fn intersect(&self, other: ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(ByteRange { start, end })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Sorted set of disjoint, non-touching byte ranges
///
/// The invariant maintained by every mutation: spans are ordered by start,
/// pairwise disjoint, and separated by at least one uncovered byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    spans: Vec<ByteRange>,
}

impl RangeSet {
    /// Empty set
    pub fn new() -> Self {
        Self { spans: Vec::new() }
    }

    /// Build a set from an arbitrary list of ranges by sorting and coalescing
    ///
    /// Used on durable reload, where persisted pairs carry no ordering
    /// guarantee. Idempotent: merging an already-merged list is a no-op.
    pub fn merge(mut ranges: Vec<ByteRange>) -> Self {
        ranges.sort_by_key(|r| r.start);
        let mut spans: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match spans.last_mut() {
                Some(last) if last.touches(r) => {
                    last.end = last.end.max(r.end);
                }
                _ => spans.push(r),
            }
        }
        Self { spans }
    }

    /// Insert a range, coalescing with overlapping and adjacent neighbors
    pub fn add(&mut self, range: ByteRange) {
        // Position of the first span that could touch the new range.
        let idx = self
            .spans
            .partition_point(|s| s.end.saturating_add(1) < range.start);

        let mut merged = range;
        let mut remove_until = idx;
        while remove_until < self.spans.len() && self.spans[remove_until].touches(merged) {
            merged.start = merged.start.min(self.spans[remove_until].start);
            merged.end = merged.end.max(self.spans[remove_until].end);
            remove_until += 1;
        }

        self.spans.splice(idx..remove_until, std::iter::once(merged));
    }

    /// Whether some single span wholly covers `range`
    pub fn contains(&self, range: ByteRange) -> bool {
        let idx = self.spans.partition_point(|s| s.end < range.start);
        self.spans
            .get(idx)
            .map(|s| s.covers(range))
            .unwrap_or(false)
    }

    /// Ordered iterator over spans intersecting `range`
    ///
    /// Borrows the backing storage; no per-element allocation.
    pub fn overlapping(&self, range: ByteRange) -> impl Iterator<Item = &ByteRange> {
        let idx = self.spans.partition_point(|s| s.end < range.start);
        self.spans[idx..]
            .iter()
            .take_while(move |s| s.start <= range.end)
    }

    /// Sum of span lengths
    pub fn total_len(&self) -> i64 {
        self.spans.iter().map(|s| s.len()).sum()
    }

    /// First uncovered offset at or after `offset`
    ///
    /// This is where a resuming fetch starts. Returns `offset` itself when
    /// it is not covered.
    pub fn first_missing_at(&self, offset: i64) -> i64 {
        let mut probe = offset;
        let idx = self.spans.partition_point(|s| s.end < probe);
        for span in &self.spans[idx..] {
            if span.contains_offset(probe) {
                probe = span.end + 1;
            } else {
                break;
            }
        }
        probe
    }

    /// Whether the set is exactly `{[0, total_length - 1]}`
    pub fn covers_exactly(&self, total_length: i64) -> bool {
        total_length > 0
            && self.spans.len() == 1
            && self.spans[0].start == 0
            && self.spans[0].end == total_length - 1
    }

    /// Number of spans
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether the set has no spans
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Iterator over spans in order
    pub fn iter(&self) -> std::slice::Iter<'_, ByteRange> {
        self.spans.iter()
    }

    /// Spans as `(start, end)` pairs for the persisted record
    pub fn to_pairs(&self) -> Vec<(i64, i64)> {
        self.spans.iter().map(|s| (s.start, s.end)).collect()
    }

    /// Rebuild from persisted `(start, end)` pairs, dropping malformed ones
    pub fn from_pairs(pairs: &[(i64, i64)]) -> Self {
        let ranges = pairs
            .iter()
            .filter_map(|&(start, end)| ByteRange::new(start, end).ok())
            .collect();
        Self::merge(ranges)
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", span)?;
        }
        write!(f, "}}")
    }
}
