//! Cache coordination: core operations, eviction, statistics

pub mod core;
pub mod eviction;
pub mod stats;

pub use self::core::{ActiveKeys, CacheCore};
pub use eviction::{Candidate, CustomOrdering, EvictionEngine, EvictionStrategy};
pub use stats::{CacheStatistics, StatisticsSnapshot};
