//! Eviction strategies and the removal planner
//!
//! The engine never touches disk itself: the cache core hands it a snapshot
//! of eligible candidates and executes the plan it returns. A plan is a
//! single pass over one ordering; the engine does not rescan after each
//! removal, so an unsatisfiable budget is reported by a short plan, not an
//! error.

use crate::types::{MemoryPressure, ResourceKey, ResourcePriority};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Ordering applied to eviction candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionStrategy {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first
    Lfu,
    /// Oldest first; `last_access` stands in for creation order
    Fifo,
    /// Only entries past their expiration deadline, oldest access first
    ExpiredOnly,
    /// Lowest priority first, ties broken by least recent access
    Priority,
    /// Caller-supplied ordering registered under a stable identifier
    Custom(String),
}

/// Snapshot of one entry's eviction-relevant fields
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Resource key
    pub key: ResourceKey,
    /// Bytes freed by removing this entry
    pub cached_bytes: i64,
    /// Last read or write, unix millis
    pub last_access: i64,
    /// Read hit count
    pub access_count: u64,
    /// Eviction priority
    pub priority: ResourcePriority,
    /// Expiration deadline, unix millis
    pub expiration_at: Option<i64>,
    /// Whether the entry covers its full length
    pub is_complete: bool,
}

impl Candidate {
    fn is_expired(&self, now: i64) -> bool {
        self.expiration_at.map(|at| at < now).unwrap_or(false)
    }
}

/// Caller-supplied total order over candidates
pub type CustomOrdering = Arc<dyn Fn(&Candidate, &Candidate) -> Ordering + Send + Sync>;

/// Plans removals to satisfy the byte budget and disk floor
pub struct EvictionEngine {
    strategy: EvictionStrategy,
    custom: RwLock<HashMap<String, CustomOrdering>>,
}

impl EvictionEngine {
    /// Engine with the configured default strategy
    pub fn new(strategy: EvictionStrategy) -> Self {
        Self {
            strategy,
            custom: RwLock::new(HashMap::new()),
        }
    }

    /// Configured strategy
    pub fn strategy(&self) -> &EvictionStrategy {
        &self.strategy
    }

    /// Register a custom ordering under a stable identifier
    ///
    /// The identifier is what persisted configuration names, so it must
    /// stay stable across restarts.
    pub fn register_custom(&self, id: impl Into<String>, ordering: CustomOrdering) {
        self.custom.write().insert(id.into(), ordering);
    }

    /// Order candidates according to the active strategy
    ///
    /// `ExpiredOnly` filters to expired entries; an unknown custom
    /// identifier falls back to LRU so eviction still makes progress.
    fn order(&self, mut candidates: Vec<Candidate>, now: i64) -> Vec<Candidate> {
        match &self.strategy {
            EvictionStrategy::Lru | EvictionStrategy::Fifo => {
                candidates.sort_by_key(|c| c.last_access);
            }
            EvictionStrategy::Lfu => {
                candidates.sort_by_key(|c| (c.access_count, c.last_access));
            }
            EvictionStrategy::ExpiredOnly => {
                candidates.retain(|c| c.is_expired(now));
                candidates.sort_by_key(|c| c.last_access);
            }
            EvictionStrategy::Priority => {
                candidates.sort_by_key(|c| (c.priority, c.last_access));
            }
            EvictionStrategy::Custom(id) => {
                let ordering = self.custom.read().get(id).cloned();
                match ordering {
                    Some(ordering) => candidates.sort_by(|a, b| ordering(a, b)),
                    None => {
                        debug!(id = %id, "unknown custom eviction ordering, falling back to LRU");
                        candidates.sort_by_key(|c| c.last_access);
                    }
                }
            }
        }
        candidates
    }

    /// One-pass removal plan freeing at least `needed_bytes`
    ///
    /// Candidates must already exclude permanent, active, and
    /// flush-in-flight entries. The plan may fall short when the eligible
    /// set is too small; the caller logs and retries on the next event.
    pub fn plan(&self, candidates: Vec<Candidate>, needed_bytes: i64, now: i64) -> Vec<ResourceKey> {
        if needed_bytes <= 0 {
            return Vec::new();
        }
        let ordered = self.order(candidates, now);

        let mut freed = 0i64;
        let mut plan = Vec::new();
        for candidate in ordered {
            if freed >= needed_bytes {
                break;
            }
            freed += candidate.cached_bytes;
            plan.push(candidate.key);
        }
        plan
    }

    /// Every expired candidate, regardless of strategy
    ///
    /// The expired sweep runs before the budget pass on each periodic
    /// cleanup.
    pub fn expired(&self, candidates: &[Candidate], now: i64) -> Vec<ResourceKey> {
        candidates
            .iter()
            .filter(|c| c.is_expired(now))
            .map(|c| c.key.clone())
            .collect()
    }

    /// Removal plan for a host-delivered memory pressure level
    ///
    /// Candidates must already exclude permanent and active entries.
    pub fn pressure_plan(
        &self,
        candidates: &[Candidate],
        level: MemoryPressure,
    ) -> Vec<ResourceKey> {
        candidates
            .iter()
            .filter(|c| match level {
                MemoryPressure::Low => false,
                MemoryPressure::Medium => c.priority == ResourcePriority::Low,
                MemoryPressure::High => {
                    c.priority == ResourcePriority::Low
                        || (c.priority == ResourcePriority::Normal && !c.is_complete)
                }
                MemoryPressure::Critical => true,
            })
            .map(|c| c.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::resource_key_for;

    fn candidate(url: &str, bytes: i64, last_access: i64) -> Candidate {
        Candidate {
            key: resource_key_for(url),
            cached_bytes: bytes,
            last_access,
            access_count: 0,
            priority: ResourcePriority::Normal,
            expiration_at: None,
            is_complete: false,
        }
    }

    #[test]
    fn test_lru_evicts_least_recent_first() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        let a = candidate("a", 500, 100);
        let b = candidate("b", 500, 200);
        let c = candidate("c", 500, 300);
        let a_key = a.key.clone();

        let plan = engine.plan(vec![c, a, b], 500, 0);
        assert_eq!(plan, vec![a_key]);
    }

    #[test]
    fn test_plan_takes_until_satisfied() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        let plan = engine.plan(
            vec![
                candidate("a", 500, 1),
                candidate("b", 500, 2),
                candidate("c", 500, 3),
            ],
            800,
            0,
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_empty_when_nothing_needed() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        assert!(engine.plan(vec![candidate("a", 500, 1)], 0, 0).is_empty());
    }

    #[test]
    fn test_plan_exhausts_without_error() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        let plan = engine.plan(vec![candidate("a", 100, 1)], 10_000, 0);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_lfu_orders_by_access_count() {
        let engine = EvictionEngine::new(EvictionStrategy::Lfu);
        let mut hot = candidate("hot", 100, 1);
        hot.access_count = 50;
        let cold = candidate("cold", 100, 2);
        let cold_key = cold.key.clone();

        let plan = engine.plan(vec![hot, cold], 100, 0);
        assert_eq!(plan, vec![cold_key]);
    }

    #[test]
    fn test_priority_strategy_breaks_ties_by_access() {
        let engine = EvictionEngine::new(EvictionStrategy::Priority);
        let mut high = candidate("high", 100, 1);
        high.priority = ResourcePriority::High;
        let low_old = candidate("low-old", 100, 5);
        let low_new = {
            let mut c = candidate("low-new", 100, 9);
            c.priority = ResourcePriority::Low;
            c
        };
        let mut low_old = low_old;
        low_old.priority = ResourcePriority::Low;
        let expect = low_old.key.clone();

        let plan = engine.plan(vec![high, low_new, low_old], 100, 0);
        assert_eq!(plan, vec![expect]);
    }

    #[test]
    fn test_expired_only_ignores_fresh_entries() {
        let engine = EvictionEngine::new(EvictionStrategy::ExpiredOnly);
        let mut expired = candidate("expired", 100, 1);
        expired.expiration_at = Some(50);
        let fresh = candidate("fresh", 100, 2);
        let expired_key = expired.key.clone();

        let plan = engine.plan(vec![expired, fresh], 10_000, 100);
        assert_eq!(plan, vec![expired_key]);
    }

    #[test]
    fn test_custom_ordering_largest_first() {
        let engine = EvictionEngine::new(EvictionStrategy::Custom("largest-first".into()));
        engine.register_custom(
            "largest-first",
            Arc::new(|a, b| b.cached_bytes.cmp(&a.cached_bytes)),
        );
        let small = candidate("small", 10, 1);
        let big = candidate("big", 1_000, 2);
        let big_key = big.key.clone();

        let plan = engine.plan(vec![small, big], 500, 0);
        assert_eq!(plan, vec![big_key]);
    }

    #[test]
    fn test_unknown_custom_falls_back_to_lru() {
        let engine = EvictionEngine::new(EvictionStrategy::Custom("missing".into()));
        let a = candidate("a", 100, 1);
        let a_key = a.key.clone();
        let plan = engine.plan(vec![candidate("b", 100, 2), a], 100, 0);
        assert_eq!(plan, vec![a_key]);
    }

    #[test]
    fn test_pressure_plans() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        let mut low = candidate("low", 100, 1);
        low.priority = ResourcePriority::Low;
        let incomplete_normal = candidate("normal", 100, 2);
        let mut complete_normal = candidate("done", 100, 3);
        complete_normal.is_complete = true;

        let all = vec![low.clone(), incomplete_normal.clone(), complete_normal];

        assert!(engine.pressure_plan(&all, MemoryPressure::Low).is_empty());
        assert_eq!(engine.pressure_plan(&all, MemoryPressure::Medium).len(), 1);
        assert_eq!(engine.pressure_plan(&all, MemoryPressure::High).len(), 2);
        assert_eq!(
            engine.pressure_plan(&all, MemoryPressure::Critical).len(),
            3
        );
    }

    #[test]
    fn test_expired_sweep_lists_all_expired() {
        let engine = EvictionEngine::new(EvictionStrategy::Lru);
        let mut a = candidate("a", 100, 1);
        a.expiration_at = Some(10);
        let mut b = candidate("b", 100, 2);
        b.expiration_at = Some(500);
        let c = candidate("c", 100, 3);

        let swept = engine.expired(&[a.clone(), b, c], 100);
        assert_eq!(swept, vec![a.key]);
    }
}
