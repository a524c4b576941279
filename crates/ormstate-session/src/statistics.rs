//! Factory-scoped load and cache statistics.
//!
//! Counters are shared by every session of a factory, so they are atomics
//! behind `parking_lot` maps. When statistics are disabled nothing is
//! counted and nothing is logged.
//!
//! Events are logged at trace level under the `ormstate::stats` target:
//!
//! ```text
//! RUST_LOG=ormstate::stats=trace
//! ```

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const TARGET: &str = "ormstate::stats";

/// Per-name counters.
#[derive(Debug, Default)]
struct Counters {
    counts: RwLock<HashMap<String, AtomicU64>>,
}

impl Counters {
    fn increment(&self, name: &str) -> u64 {
        if let Some(counter) = self.counts.read().get(name) {
            return counter.fetch_add(1, Ordering::Relaxed) + 1;
        }
        self.counts
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }

    fn get(&self, name: &str) -> u64 {
        self.counts
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    fn total(&self) -> u64 {
        self.counts
            .read()
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    fn clear(&self) {
        self.counts.write().clear();
    }
}

/// Statistics collected by a session factory.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: bool,
    /// entity name -> loads
    entity_loads: Counters,
    /// region -> accepted puts
    cache_puts: Counters,
    /// region -> hits
    cache_hits: Counters,
    /// region -> misses
    cache_misses: Counters,
    duplicate_hydrations: AtomicU64,
}

/// Point-in-time totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    /// Entities materialized
    pub entity_loads: u64,
    /// Accepted second-level cache puts
    pub cache_puts: u64,
    /// Second-level cache hits
    pub cache_hits: u64,
    /// Second-level cache misses
    pub cache_misses: u64,
    /// Rows hydrated for a key already in the load batch
    pub duplicate_hydrations: u64,
}

impl Statistics {
    /// Create statistics, enabled or not.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Whether counting is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// An entity finished materializing.
    pub fn load_entity(&self, entity_name: &str) {
        if !self.enabled {
            return;
        }
        let count = self.entity_loads.increment(entity_name);
        tracing::trace!(target: TARGET, entity = entity_name, count, "Entity loaded");
    }

    /// The cache accepted a put.
    pub fn second_level_cache_put(&self, region: &str) {
        if !self.enabled {
            return;
        }
        let count = self.cache_puts.increment(region);
        tracing::trace!(target: TARGET, region, count, "Second-level cache put");
    }

    /// A cache read found an entry.
    pub fn second_level_cache_hit(&self, region: &str) {
        if !self.enabled {
            return;
        }
        let count = self.cache_hits.increment(region);
        tracing::trace!(target: TARGET, region, count, "Second-level cache hit");
    }

    /// A cache read found nothing.
    pub fn second_level_cache_miss(&self, region: &str) {
        if !self.enabled {
            return;
        }
        let count = self.cache_misses.increment(region);
        tracing::trace!(target: TARGET, region, count, "Second-level cache miss");
    }

    /// A row was hydrated for a key already registered in its batch.
    pub fn duplicate_hydration(&self) {
        if !self.enabled {
            return;
        }
        let count = self.duplicate_hydrations.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(target: TARGET, count, "Duplicate hydration");
    }

    /// Loads of one entity.
    #[must_use]
    pub fn entity_load_count(&self, entity_name: &str) -> u64 {
        self.entity_loads.get(entity_name)
    }

    /// Accepted puts into one region.
    #[must_use]
    pub fn cache_put_count(&self, region: &str) -> u64 {
        self.cache_puts.get(region)
    }

    /// Hits in one region.
    #[must_use]
    pub fn cache_hit_count(&self, region: &str) -> u64 {
        self.cache_hits.get(region)
    }

    /// Misses in one region.
    #[must_use]
    pub fn cache_miss_count(&self, region: &str) -> u64 {
        self.cache_misses.get(region)
    }

    /// Totals across all names.
    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            entity_loads: self.entity_loads.total(),
            cache_puts: self.cache_puts.total(),
            cache_hits: self.cache_hits.total(),
            cache_misses: self.cache_misses.total(),
            duplicate_hydrations: self.duplicate_hydrations.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter.
    pub fn clear(&self) {
        self.entity_loads.clear();
        self.cache_puts.clear();
        self.cache_hits.clear();
        self.cache_misses.clear();
        self.duplicate_hydrations.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_counts_nothing() {
        let stats = Statistics::new(false);
        stats.load_entity("Order");
        stats.second_level_cache_put("orders");
        stats.duplicate_hydration();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_counts_per_name() {
        let stats = Statistics::new(true);
        stats.load_entity("Order");
        stats.load_entity("Order");
        stats.load_entity("Customer");
        stats.second_level_cache_put("orders");
        stats.second_level_cache_miss("orders");

        assert_eq!(stats.entity_load_count("Order"), 2);
        assert_eq!(stats.entity_load_count("Customer"), 1);
        assert_eq!(stats.entity_load_count("Nope"), 0);
        assert_eq!(stats.cache_put_count("orders"), 1);
        assert_eq!(stats.snapshot().entity_loads, 3);
        assert_eq!(stats.snapshot().cache_misses, 1);
    }

    #[test]
    fn test_clear_resets() {
        let stats = Statistics::new(true);
        stats.load_entity("Order");
        stats.duplicate_hydration();
        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Statistics::new(true);
        stats.second_level_cache_hit("orders");
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["cache_hits"], 1);
    }
}
