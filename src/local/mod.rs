//! Local Tier Cache - In-Process Namespace Caches
//!
//! First tier of the read path: a fixed set of independently configured
//! namespaces (list pages, detail records, category pages, aggregates),
//! each a bounded TTL cache with recency-and-frequency eviction.
//!
//! The namespace set is fixed at construction; operations against an
//! unknown namespace are misses / no-ops rather than errors, so a
//! misconfigured caller degrades instead of failing.

mod namespace;

pub use namespace::{NamespaceCache, NamespaceConfig, NamespaceStats};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Namespace for paginated list lookups
pub const NS_LIST: &str = "list";
/// Namespace for single-record detail lookups
pub const NS_DETAIL: &str = "detail";
/// Namespace for per-category page lookups
pub const NS_CATEGORY: &str = "category";
/// Namespace for aggregate lookups
pub const NS_AGGREGATE: &str = "aggregate";

/// Local tier configuration: one entry per namespace.
#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    /// Namespace definitions
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            namespaces: vec![
                NamespaceConfig::new(NS_LIST, 100, Duration::from_secs(120)),
                NamespaceConfig::new(NS_DETAIL, 500, Duration::from_secs(300)),
                NamespaceConfig::new(NS_CATEGORY, 200, Duration::from_secs(120)),
                NamespaceConfig::new(NS_AGGREGATE, 50, Duration::from_secs(600)),
            ],
        }
    }
}

/// Fixed set of namespace caches sharing one value type.
pub struct LocalTierCache<T> {
    namespaces: HashMap<String, Arc<NamespaceCache<T>>>,
}

impl<T: Clone> LocalTierCache<T> {
    /// Build the tier from its namespace configurations.
    pub fn new(config: LocalTierConfig) -> Self {
        let namespaces = config
            .namespaces
            .into_iter()
            .map(|ns| (ns.name.clone(), Arc::new(NamespaceCache::new(ns))))
            .collect();
        Self { namespaces }
    }

    /// Get a value from a namespace.
    pub fn get(&self, namespace: &str, key: &str) -> Option<T> {
        match self.namespaces.get(namespace) {
            Some(cache) => cache.get(key),
            None => {
                warn!("local tier get against unknown namespace {}", namespace);
                None
            }
        }
    }

    /// Insert a value into a namespace.
    pub fn put(&self, namespace: &str, key: impl Into<String>, value: T) {
        match self.namespaces.get(namespace) {
            Some(cache) => cache.put(key, value),
            None => warn!("local tier put against unknown namespace {}", namespace),
        }
    }

    /// Remove a single key from a namespace.
    pub fn invalidate(&self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .get(namespace)
            .map(|cache| cache.invalidate(key))
            .unwrap_or(false)
    }

    /// Remove every entry from every namespace.
    pub fn invalidate_all(&self) {
        for cache in self.namespaces.values() {
            cache.invalidate_all();
        }
    }

    /// Per-namespace counters.
    pub fn stats(&self) -> Vec<NamespaceStats> {
        let mut stats: Vec<_> = self.namespaces.values().map(|c| c.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Tier-wide aggregate counters.
    pub fn aggregate_stats(&self) -> LocalTierStats {
        let mut agg = LocalTierStats::default();
        for cache in self.namespaces.values() {
            let s = cache.stats();
            agg.entries += s.entries;
            agg.hits += s.hits;
            agg.misses += s.misses;
            agg.loads += s.loads;
            agg.evictions += s.evictions;
        }
        let total = agg.hits + agg.misses;
        agg.hit_rate = if total == 0 {
            0.0
        } else {
            agg.hits as f64 / total as f64
        };
        agg
    }
}

/// Aggregate counters across every namespace
#[derive(Debug, Clone, Default)]
pub struct LocalTierStats {
    /// Total live entries
    pub entries: usize,
    /// Cumulative hits
    pub hits: u64,
    /// Cumulative misses
    pub misses: u64,
    /// Cumulative inserts
    pub loads: u64,
    /// Cumulative capacity evictions
    pub evictions: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
}

// =============================================================================
// Tests
// =============================================================================
