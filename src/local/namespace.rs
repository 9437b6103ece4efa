//! Single-namespace bounded cache
//!
//! One namespace = one independently configured `(max_entries, ttl)` region.
//! Eviction is recency-and-frequency scored and always happens before or at
//! insertion, so the entry count never exceeds the configured bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

/// Per-namespace capacity and expiry settings
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Namespace name
    pub name: String,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Time-to-live for every entry
    pub ttl: Duration,
}

impl NamespaceConfig {
    /// Create a namespace configuration
    pub fn new(name: impl Into<String>, max_entries: usize, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }
}

struct LocalEntry<T> {
    value: T,
    expires_at_ms: i64,
    last_access_ms: AtomicI64,
    access_count: AtomicU32,
}

impl<T> LocalEntry<T> {
    fn new(value: T, ttl: Duration, now_ms: i64) -> Self {
        Self {
            value,
            expires_at_ms: now_ms + ttl.as_millis() as i64,
            last_access_ms: AtomicI64::new(now_ms),
            access_count: AtomicU32::new(0),
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// Higher = more evictable: age discounted by how often the entry hits
    fn eviction_score(&self, now_ms: i64) -> f64 {
        let age = (now_ms - self.last_access_ms.load(Ordering::Relaxed)).max(0) as f64;
        let frequency = self.access_count.load(Ordering::Relaxed) as f64;
        age / (frequency + 1.0)
    }
}

/// Bounded TTL cache for one namespace.
pub struct NamespaceCache<T> {
    config: NamespaceConfig,
    map: RwLock<HashMap<String, LocalEntry<T>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl<T: Clone> NamespaceCache<T> {
    /// Create an empty namespace cache
    pub fn new(config: NamespaceConfig) -> Self {
        Self {
            config,
            map: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Get a value, recording the access for eviction scoring.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Self::now_ms();

        {
            let guard = self.map.read();
            match guard.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_access_ms.store(now, Ordering::Relaxed);
                    entry.access_count.fetch_add(1, Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {} // expired, fall through to removal
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: remove under the write lock, re-checking expiry
        let mut guard = self.map.write();
        if let Some(entry) = guard.get(key) {
            if entry.is_expired(now) {
                guard.remove(key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert a value, evicting first if the namespace is at capacity.
    pub fn put(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let now = Self::now_ms();
        let mut guard = self.map.write();

        if !guard.contains_key(&key) && guard.len() >= self.config.max_entries {
            self.evict_one(&mut guard, now);
        }

        guard.insert(key, LocalEntry::new(value, self.config.ttl, now));
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one key
    pub fn invalidate(&self, key: &str) -> bool {
        self.map.write().remove(key).is_some()
    }

    /// Remove everything in the namespace
    pub fn invalidate_all(&self) {
        self.map.write().clear();
    }

    fn evict_one(&self, guard: &mut HashMap<String, LocalEntry<T>>, now: i64) {
        // Expired entries first, otherwise the highest eviction score
        let victim = guard
            .iter()
            .map(|(k, e)| {
                let score = if e.is_expired(now) {
                    f64::MAX
                } else {
                    e.eviction_score(now)
                };
                (k.clone(), score)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(k, _)| k);

        if let Some(key) = victim {
            guard.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Namespace name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Number of live entries (expired-but-unswept included)
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when no entries are held
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Cumulative counters for this namespace
    pub fn stats(&self) -> NamespaceStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        NamespaceStats {
            name: self.config.name.clone(),
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits,
            misses,
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

/// Point-in-time counters for one namespace
#[derive(Debug, Clone)]
pub struct NamespaceStats {
    /// Namespace name
    pub name: String,
    /// Current entry count
    pub entries: usize,
    /// Configured capacity
    pub max_entries: usize,
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
