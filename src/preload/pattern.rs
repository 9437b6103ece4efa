//! Access pattern tracking
//!
//! Per-key access statistics feeding the predictive preloader. A pattern
//! becomes preload-eligible when it has been touched often enough, recently
//! enough, and outside its scheduling cooldown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

/// Eligibility thresholds and retention for access patterns
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Minimum accesses before a key can be considered
    pub min_access_count: u64,
    /// Minimum accesses per hour
    pub frequency_threshold: f64,
    /// Minimum gap between two scheduled preloads of the same key
    pub cooldown: Duration,
    /// Patterns idle longer than this are swept
    pub retention: Duration,
    /// Bound on the per-key recent-access buffer
    pub recent_buffer: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_access_count: 3,
            frequency_threshold: 0.7,
            cooldown: Duration::from_secs(300),
            retention: Duration::from_secs(7 * 24 * 3600),
            recent_buffer: 100,
        }
    }
}

struct AccessPattern {
    count: AtomicU64,
    first_access_s: i64,
    last_access_s: AtomicI64,
    /// Stamped when a preload is accepted for scheduling, not when it runs,
    /// so a burst of accesses cannot enqueue duplicates
    last_preload_s: AtomicI64,
    recent: Mutex<VecDeque<i64>>,
}

impl AccessPattern {
    fn new(now_s: i64) -> Self {
        Self {
            count: AtomicU64::new(0),
            first_access_s: now_s,
            last_access_s: AtomicI64::new(now_s),
            last_preload_s: AtomicI64::new(0),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Accesses per hour since first sight, floored at one hour so young
    /// hot keys register immediately.
    fn frequency(&self, now_s: i64) -> f64 {
        let hours = ((now_s - self.first_access_s) as f64 / 3600.0).max(1.0);
        self.count.load(Ordering::Relaxed) as f64 / hours
    }
}

/// Concurrent per-key access tracker.
pub struct AccessTracker {
    config: PatternConfig,
    patterns: DashMap<String, AccessPattern>,
}

impl AccessTracker {
    /// Create an empty tracker.
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            patterns: DashMap::new(),
        }
    }

    fn now_s() -> i64 {
        Utc::now().timestamp()
    }

    /// Record one access.
    ///
    /// Returns the access frequency when the key is preload-eligible right
    /// now (count, frequency, and cooldown thresholds all met), `None`
    /// otherwise. Eligibility here does not stamp the cooldown; call
    /// [`mark_scheduled`](Self::mark_scheduled) once a task is actually
    /// accepted into the queue.
    pub fn record_access(&self, key: &str) -> Option<f64> {
        let now = Self::now_s();
        let pattern = self
            .patterns
            .entry(key.to_string())
            .or_insert_with(|| AccessPattern::new(now));

        pattern.count.fetch_add(1, Ordering::Relaxed);
        pattern.last_access_s.store(now, Ordering::Relaxed);
        {
            // Trim inline under the same update; the buffer never exceeds
            // its bound between operations
            let mut recent = pattern.recent.lock();
            recent.push_back(now);
            while recent.len() > self.config.recent_buffer {
                recent.pop_front();
            }
        }

        self.eligibility(&pattern, now)
    }

    fn eligibility(&self, pattern: &AccessPattern, now_s: i64) -> Option<f64> {
        if pattern.count.load(Ordering::Relaxed) < self.config.min_access_count {
            return None;
        }
        let frequency = pattern.frequency(now_s);
        if frequency < self.config.frequency_threshold {
            return None;
        }
        let last_preload = pattern.last_preload_s.load(Ordering::Relaxed);
        if last_preload != 0 && now_s - last_preload < self.config.cooldown.as_secs() as i64 {
            return None;
        }
        Some(frequency)
    }

    /// Stamp the cooldown for a key whose preload task was just accepted.
    pub fn mark_scheduled(&self, key: &str) {
        if let Some(pattern) = self.patterns.get(key) {
            pattern.last_preload_s.store(Self::now_s(), Ordering::Relaxed);
        }
    }

    /// Keys eligible right now, with their frequencies. Used by the
    /// periodic sweep so eligibility is acted on independent of traffic.
    pub fn eligible_keys(&self) -> Vec<(String, f64)> {
        let now = Self::now_s();
        self.patterns
            .iter()
            .filter_map(|entry| {
                self.eligibility(entry.value(), now)
                    .map(|freq| (entry.key().clone(), freq))
            })
            .collect()
    }

    /// Drop patterns idle longer than the retention window.
    pub fn evict_stale(&self) -> usize {
        let cutoff = Self::now_s() - self.config.retention.as_secs() as i64;
        let before = self.patterns.len();
        self.patterns
            .retain(|_, pattern| pattern.last_access_s.load(Ordering::Relaxed) >= cutoff);
        let evicted = before - self.patterns.len();
        if evicted > 0 {
            debug!("evicted {} stale access patterns", evicted);
        }
        evicted
    }

    /// Number of tracked keys
    pub fn tracked_keys(&self) -> usize {
        self.patterns.len()
    }

    #[cfg(test)]
    fn backdate_first_access(&self, key: &str, hours: i64) {
        if let Some(pattern) = self.patterns.get(key) {
            // first_access_s is immutable by design; rebuild the pattern
            let count = pattern.count.load(Ordering::Relaxed);
            let last = pattern.last_access_s.load(Ordering::Relaxed);
            let preload = pattern.last_preload_s.load(Ordering::Relaxed);
            drop(pattern);

            let rebuilt = AccessPattern::new(Self::now_s() - hours * 3600);
            rebuilt.count.store(count, Ordering::Relaxed);
            rebuilt.last_access_s.store(last, Ordering::Relaxed);
            rebuilt.last_preload_s.store(preload, Ordering::Relaxed);
            self.patterns.insert(key.to_string(), rebuilt);
        }
    }

    #[cfg(test)]
    fn backdate_last_access(&self, key: &str, secs: i64) {
        if let Some(pattern) = self.patterns.get(key) {
            pattern
                .last_access_s
                .store(Self::now_s() - secs, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> AccessTracker {
        AccessTracker::new(PatternConfig::default())
    }

    #[test]
    fn test_below_count_threshold_not_eligible() {
        let tracker = tracker();

        assert_eq!(tracker.record_access("k"), None);
        assert_eq!(tracker.record_access("k"), None);
    }

    #[test]
    fn test_third_access_becomes_eligible() {
        let tracker = tracker();

        tracker.record_access("k");
        tracker.record_access("k");
        // 3 accesses within the first hour: frequency 3.0/h >= 0.7/h
        let freq = tracker.record_access("k");
        assert!(freq.is_some());
        assert!(freq.unwrap() >= 3.0);
    }

    #[test]
    fn test_low_frequency_not_eligible() {
        let tracker = tracker();

        for _ in 0..3 {
            tracker.record_access("k");
        }
        // 3 accesses spread over 10 hours: 0.3/h < 0.7/h
        tracker.backdate_first_access("k", 10);
        assert_eq!(tracker.record_access("k"), None);
    }

    #[test]
    fn test_cooldown_blocks_rescheduling() {
        let tracker = tracker();

        for _ in 0..3 {
            tracker.record_access("k");
        }
        tracker.mark_scheduled("k");

        // Inside the cooldown nothing further is eligible
        assert_eq!(tracker.record_access("k"), None);
        assert!(tracker.eligible_keys().is_empty());
    }

    #[test]
    fn test_eligible_keys_sweep() {
        let tracker = tracker();

        for _ in 0..5 {
            tracker.record_access("hot");
        }
        tracker.record_access("cold");

        let eligible = tracker.eligible_keys();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].0, "hot");
    }

    #[test]
    fn test_stale_eviction() {
        let tracker = tracker();

        tracker.record_access("old");
        tracker.record_access("fresh");
        tracker.backdate_last_access("old", 8 * 24 * 3600);

        assert_eq!(tracker.evict_stale(), 1);
        assert_eq!(tracker.tracked_keys(), 1);
    }

    #[test]
    fn test_recent_buffer_bounded() {
        let config = PatternConfig {
            recent_buffer: 10,
            ..PatternConfig::default()
        };
        let tracker = AccessTracker::new(config);

        for _ in 0..50 {
            tracker.record_access("k");
        }
        let pattern = tracker.patterns.get("k").unwrap();
        assert_eq!(pattern.recent.lock().len(), 10);
    }

    #[test]
    fn test_keys_tracked_independently() {
        let tracker = tracker();

        for _ in 0..3 {
            tracker.record_access("a");
        }
        tracker.mark_scheduled("a");

        // b's eligibility is unaffected by a's cooldown
        tracker.record_access("b");
        tracker.record_access("b");
        assert!(tracker.record_access("b").is_some());
    }
}
