//! Existence Filter - Anti-Penetration Membership Test
//!
//! Probabilistic pre-check that short-circuits lookups for identities that
//! provably do not exist upstream, keeping known-absent keys away from both
//! cache tiers and the system of record.
//!
//! # Design
//!
//! - Backed by [`BloomBits`]; append-only, no per-key delete (a counting
//!   variant would carry different accuracy guarantees)
//! - `reload()` rebuilds a complete replacement from a paginated upstream
//!   scan and swaps it in atomically; readers never observe a partially
//!   populated structure
//! - Fails open: on init or reload failure the filter reports `Degraded`
//!   and answers "possibly present" for everything, so a broken filter
//!   degrades latency, never correctness

mod bloom;

pub use bloom::BloomBits;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::Result;

/// Upstream identity scan used exclusively by [`ExistenceFilter::reload`].
#[async_trait]
pub trait IdentityScan: Send + Sync {
    /// List a page of all identities known to the system of record.
    /// An empty page terminates the scan.
    async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>>;
}

/// Filter readiness, reported alongside every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHealth {
    /// Populated and answering with the configured error bounds
    Ready,
    /// Init or reload failed; answering "possibly present" for everything
    Degraded,
    /// Never initialized
    Unavailable,
}

/// Existence filter configuration
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Expected number of distinct identities
    pub expected_insertions: u64,
    /// Target false-positive rate
    pub false_positive_rate: f64,
    /// Page size for the reload scan
    pub reload_batch_size: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            expected_insertions: 1_000_000,
            false_positive_rate: 0.01,
            reload_batch_size: 1000,
        }
    }
}

struct FilterState {
    bits: Option<Arc<BloomBits>>,
    health: FilterHealth,
}

/// Probabilistic existence filter with atomic reload.
pub struct ExistenceFilter {
    config: FilterConfig,
    state: RwLock<FilterState>,
    reloads: AtomicU64,
    rejections: AtomicU64,
}

impl ExistenceFilter {
    /// Create an empty, ready filter.
    pub fn new(config: FilterConfig) -> Self {
        let bits = BloomBits::sized_for(config.expected_insertions, config.false_positive_rate);
        Self {
            config,
            state: RwLock::new(FilterState {
                bits: Some(Arc::new(bits)),
                health: FilterHealth::Ready,
            }),
            reloads: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Create an unpopulated, fail-open filter. Stays `Unavailable` until
    /// the first successful [`reload`](Self::reload).
    pub fn unavailable(config: FilterConfig) -> Self {
        warn!("existence filter starting unpopulated: answering possibly-present for all ids");
        Self {
            config,
            state: RwLock::new(FilterState {
                bits: None,
                health: FilterHealth::Unavailable,
            }),
            reloads: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Test whether `id` might exist upstream.
    ///
    /// `true` means "possibly present, proceed"; `false` means "definitely
    /// absent" and is only ever returned by a healthy filter.
    pub fn might_contain(&self, id: u64) -> bool {
        let state = self.state.read();
        match &state.bits {
            Some(bits) => {
                let present = bits.test(&id.to_be_bytes());
                if !present {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                }
                present
            }
            // Fail open
            None => true,
        }
    }

    /// Record an identity as present.
    pub fn add(&self, id: u64) {
        let state = self.state.read();
        if let Some(bits) = &state.bits {
            bits.set(&id.to_be_bytes());
        }
    }

    /// Record a batch of identities as present.
    pub fn add_all(&self, ids: &[u64]) {
        let state = self.state.read();
        if let Some(bits) = &state.bits {
            for id in ids {
                bits.set(&id.to_be_bytes());
            }
        }
    }

    /// Rebuild the filter from a full upstream scan and swap it in.
    ///
    /// The replacement is built entirely off to the side; concurrent readers
    /// keep using the previous structure until the single swap at the end.
    /// On scan failure the existing structure is kept and the filter is
    /// marked degraded.
    pub async fn reload(&self, source: &dyn IdentityScan) -> Result<u64> {
        let fresh = BloomBits::sized_for(
            self.config.expected_insertions,
            self.config.false_positive_rate,
        );

        let mut offset = 0u64;
        let mut total = 0u64;
        loop {
            let page = match source
                .list_identities(offset, self.config.reload_batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("existence filter reload failed at offset {}: {}", offset, e);
                    self.state.write().health = FilterHealth::Degraded;
                    return Err(e);
                }
            };

            if page.is_empty() {
                break;
            }
            for id in &page {
                fresh.set(&id.to_be_bytes());
            }
            total += page.len() as u64;
            offset += self.config.reload_batch_size;
        }

        {
            let mut state = self.state.write();
            state.bits = Some(Arc::new(fresh));
            state.health = FilterHealth::Ready;
        }
        self.reloads.fetch_add(1, Ordering::Relaxed);
        info!("existence filter reloaded with {} identities", total);
        Ok(total)
    }

    /// Current health
    pub fn health(&self) -> FilterHealth {
        self.state.read().health
    }

    /// Read-only snapshot for the observability surface.
    pub fn stats(&self) -> FilterStats {
        let state = self.state.read();
        let (bit_count, inserted) = match &state.bits {
            Some(bits) => (bits.bit_count(), bits.inserted()),
            None => (0, 0),
        };
        FilterStats {
            health: state.health,
            bit_count,
            inserted,
            reloads: self.reloads.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

/// Existence filter statistics
#[derive(Debug, Clone)]
pub struct FilterStats {
    /// Current health
    pub health: FilterHealth,
    /// Bits in the active structure (0 when degraded)
    pub bit_count: u64,
    /// Elements inserted into the active structure
    pub inserted: u64,
    /// Completed reloads
    pub reloads: u64,
    /// Lookups short-circuited as definitely absent
    pub rejections: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScan {
        ids: Vec<u64>,
    }

    #[async_trait]
    impl IdentityScan for FixedScan {
        async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>> {
            let start = offset as usize;
            if start >= self.ids.len() {
                return Ok(vec![]);
            }
            let end = (start + limit as usize).min(self.ids.len());
            Ok(self.ids[start..end].to_vec())
        }
    }

    struct FailingScan;

    #[async_trait]
    impl IdentityScan for FailingScan {
        async fn list_identities(&self, _offset: u64, _limit: u64) -> Result<Vec<u64>> {
            Err(crate::error::Error::Source("scan unavailable".into()))
        }
    }

    fn small_config() -> FilterConfig {
        FilterConfig {
            expected_insertions: 10_000,
            false_positive_rate: 0.01,
            reload_batch_size: 100,
        }
    }

    #[test]
    fn test_add_then_contains() {
        let filter = ExistenceFilter::new(small_config());

        filter.add(42);
        assert!(filter.might_contain(42));
        assert_eq!(filter.health(), FilterHealth::Ready);
    }

    #[test]
    fn test_add_all() {
        let filter = ExistenceFilter::new(small_config());

        let ids: Vec<u64> = (0..500).collect();
        filter.add_all(&ids);
        for id in ids {
            assert!(filter.might_contain(id));
        }
    }

    #[test]
    fn test_absent_id_rejected() {
        let filter = ExistenceFilter::new(small_config());
        filter.add_all(&[1, 2, 3]);

        // Overwhelmingly likely absent at this fill level
        let rejected = (1000..2000u64).filter(|id| !filter.might_contain(*id)).count();
        assert!(rejected > 950);
        assert!(filter.stats().rejections > 0);
    }

    #[test]
    fn test_unpopulated_fails_open() {
        let filter = ExistenceFilter::unavailable(small_config());

        assert_eq!(filter.health(), FilterHealth::Unavailable);
        assert!(filter.might_contain(99999));
        assert_eq!(filter.stats().rejections, 0);
    }

    #[tokio::test]
    async fn test_reload_no_false_negatives() {
        let filter = ExistenceFilter::new(small_config());
        let scan = FixedScan {
            ids: (0..2500).collect(),
        };

        let loaded = filter.reload(&scan).await.unwrap();
        assert_eq!(loaded, 2500);
        assert_eq!(filter.health(), FilterHealth::Ready);

        for id in 0..2500u64 {
            assert!(filter.might_contain(id), "false negative after reload: {}", id);
        }
    }

    #[tokio::test]
    async fn test_reload_replaces_previous_contents() {
        let filter = ExistenceFilter::new(small_config());
        filter.add(777_777);

        let scan = FixedScan { ids: (0..100).collect() };
        filter.reload(&scan).await.unwrap();

        // The pre-reload id is no longer upstream, so the rebuilt filter
        // should (with high probability) reject it.
        assert!(!filter.might_contain(777_777));
    }

    #[tokio::test]
    async fn test_reload_failure_degrades() {
        let filter = ExistenceFilter::new(small_config());
        filter.add(7);

        assert!(filter.reload(&FailingScan).await.is_err());
        assert_eq!(filter.health(), FilterHealth::Degraded);
        // Degraded keeps serving, fail-open included
        assert!(filter.might_contain(7));
    }

    #[tokio::test]
    async fn test_recovery_after_degraded() {
        let filter = ExistenceFilter::new(small_config());
        filter.reload(&FailingScan).await.ok();
        assert_eq!(filter.health(), FilterHealth::Degraded);

        let scan = FixedScan { ids: vec![1, 2, 3] };
        filter.reload(&scan).await.unwrap();
        assert_eq!(filter.health(), FilterHealth::Ready);
        assert!(filter.might_contain(2));
    }
}
