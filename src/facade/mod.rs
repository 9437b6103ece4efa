//! Cache Façade - Read-Through Orchestration
//!
//! The single entry point callers use. A lookup walks the tiers in order:
//!
//! ```text
//!   lookup ──▶ existence filter ──▶ local tier ──▶ versioned store ──▶ source
//!                  (detail only)      (backfilled)    (populated)
//! ```
//!
//! Misses populate every tier on the way back out; a record confirmed
//! absent by the source stays uncached (negative caching is the filter's
//! job). Every successful access feeds the preload tracker and may
//! schedule predictive warming.

mod lookup;

pub use lookup::{LookupKey, Payload};

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::filter::{ExistenceFilter, FilterStats, IdentityScan};
use crate::local::{LocalTierCache, LocalTierStats, NamespaceStats, NS_DETAIL};
use crate::preload::{AccessTracker, PreloadKind, PreloadLoader, PreloadQueue, PreloadStats, PreloadTask};
use crate::ring::{NodeSnapshot, ShardRouter};
use crate::store::{KvBackend, StoreStats, VersionedStore};

/// System-of-record boundary.
#[async_trait]
pub trait EntitySource<E>: Send + Sync {
    /// Fetch the value for a lookup; `None` means confirmed absent.
    async fn fetch(&self, key: &LookupKey) -> Result<Option<Payload<E>>>;

    /// Page through every record identity, for filter reloads.
    async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>>;
}

/// Bridges an [`EntitySource`] to the filter's reload scan.
struct SourceScan<'a, E>(&'a dyn EntitySource<E>);

#[async_trait]
impl<E: Send + Sync> IdentityScan for SourceScan<'_, E> {
    async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>> {
        self.0.list_identities(offset, limit).await
    }
}

/// Multi-tier read-through cache façade.
pub struct CacheFacade<E, B: KvBackend> {
    filter: Arc<ExistenceFilter>,
    local: Arc<LocalTierCache<Payload<E>>>,
    store: Arc<VersionedStore<B>>,
    router: Arc<ShardRouter>,
    source: Arc<dyn EntitySource<E>>,
    tracker: Arc<AccessTracker>,
    queue: Arc<PreloadQueue>,
}

impl<E, B> CacheFacade<E, B>
where
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    B: KvBackend + 'static,
{
    /// Assemble the façade from its shared components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        filter: Arc<ExistenceFilter>,
        local: Arc<LocalTierCache<Payload<E>>>,
        store: Arc<VersionedStore<B>>,
        router: Arc<ShardRouter>,
        source: Arc<dyn EntitySource<E>>,
        tracker: Arc<AccessTracker>,
        queue: Arc<PreloadQueue>,
    ) -> Self {
        Self {
            filter,
            local,
            store,
            router,
            source,
            tracker,
            queue,
        }
    }

    /// Read-through lookup.
    ///
    /// Walks filter, local tier, distributed store, then the system of
    /// record, populating tiers on the way back. `Ok(None)` is a confirmed
    /// absence and is not cached. Shard exhaustion degrades to a plain
    /// source fetch with distributed population skipped.
    pub async fn get(&self, key: &LookupKey) -> Result<Option<Payload<E>>> {
        let cache_key = key.cache_key();

        if let LookupKey::Detail { id } = key {
            if !self.filter.might_contain(*id) {
                debug!("filter short-circuit for {}", cache_key);
                return Ok(None);
            }
        }

        if let Some(payload) = self.local.get(key.namespace(), &cache_key) {
            self.note_access(key, &cache_key).await;
            return Ok(Some(payload));
        }

        let mut distributed = true;
        match self.store.get::<Payload<E>>(&cache_key).await {
            Ok(Some(payload)) => {
                self.local
                    .put(key.namespace(), cache_key.clone(), payload.clone());
                self.note_access(key, &cache_key).await;
                return Ok(Some(payload));
            }
            Ok(None) => {}
            Err(Error::NoActiveNode) => {
                debug!("shard topology exhausted, bypassing distributed tier for {}", cache_key);
                distributed = false;
            }
            Err(e) => return Err(e),
        }

        let Some(payload) = self.source.fetch(key).await? else {
            // Confirmed absent: never cached, the filter handles negatives
            return Ok(None);
        };

        self.populate_tiers(key, &cache_key, &payload, distributed).await;
        self.note_access(key, &cache_key).await;
        Ok(Some(payload))
    }

    async fn populate_tiers(
        &self,
        key: &LookupKey,
        cache_key: &str,
        payload: &Payload<E>,
        distributed: bool,
    ) {
        self.local
            .put(key.namespace(), cache_key.to_string(), payload.clone());

        if distributed {
            let ttl = self.store.ttl_for(key.namespace());
            match self.store.set(cache_key, payload, Some(ttl)).await {
                Ok(()) => {}
                Err(Error::NoActiveNode) => {
                    debug!("distributed population skipped for {}", cache_key)
                }
                Err(e) => warn!("distributed population failed for {}: {}", cache_key, e),
            }
        }

        if let LookupKey::Detail { id } = key {
            self.filter.add(*id);
        }
    }

    /// Record an access for preload tracking and, for detail lookups, the
    /// record's view counter.
    async fn note_access(&self, key: &LookupKey, cache_key: &str) {
        if let LookupKey::Detail { id } = key {
            if let Err(e) = self.store.increment_view(*id).await {
                debug!("view counter skipped for {}: {}", cache_key, e);
            }
        }

        if let Some(frequency) = self.tracker.record_access(cache_key) {
            if let Some(task) = self.plan(cache_key, frequency) {
                if self.queue.push(task) {
                    // Stamp at scheduling so a burst cannot enqueue twice
                    self.tracker.mark_scheduled(cache_key);
                }
            }
        }
    }

    /// Fetch-and-populate without access tracking, for preload warming.
    async fn warm(&self, key: &LookupKey) -> Result<()> {
        let cache_key = key.cache_key();
        if self.local.get(key.namespace(), &cache_key).is_some() {
            return Ok(());
        }
        let Some(payload) = self.source.fetch(key).await? else {
            return Ok(());
        };
        self.populate_tiers(key, &cache_key, &payload, true).await;
        Ok(())
    }

    // =========================================================================
    // Write-side population and invalidation
    // =========================================================================

    /// Populate both tiers with a list page.
    pub async fn put_list(&self, page: u32, page_size: u32, records: Vec<E>) {
        let key = LookupKey::List { page, page_size };
        self.populate_tiers(&key, &key.cache_key(), &Payload::Many(records), true)
            .await;
    }

    /// Populate both tiers (and the filter) with a detail record.
    pub async fn put_detail(&self, id: u64, record: E) {
        let key = LookupKey::Detail { id };
        self.populate_tiers(&key, &key.cache_key(), &Payload::One(record), true)
            .await;
    }

    /// Populate both tiers with a category page.
    pub async fn put_category(&self, name: &str, page: u32, page_size: u32, records: Vec<E>) {
        let key = LookupKey::Category {
            name: name.to_string(),
            page,
            page_size,
        };
        self.populate_tiers(&key, &key.cache_key(), &Payload::Many(records), true)
            .await;
    }

    /// Populate both tiers with a named aggregate.
    pub async fn put_aggregate(&self, name: &str, payload: Payload<E>) {
        let key = LookupKey::Aggregate {
            name: name.to_string(),
        };
        self.populate_tiers(&key, &key.cache_key(), &payload, true).await;
    }

    /// Drop a detail record from both tiers.
    ///
    /// The filter is append-only; absence takes effect through the tiers
    /// until the next reload.
    pub async fn invalidate_detail(&self, id: u64) {
        let key = LookupKey::Detail { id };
        let cache_key = key.cache_key();
        self.local.invalidate(NS_DETAIL, &cache_key);
        match self.store.delete(&cache_key).await {
            Ok(_) => {}
            Err(Error::NoActiveNode) => {
                warn!("distributed invalidation skipped for {}", cache_key)
            }
            Err(e) => warn!("distributed invalidation failed for {}: {}", cache_key, e),
        }
    }

    /// Wipe the local tier and purge every distributed cache key,
    /// namespace by namespace in bounded batches.
    pub async fn invalidate_all(&self) -> Result<u64> {
        self.local.invalidate_all();

        let mut purged = 0u64;
        for prefix in ["list:", "detail:", "category:", "agg:"] {
            purged += self.store.delete_by_prefix(prefix).await?;
        }
        Ok(purged)
    }

    /// Rebuild the existence filter from a full source scan.
    pub async fn reload_filter(&self) -> Result<u64> {
        let scan = SourceScan(self.source.as_ref());
        self.filter.reload(&scan).await
    }

    /// Full read-only snapshot of every component.
    pub fn observability(&self, preload: PreloadStats) -> CacheObservability {
        CacheObservability {
            local: self.local.stats(),
            local_aggregate: self.local.aggregate_stats(),
            topology: self.router.topology(),
            filter: self.filter.stats(),
            store: self.store.stats(),
            preload,
        }
    }
}

#[async_trait]
impl<E, B> PreloadLoader for CacheFacade<E, B>
where
    E: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    B: KvBackend + 'static,
{
    fn plan(&self, key: &str, frequency: f64) -> Option<PreloadTask> {
        let kind = match LookupKey::parse(key)? {
            LookupKey::List { page, page_size } => PreloadKind::NextPage { page, page_size },
            LookupKey::Category { name, page, page_size } => PreloadKind::SiblingPages {
                category: name,
                page,
                page_size,
            },
            LookupKey::Detail { id } => PreloadKind::Related { id },
            // Aggregates are point lookups with no successor to warm
            LookupKey::Aggregate { .. } => return None,
        };
        Some(PreloadTask {
            key: key.to_string(),
            kind,
            priority: frequency,
        })
    }

    async fn load(&self, task: &PreloadTask) -> Result<()> {
        match &task.kind {
            PreloadKind::NextPage { page, page_size } => {
                self.warm(&LookupKey::List { page: *page, page_size: *page_size })
                    .await?;
                self.warm(&LookupKey::List { page: page + 1, page_size: *page_size })
                    .await
            }
            PreloadKind::SiblingPages { category, page, page_size } => {
                self.warm(&LookupKey::Category {
                    name: category.clone(),
                    page: *page,
                    page_size: *page_size,
                })
                .await?;
                self.warm(&LookupKey::Category {
                    name: category.clone(),
                    page: page + 1,
                    page_size: *page_size,
                })
                .await
            }
            PreloadKind::Related { id } => self.warm(&LookupKey::Detail { id: *id }).await,
        }
    }
}

/// Read-only snapshot across every cache component.
#[derive(Debug, Clone)]
pub struct CacheObservability {
    /// Per-namespace local tier counters
    pub local: Vec<NamespaceStats>,
    /// Aggregate local tier counters
    pub local_aggregate: LocalTierStats,
    /// Shard topology
    pub topology: Vec<NodeSnapshot>,
    /// Existence filter state
    pub filter: FilterStats,
    /// Distributed tier counters
    pub store: StoreStats,
    /// Preloader counters
    pub preload: PreloadStats,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use serde::Deserialize;

    use crate::filter::FilterConfig;
    use crate::local::LocalTierConfig;
    use crate::preload::PatternConfig;
    use crate::ring::RouterConfig;
    use crate::store::{InMemoryKvBackend, StoreConfig};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Article {
        id: u64,
        title: String,
        category: String,
    }

    struct VecSource {
        articles: Vec<Article>,
        fetches: AtomicU64,
    }

    impl VecSource {
        fn new(count: u64) -> Self {
            let articles = (1..=count)
                .map(|id| Article {
                    id,
                    title: format!("article {}", id),
                    category: if id % 2 == 0 { "even".into() } else { "odd".into() },
                })
                .collect();
            Self {
                articles,
                fetches: AtomicU64::new(0),
            }
        }

        fn page(items: Vec<Article>, page: u32, page_size: u32) -> Option<Payload<Article>> {
            let start = ((page.saturating_sub(1)) * page_size) as usize;
            if start >= items.len() {
                return None;
            }
            let end = (start + page_size as usize).min(items.len());
            Some(Payload::Many(items[start..end].to_vec()))
        }
    }

    #[async_trait]
    impl EntitySource<Article> for VecSource {
        async fn fetch(&self, key: &LookupKey) -> Result<Option<Payload<Article>>> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            Ok(match key {
                LookupKey::Detail { id } => self
                    .articles
                    .iter()
                    .find(|a| a.id == *id)
                    .cloned()
                    .map(Payload::One),
                LookupKey::List { page, page_size } => {
                    Self::page(self.articles.clone(), *page, *page_size)
                }
                LookupKey::Category { name, page, page_size } => {
                    let filtered: Vec<_> = self
                        .articles
                        .iter()
                        .filter(|a| &a.category == name)
                        .cloned()
                        .collect();
                    Self::page(filtered, *page, *page_size)
                }
                LookupKey::Aggregate { .. } => {
                    Some(Payload::Many(self.articles.iter().take(3).cloned().collect()))
                }
            })
        }

        async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>> {
            let start = offset as usize;
            if start >= self.articles.len() {
                return Ok(vec![]);
            }
            let end = (start + limit as usize).min(self.articles.len());
            Ok(self.articles[start..end].iter().map(|a| a.id).collect())
        }
    }

    type Facade = CacheFacade<Article, InMemoryKvBackend>;

    async fn fixture(count: u64) -> (Arc<Facade>, Arc<VecSource>, Arc<InMemoryKvBackend>, Arc<ShardRouter>) {
        let backend = Arc::new(InMemoryKvBackend::new());
        let router = Arc::new(ShardRouter::new(RouterConfig::default()));
        router.add_node("a", "10.0.0.1:6379", 1).unwrap();
        router.add_node("b", "10.0.0.2:6379", 1).unwrap();

        let store = Arc::new(VersionedStore::new(
            Arc::clone(&backend),
            Arc::clone(&router),
            StoreConfig::default(),
        ));
        let source = Arc::new(VecSource::new(count));
        let facade = Arc::new(CacheFacade::new(
            Arc::new(ExistenceFilter::new(FilterConfig {
                expected_insertions: 10_000,
                ..FilterConfig::default()
            })),
            Arc::new(LocalTierCache::new(LocalTierConfig::default())),
            store,
            Arc::clone(&router),
            Arc::clone(&source) as Arc<dyn EntitySource<Article>>,
            Arc::new(AccessTracker::new(PatternConfig::default())),
            Arc::new(PreloadQueue::new(100)),
        ));
        facade.reload_filter().await.unwrap();
        (facade, source, backend, router)
    }

    #[tokio::test]
    async fn test_read_through_populates_tiers() {
        let (facade, source, _, _) = fixture(10).await;
        let key = LookupKey::Detail { id: 3 };

        let first = facade.get(&key).await.unwrap();
        assert!(matches!(first, Some(Payload::One(ref a)) if a.id == 3));
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);

        // Second read is a local hit, no source touch
        let second = facade.get(&key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_store_hit_backfills_local() {
        let (facade, source, _, _) = fixture(10).await;
        let key = LookupKey::Detail { id: 5 };

        facade.get(&key).await.unwrap();
        facade.local.invalidate(NS_DETAIL, &key.cache_key());

        // Served from the distributed tier, not the source
        let got = facade.get(&key).await.unwrap();
        assert!(got.is_some());
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);

        // And the local tier was backfilled
        assert!(facade.local.get(NS_DETAIL, &key.cache_key()).is_some());
    }

    #[tokio::test]
    async fn test_filter_short_circuits_absent_detail() {
        let (facade, source, _, _) = fixture(10).await;

        let got = facade.get(&LookupKey::Detail { id: 99_999 }).await.unwrap();
        assert_eq!(got, None);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 0);
        assert!(facade.filter.stats().rejections > 0);
    }

    #[tokio::test]
    async fn test_confirmed_absence_not_cached() {
        let (facade, source, _, _) = fixture(10).await;

        // Pass the filter but be absent at the source
        facade.filter.add(500);
        assert_eq!(facade.get(&LookupKey::Detail { id: 500 }).await.unwrap(), None);
        assert_eq!(facade.get(&LookupKey::Detail { id: 500 }).await.unwrap(), None);
        // Both lookups reached the source: negatives are never stored
        assert_eq!(source.fetches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_topology_exhaustion_degrades_to_source() {
        let (facade, source, backend, router) = fixture(10).await;
        router.set_active("a", false).unwrap();
        router.set_active("b", false).unwrap();

        let got = facade.get(&LookupKey::List { page: 1, page_size: 5 }).await.unwrap();
        assert!(matches!(got, Some(Payload::Many(ref v)) if v.len() == 5));
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);
        // Distributed population was skipped
        assert_eq!(backend.total_keys(), 0);
    }

    #[tokio::test]
    async fn test_list_reads_schedule_preload_once() {
        let (facade, _, _, _) = fixture(30).await;
        let key = LookupKey::List { page: 1, page_size: 10 };

        facade.get(&key).await.unwrap();
        facade.get(&key).await.unwrap();
        assert_eq!(facade.queue.depth(), 0);

        // Third access crosses the threshold and schedules exactly one task
        facade.get(&key).await.unwrap();
        assert_eq!(facade.queue.depth(), 1);

        // Cooldown was stamped at scheduling: further reads add nothing
        facade.get(&key).await.unwrap();
        facade.get(&key).await.unwrap();
        assert_eq!(facade.queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_next_page_preload_warms_both_pages() {
        let (facade, _, _, _) = fixture(30).await;

        let task = facade.plan("list:1:10", 3.0).unwrap();
        assert_eq!(task.kind, PreloadKind::NextPage { page: 1, page_size: 10 });

        facade.load(&task).await.unwrap();
        assert!(facade.local.get("list", "list:1:10").is_some());
        assert!(facade.local.get("list", "list:2:10").is_some());
    }

    #[tokio::test]
    async fn test_sibling_pages_preload() {
        let (facade, _, _, _) = fixture(30).await;

        let task = facade.plan("category:even:1:5", 2.0).unwrap();
        facade.load(&task).await.unwrap();

        assert!(facade.local.get("category", "category:even:1:5").is_some());
        assert!(facade.local.get("category", "category:even:2:5").is_some());
    }

    #[tokio::test]
    async fn test_plan_skips_aggregates() {
        let (facade, _, _, _) = fixture(5).await;
        assert!(facade.plan("agg:trending", 9.0).is_none());
        assert!(facade.plan("garbage-key", 9.0).is_none());
    }

    #[tokio::test]
    async fn test_put_detail_then_read_skips_source() {
        let (facade, source, _, _) = fixture(0).await;

        facade
            .put_detail(
                77,
                Article { id: 77, title: "pushed".into(), category: "odd".into() },
            )
            .await;

        let got = facade.get(&LookupKey::Detail { id: 77 }).await.unwrap();
        assert!(matches!(got, Some(Payload::One(ref a)) if a.title == "pushed"));
        assert_eq!(source.fetches.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_invalidate_detail_clears_both_tiers() {
        let (facade, source, _, _) = fixture(10).await;
        let key = LookupKey::Detail { id: 4 };

        facade.get(&key).await.unwrap();
        facade.invalidate_detail(4).await;

        // Next read goes back to the source
        facade.get(&key).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_purges_distributed() {
        let (facade, _, _, _) = fixture(20).await;

        facade.get(&LookupKey::Detail { id: 1 }).await.unwrap();
        facade.get(&LookupKey::List { page: 1, page_size: 5 }).await.unwrap();
        facade.put_aggregate("hot", Payload::Many(vec![])).await;

        let purged = facade.invalidate_all().await.unwrap();
        assert_eq!(purged, 3);
        assert!(facade.local.aggregate_stats().entries == 0);
    }

    #[tokio::test]
    async fn test_distributed_ttls_vary_by_namespace() {
        use std::time::Duration;

        let backend = Arc::new(InMemoryKvBackend::new());
        let router = Arc::new(ShardRouter::new(RouterConfig::default()));
        router.add_node("a", "10.0.0.1:6379", 1).unwrap();

        let mut store_config = StoreConfig::default();
        store_config
            .namespace_ttls
            .insert("list".into(), Duration::from_millis(40));
        store_config
            .namespace_ttls
            .insert("detail".into(), Duration::from_secs(60));
        let store = Arc::new(VersionedStore::new(
            Arc::clone(&backend),
            Arc::clone(&router),
            store_config,
        ));

        let source = Arc::new(VecSource::new(20));
        let facade = Arc::new(CacheFacade::new(
            Arc::new(ExistenceFilter::new(FilterConfig {
                expected_insertions: 10_000,
                ..FilterConfig::default()
            })),
            Arc::new(LocalTierCache::new(LocalTierConfig::default())),
            store,
            Arc::clone(&router),
            Arc::clone(&source) as Arc<dyn EntitySource<Article>>,
            Arc::new(AccessTracker::new(PatternConfig::default())),
            Arc::new(PreloadQueue::new(100)),
        ));
        facade.reload_filter().await.unwrap();

        facade
            .get(&LookupKey::List { page: 1, page_size: 5 })
            .await
            .unwrap();
        facade.get(&LookupKey::Detail { id: 3 }).await.unwrap();
        let fetched = source.fetches.load(Ordering::Relaxed);

        // Drop the local tier and outlive the list namespace's TTL
        facade.local.invalidate_all();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // The detail entry is still served from the distributed tier
        facade.get(&LookupKey::Detail { id: 3 }).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), fetched);

        // The list page expired there and goes back to the source
        facade
            .get(&LookupKey::List { page: 1, page_size: 5 })
            .await
            .unwrap();
        assert_eq!(source.fetches.load(Ordering::Relaxed), fetched + 1);
    }

    #[tokio::test]
    async fn test_view_counter_tracks_detail_reads() {
        let (facade, _, _, _) = fixture(10).await;
        let key = LookupKey::Detail { id: 6 };

        facade.get(&key).await.unwrap();
        facade.get(&key).await.unwrap();
        facade.get(&key).await.unwrap();

        assert_eq!(facade.store.view_count(6).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_observability_snapshot() {
        let (facade, _, _, _) = fixture(10).await;
        facade.get(&LookupKey::Detail { id: 1 }).await.unwrap();

        let snap = facade.observability(PreloadStats {
            queue_depth: 0,
            scheduled: 0,
            dropped: 0,
            executed: 0,
            failed: 0,
            tracked_keys: 0,
        });
        assert_eq!(snap.topology.len(), 2);
        assert_eq!(snap.local.len(), 4);
        assert_eq!(snap.local_aggregate.loads, 1);
        assert!(snap.store.misses >= 1);
    }
}
