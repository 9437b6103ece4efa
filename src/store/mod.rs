//! Versioned Cache Store - Distributed Tier
//!
//! Second tier of the read path: values live in a distributed key/value
//! backend, routed per key by the shard ring, wrapped in a versioned
//! envelope so a schema change never surfaces stale shapes.
//!
//! # Versioning
//!
//! The schema version appears twice: inside the envelope (read-side guard,
//! mismatch decodes as a miss) and in the physical key prefix
//! `{keyspace}:{version}:{logical}` (purge unit, old generations are swept
//! by prefix). `init_version` reconciles the persisted marker at startup.
//!
//! # Degraded mode
//!
//! A backend failure on a single operation is logged and treated as a miss
//! or no-op, never an error; callers fall through to the system of record.
//! Only `NoActiveNode` propagates, so the façade can skip caching instead
//! of misreading exhaustion as absence.

mod backend;

pub use backend::{InMemoryKvBackend, KvBackend};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::local::{NS_AGGREGATE, NS_CATEGORY, NS_DETAIL, NS_LIST};
use crate::ring::ShardRouter;

/// Current cache schema version. Bump on any incompatible payload change.
pub const SCHEMA_VERSION: &str = "v2";

/// Versioned wrapper around every cached payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Schema version the payload was written under
    pub schema_version: String,
    /// Write timestamp
    pub written_at: DateTime<Utc>,
    /// The cached value
    pub payload: T,
}

/// Versioned store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key prefix isolating this subsystem's keys in a shared backend
    pub keyspace: String,
    /// TTL applied when the caller does not specify one
    pub default_ttl: Duration,
    /// Per-namespace TTLs for distributed writes; namespaces not listed
    /// here fall back to `default_ttl`
    pub namespace_ttls: HashMap<String, Duration>,
    /// Batch size for cursor-based scan-and-delete
    pub scan_batch: u64,
    /// TTL applied to view counters
    pub view_counter_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            keyspace: "strata".to_string(),
            default_ttl: Duration::from_secs(1800),
            // Pages churn, details are stable, aggregates sit in between
            namespace_ttls: HashMap::from([
                (NS_LIST.to_string(), Duration::from_secs(300)),
                (NS_DETAIL.to_string(), Duration::from_secs(1800)),
                (NS_CATEGORY.to_string(), Duration::from_secs(300)),
                (NS_AGGREGATE.to_string(), Duration::from_secs(600)),
            ]),
            scan_batch: 100,
            view_counter_ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Distributed tier with versioned envelopes and schema migration.
pub struct VersionedStore<B: KvBackend> {
    backend: Arc<B>,
    router: Arc<ShardRouter>,
    config: StoreConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    version_mismatches: AtomicU64,
    backend_failures: AtomicU64,
}

impl<B: KvBackend> VersionedStore<B> {
    /// Create a store over a backend and a shard router.
    pub fn new(backend: Arc<B>, router: Arc<ShardRouter>, config: StoreConfig) -> Self {
        Self {
            backend,
            router,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            version_mismatches: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
        }
    }

    fn physical_key(&self, logical: &str) -> String {
        format!("{}:{}:{}", self.config.keyspace, SCHEMA_VERSION, logical)
    }

    fn marker_key(&self) -> String {
        format!("{}:version", self.config.keyspace)
    }

    fn view_key(&self, id: u64) -> String {
        format!("{}:views:{}", self.config.keyspace, id)
    }

    /// Distributed TTL for a namespace's entries.
    pub fn ttl_for(&self, namespace: &str) -> Duration {
        self.config
            .namespace_ttls
            .get(namespace)
            .copied()
            .unwrap_or(self.config.default_ttl)
    }

    // Marker and counter keys must never be swept by a version purge, so
    // they sit outside the versioned prefix and expire on their own terms.
    const MARKER_TTL: Duration = Duration::from_secs(3650 * 24 * 3600);

    /// Fetch and decode a value.
    ///
    /// Version mismatch, decode failure, and backend failure are all
    /// misses; only `NoActiveNode` propagates.
    pub async fn get<T: DeserializeOwned>(&self, logical: &str) -> Result<Option<T>> {
        let key = self.physical_key(logical);
        let node = self.router.route_for(&key)?;

        let raw = match self.backend.get(&node, &key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!("backend get failed for {} on {}: {}", key, node.id, e);
                return Ok(None);
            }
        };

        let Some(raw) = raw else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        match serde_json::from_slice::<Envelope<T>>(&raw) {
            Ok(envelope) if envelope.schema_version == SCHEMA_VERSION => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(envelope.payload))
            }
            Ok(envelope) => {
                self.version_mismatches.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "version mismatch for {}: stored {}, current {}",
                    key, envelope.schema_version, SCHEMA_VERSION
                );
                Ok(None)
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("undecodable envelope for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// Encode and store a value under the current schema version.
    pub async fn set<T: Serialize>(
        &self,
        logical: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let key = self.physical_key(logical);
        let node = self.router.route_for(&key)?;

        let envelope = Envelope {
            schema_version: SCHEMA_VERSION.to_string(),
            written_at: Utc::now(),
            payload: value,
        };
        let encoded = Bytes::from(serde_json::to_vec(&envelope)?);

        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if let Err(e) = self.backend.set_with_ttl(&node, &key, encoded, ttl).await {
            self.backend_failures.fetch_add(1, Ordering::Relaxed);
            warn!("backend set failed for {} on {}: {}", key, node.id, e);
        }
        Ok(())
    }

    /// Delete a logical key.
    pub async fn delete(&self, logical: &str) -> Result<bool> {
        let key = self.physical_key(logical);
        let node = self.router.route_for(&key)?;

        match self.backend.delete(&node, &key).await {
            Ok(existed) => Ok(existed),
            Err(e) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!("backend delete failed for {} on {}: {}", key, node.id, e);
                Ok(false)
            }
        }
    }

    /// Delete every key under a logical prefix, batched per node.
    ///
    /// Scan-and-delete in bounded batches rather than one blocking pass.
    /// Returns the number of keys deleted.
    pub async fn delete_by_prefix(&self, logical_prefix: &str) -> Result<u64> {
        let pattern = format!("{}*", self.physical_key(logical_prefix));
        self.purge_pattern(&pattern).await
    }

    async fn purge_pattern(&self, pattern: &str) -> Result<u64> {
        let mut deleted = 0u64;

        for node in self.router.nodes() {
            // Each batch is deleted before the next scan, so every pass
            // restarts from cursor 0; an empty or unprogressing pass ends
            // the node
            loop {
                let (_, keys) = match self
                    .backend
                    .scan_matching(&node, 0, pattern, self.config.scan_batch)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        self.backend_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("scan failed on {} for {}: {}", node.id, pattern, e);
                        break;
                    }
                };

                if keys.is_empty() {
                    break;
                }

                let mut progressed = false;
                for key in &keys {
                    match self.backend.delete(&node, key).await {
                        Ok(true) => {
                            deleted += 1;
                            progressed = true;
                        }
                        Ok(false) => progressed = true,
                        Err(e) => {
                            self.backend_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("delete failed for {} on {}: {}", key, node.id, e);
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }
        }

        Ok(deleted)
    }

    /// Reconcile the persisted schema-version marker at startup.
    ///
    /// Absent marker: record the current version. Stale marker: purge every
    /// key under the old version's prefix, then advance the marker. Safe to
    /// run repeatedly; a second run is a no-op.
    pub async fn init_version(&self) -> Result<()> {
        let marker = self.marker_key();
        let node = self.router.route_for(&marker)?;

        let stored = match self.backend.get(&node, &marker).await {
            Ok(Some(raw)) => Some(String::from_utf8_lossy(&raw).to_string()),
            Ok(None) => None,
            Err(e) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!("version marker read failed: {}", e);
                return Ok(());
            }
        };

        match stored {
            Some(version) if version == SCHEMA_VERSION => {
                debug!("cache schema marker already at {}", SCHEMA_VERSION);
                return Ok(());
            }
            Some(old) => {
                info!(
                    "cache schema advanced {} -> {}, purging old generation",
                    old, SCHEMA_VERSION
                );
                let pattern = format!("{}:{}:*", self.config.keyspace, old);
                let purged = self.purge_pattern(&pattern).await?;
                info!("purged {} keys from schema {}", purged, old);
            }
            None => {
                info!("no cache schema marker, recording {}", SCHEMA_VERSION);
            }
        }

        if let Err(e) = self
            .backend
            .set_with_ttl(
                &node,
                &marker,
                Bytes::from(SCHEMA_VERSION.to_string()),
                Self::MARKER_TTL,
            )
            .await
        {
            self.backend_failures.fetch_add(1, Ordering::Relaxed);
            warn!("version marker write failed: {}", e);
        }
        Ok(())
    }

    /// Increment a record's view counter, refreshing its retention window.
    pub async fn increment_view(&self, id: u64) -> Result<i64> {
        let key = self.view_key(id);
        let node = self.router.route_for(&key)?;

        let count = match self.backend.increment(&node, &key).await {
            Ok(count) => count,
            Err(e) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!("view increment failed for {}: {}", key, e);
                return Ok(0);
            }
        };

        if let Err(e) = self
            .backend
            .expire(&node, &key, self.config.view_counter_ttl)
            .await
        {
            self.backend_failures.fetch_add(1, Ordering::Relaxed);
            warn!("view counter expire failed for {}: {}", key, e);
        }
        Ok(count)
    }

    /// Current view count for a record (0 when absent or degraded).
    pub async fn view_count(&self, id: u64) -> Result<i64> {
        let key = self.view_key(id);
        let node = self.router.route_for(&key)?;

        match self.backend.get(&node, &key).await {
            Ok(Some(raw)) => Ok(String::from_utf8_lossy(&raw).parse().unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => {
                self.backend_failures.fetch_add(1, Ordering::Relaxed);
                warn!("view count read failed for {}: {}", key, e);
                Ok(0)
            }
        }
    }

    /// Counters for the observability surface.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            version_mismatches: self.version_mismatches.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
        }
    }
}

/// Distributed tier counters
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Decoded current-version hits
    pub hits: u64,
    /// Absent keys plus mismatched or undecodable envelopes
    pub misses: u64,
    /// Envelopes rejected for carrying an old schema version
    pub version_mismatches: u64,
    /// Individual backend operations that failed and degraded
    pub backend_failures: u64,
}

// =============================================================================
// Tests
// =============================================================================
