//! Distributed backend seam
//!
//! `KvBackend` is the boundary to whatever key/value service holds the
//! distributed tier. Every method takes the routed [`ShardNode`] so all
//! placement decisions stay in the router and no backend I/O ever happens
//! under the ring lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::Result;
use crate::ring::ShardNode;

/// Async key/value backend addressed per routed node.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch a value.
    async fn get(&self, node: &ShardNode, key: &str) -> Result<Option<Bytes>>;

    /// Store a value with a time-to-live.
    async fn set_with_ttl(
        &self,
        node: &ShardNode,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, node: &ShardNode, key: &str) -> Result<bool>;

    /// Atomically increment a counter key, creating it at 1.
    async fn increment(&self, node: &ShardNode, key: &str) -> Result<i64>;

    /// Set or refresh a key's time-to-live. Returns whether the key existed.
    async fn expire(&self, node: &ShardNode, key: &str, ttl: Duration) -> Result<bool>;

    /// Cursor-based scan of keys matching a glob pattern (`*` wildcard).
    ///
    /// Returns the next cursor and one batch of matching keys; a returned
    /// cursor of 0 means the scan is complete.
    async fn scan_matching(
        &self,
        node: &ShardNode,
        cursor: u64,
        pattern: &str,
        batch: u64,
    ) -> Result<(u64, Vec<String>)>;
}

struct StoredValue {
    data: Bytes,
    expires_at_ms: i64,
    counter: Option<i64>,
}

impl StoredValue {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// In-memory backend for tests and the demo harness.
///
/// One keyspace per node id, TTL checked lazily on read.
#[derive(Default)]
pub struct InMemoryKvBackend {
    nodes: DashMap<String, Arc<DashMap<String, StoredValue>>>,
}

impl InMemoryKvBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn keyspace(&self, node: &ShardNode) -> Arc<DashMap<String, StoredValue>> {
        Arc::clone(
            &self
                .nodes
                .entry(node.id.clone())
                .or_insert_with(|| Arc::new(DashMap::new())),
        )
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Glob match supporting `*` as a multi-character wildcard.
    fn glob_matches(pattern: &str, key: &str) -> bool {
        fn inner(p: &[u8], k: &[u8]) -> bool {
            match (p.first(), k.first()) {
                (None, None) => true,
                (Some(b'*'), _) => {
                    inner(&p[1..], k) || (!k.is_empty() && inner(p, &k[1..]))
                }
                (Some(pc), Some(kc)) if pc == kc => inner(&p[1..], &k[1..]),
                _ => false,
            }
        }
        inner(pattern.as_bytes(), key.as_bytes())
    }

    /// Total live keys across every node (test helper).
    pub fn total_keys(&self) -> usize {
        let now = Self::now_ms();
        self.nodes
            .iter()
            .map(|ks| ks.iter().filter(|e| !e.is_expired(now)).count())
            .sum()
    }
}

#[async_trait]
impl KvBackend for InMemoryKvBackend {
    async fn get(&self, node: &ShardNode, key: &str) -> Result<Option<Bytes>> {
        let keyspace = self.keyspace(node);
        let now = Self::now_ms();

        // The read guard must drop before the expired-entry removal
        let expired = match keyspace.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            keyspace.remove(key);
        }
        Ok(None)
    }

    async fn set_with_ttl(
        &self,
        node: &ShardNode,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<()> {
        self.keyspace(node).insert(
            key.to_string(),
            StoredValue {
                data: value,
                expires_at_ms: Self::now_ms() + ttl.as_millis() as i64,
                counter: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, node: &ShardNode, key: &str) -> Result<bool> {
        Ok(self.keyspace(node).remove(key).is_some())
    }

    async fn increment(&self, node: &ShardNode, key: &str) -> Result<i64> {
        let keyspace = self.keyspace(node);
        let now = Self::now_ms();

        let mut entry = keyspace.entry(key.to_string()).or_insert_with(|| StoredValue {
            data: Bytes::new(),
            // Counters persist until an explicit expire() is applied
            expires_at_ms: i64::MAX,
            counter: Some(0),
        });
        if entry.is_expired(now) {
            entry.counter = Some(0);
            entry.expires_at_ms = i64::MAX;
        }
        let next = entry.counter.unwrap_or(0) + 1;
        entry.counter = Some(next);
        entry.data = Bytes::from(next.to_string());
        Ok(next)
    }

    async fn expire(&self, node: &ShardNode, key: &str, ttl: Duration) -> Result<bool> {
        let keyspace = self.keyspace(node);
        let result = match keyspace.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at_ms = Self::now_ms() + ttl.as_millis() as i64;
                Ok(true)
            }
            None => Ok(false),
        };
        result
    }

    async fn scan_matching(
        &self,
        node: &ShardNode,
        cursor: u64,
        pattern: &str,
        batch: u64,
    ) -> Result<(u64, Vec<String>)> {
        let keyspace = self.keyspace(node);
        let now = Self::now_ms();

        // Stable ordering makes the cursor meaningful across calls
        let mut matching: Vec<String> = keyspace
            .iter()
            .filter(|e| !e.is_expired(now) && Self::glob_matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        matching.sort();

        let start = cursor as usize;
        if start >= matching.len() {
            return Ok((0, vec![]));
        }
        let end = (start + batch as usize).min(matching.len());
        let page = matching[start..end].to_vec();
        let next = if end >= matching.len() { 0 } else { end as u64 };
        Ok((next, page))
    }
}

// =============================================================================
// Tests
// =============================================================================
