//! Physical shard node

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;

/// One physical shard node.
///
/// Shared as `Arc<ShardNode>` between the node map and every virtual
/// position it owns on the ring, so an activity flip is observed by all
/// of them without a rebuild.
#[derive(Debug)]
pub struct ShardNode {
    /// Stable node identifier
    pub id: String,
    /// Backend address ("host:port")
    pub address: String,
    /// Relative capacity weight, >= 1
    pub weight: u32,
    active: AtomicBool,
    last_health_check_ms: AtomicI64,
}

impl ShardNode {
    /// Create an active node.
    pub fn new(id: impl Into<String>, address: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight,
            active: AtomicBool::new(true),
            last_health_check_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Whether the node currently accepts traffic
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the activity flag and stamp the health-check time.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        self.last_health_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Epoch millis of the last health transition
    pub fn last_health_check_ms(&self) -> i64 {
        self.last_health_check_ms.load(Ordering::Relaxed)
    }

    /// Read-only copy for the observability surface.
    pub fn snapshot(&self, virtual_nodes: usize) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            weight: self.weight,
            active: self.is_active(),
            last_health_check_ms: self.last_health_check_ms(),
            virtual_nodes,
        }
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Stable node identifier
    pub id: String,
    /// Backend address
    pub address: String,
    /// Relative capacity weight
    pub weight: u32,
    /// Whether the node accepts traffic
    pub active: bool,
    /// Epoch millis of the last health transition
    pub last_health_check_ms: i64,
    /// Virtual positions owned on the ring
    pub virtual_nodes: usize,
}
