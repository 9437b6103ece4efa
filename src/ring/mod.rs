//! Shard Router - Weighted Consistent-Hash Ring
//!
//! Routes logical cache keys to physical backend nodes. Each node owns
//! `virtual_nodes_per_weight * weight` positions on a 64-bit ring; a key
//! routes to the first position at or clockwise after its hash, with
//! failover walking further clockwise past inactive nodes.
//!
//! # Locking
//!
//! One `RwLock` guards the node map and the ring together. Lookups take
//! shared access; topology mutations take exclusive access and finish the
//! whole rebuild before releasing, so a reader never observes a partially
//! built ring. Activity flips touch only the node's shared atomic and need
//! no lock at all. No backend I/O ever happens under this lock.

mod node;

pub use node::{NodeSnapshot, ShardNode};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Shard router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// When false, every key routes to a single static default node
    pub enabled: bool,
    /// Virtual ring positions per unit of node weight
    pub virtual_nodes_per_weight: u32,
    /// Backend address of the default node used when sharding is disabled
    pub default_address: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            virtual_nodes_per_weight: 150,
            default_address: "127.0.0.1:6379".to_string(),
        }
    }
}

struct RingState {
    nodes: HashMap<String, Arc<ShardNode>>,
    ring: BTreeMap<u64, Arc<ShardNode>>,
}

/// Weighted consistent-hash shard router.
pub struct ShardRouter {
    config: RouterConfig,
    state: RwLock<RingState>,
    /// Static target when sharding is disabled
    default_node: Arc<ShardNode>,
}

impl ShardRouter {
    /// Create an empty router.
    pub fn new(config: RouterConfig) -> Self {
        let default_node = Arc::new(ShardNode::new(
            "default",
            config.default_address.clone(),
            1,
        ));
        Self {
            config,
            state: RwLock::new(RingState {
                nodes: HashMap::new(),
                ring: BTreeMap::new(),
            }),
            default_node,
        }
    }

    /// Stable 64-bit position for a label or key.
    #[inline]
    fn ring_hash(input: &str) -> u64 {
        let digest = Sha256::digest(input.as_bytes());
        u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
    }

    fn virtual_count(&self, weight: u32) -> usize {
        (self.config.virtual_nodes_per_weight * weight) as usize
    }

    fn place(&self, ring: &mut BTreeMap<u64, Arc<ShardNode>>, node: &Arc<ShardNode>) {
        for i in 0..self.virtual_count(node.weight) {
            let position = Self::ring_hash(&format!("{}#{}", node.id, i));
            ring.insert(position, Arc::clone(node));
        }
    }

    /// Add a node and place its virtual positions.
    ///
    /// Rejected without mutation when the weight is below 1 or the id is
    /// already present.
    pub fn add_node(
        &self,
        id: impl Into<String>,
        address: impl Into<String>,
        weight: u32,
    ) -> Result<()> {
        let id = id.into();
        if weight < 1 {
            return Err(Error::InvalidWeight { node_id: id, weight });
        }

        let mut state = self.state.write();
        if state.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(id));
        }

        let node = Arc::new(ShardNode::new(id.clone(), address, weight));
        self.place(&mut state.ring, &node);
        state.nodes.insert(id.clone(), node);

        info!(
            "shard node {} added with weight {} ({} nodes total)",
            id,
            weight,
            state.nodes.len()
        );
        Ok(())
    }

    /// Remove a node and every virtual position it owns.
    ///
    /// The ring is rebuilt from the survivors rather than deleting the
    /// removed node's recomputed positions, so it stays a pure function of
    /// the node set even if two virtual labels ever hash to the same
    /// position.
    pub fn remove_node(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.nodes.remove(id).is_none() {
            return Err(Error::NodeNotFound(id.to_string()));
        }

        let mut ring = BTreeMap::new();
        for node in state.nodes.values() {
            self.place(&mut ring, node);
        }
        state.ring = ring;

        info!("shard node {} removed ({} nodes remain)", id, state.nodes.len());
        Ok(())
    }

    /// Flip a node's activity flag. No ring rebuild: the flag is shared by
    /// every virtual position and routing skips inactive nodes inline.
    pub fn set_active(&self, id: &str, active: bool) -> Result<()> {
        let state = self.state.read();
        let node = state
            .nodes
            .get(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        node.set_active(active);
        info!("shard node {} marked {}", id, if active { "active" } else { "inactive" });
        Ok(())
    }

    /// Route a key to its owning active node.
    ///
    /// With sharding disabled, every key deterministically routes to the
    /// configured default node.
    pub fn route_for(&self, key: &str) -> Result<Arc<ShardNode>> {
        if !self.config.enabled {
            return Ok(Arc::clone(&self.default_node));
        }

        let state = self.state.read();
        if state.ring.is_empty() {
            return Err(Error::NoActiveNode);
        }

        let hash = Self::ring_hash(key);

        // Ceiling lookup with wrap, then walk clockwise past inactive nodes.
        // Bounded by the ring size so an all-inactive ring terminates.
        let walk = state
            .ring
            .range(hash..)
            .chain(state.ring.range(..hash))
            .take(state.ring.len());

        for (_, node) in walk {
            if node.is_active() {
                return Ok(Arc::clone(node));
            }
        }

        debug!("no active node for key {}", key);
        Err(Error::NoActiveNode)
    }

    /// Rebuild the ring from the current node set.
    pub fn rebalance(&self) {
        let mut state = self.state.write();
        let mut ring = BTreeMap::new();
        for node in state.nodes.values() {
            self.place(&mut ring, node);
        }
        state.ring = ring;
        info!(
            "ring rebalanced: {} nodes, {} virtual positions",
            state.nodes.len(),
            state.ring.len()
        );
    }

    /// Advisory: which of `keys` would route differently between two nodes'
    /// ownership. Pure recomputation, no data movement.
    pub fn keys_to_migrate(&self, from_node: &str, to_node: &str, keys: &[String]) -> Vec<String> {
        keys.iter()
            .filter(|key| match self.route_for(key) {
                Ok(node) => node.id == to_node && node.id != from_node,
                Err(_) => false,
            })
            .cloned()
            .collect()
    }

    /// Every physical node, active or not, for whole-tier maintenance
    /// (version purges sweep inactive nodes too once they return).
    pub fn nodes(&self) -> Vec<Arc<ShardNode>> {
        if !self.config.enabled {
            return vec![Arc::clone(&self.default_node)];
        }
        let state = self.state.read();
        let mut nodes: Vec<_> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Read-only topology snapshot.
    pub fn topology(&self) -> Vec<NodeSnapshot> {
        let state = self.state.read();
        let mut snaps: Vec<_> = state
            .nodes
            .values()
            .map(|node| node.snapshot(self.virtual_count(node.weight)))
            .collect();
        snaps.sort_by(|a, b| a.id.cmp(&b.id));
        snaps
    }

    /// Number of physical nodes
    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Number of virtual ring positions
    pub fn virtual_node_count(&self) -> usize {
        self.state.read().ring.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
