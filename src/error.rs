//! Error types for the cache subsystem

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache subsystem.
///
/// Degraded-mode conditions (backend unreachable for a single operation,
/// filter init/reload failure, version-mismatch decode) are deliberately
/// *not* represented here: they are logged and treated as cache misses so
/// callers fall through to the system of record. Only configuration errors
/// and exhausted-topology conditions surface to the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Shard Topology Errors
    // =========================================================================
    /// Node weight below the minimum of 1
    #[error("Invalid weight {weight} for node {node_id}: weight must be >= 1")]
    InvalidWeight { node_id: String, weight: u32 },

    /// Node id already present in the topology
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// Node id not present in the topology
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Every node in the ring is marked inactive.
    ///
    /// Distinct from a miss: the caller should skip caching rather than
    /// treat the key as confirmed absent.
    #[error("No active shard node available")]
    NoActiveNode,

    // =========================================================================
    // External Collaborators
    // =========================================================================
    /// Distributed backend operation failed
    #[error("Backend error: {0}")]
    Backend(String),

    /// System-of-record fetch failed
    #[error("Source error: {0}")]
    Source(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
