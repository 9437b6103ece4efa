//! StrataCache - Multi-Tier Read-Through Cache
//!
//! A caching subsystem that fronts a slow system of record with layered
//! read-through tiers: a probabilistic existence filter, bounded in-process
//! namespace caches, and a distributed key/value tier routed by a weighted
//! consistent-hash ring, plus a predictive preloader that warms the cache
//! ahead of observed access patterns.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Cache Façade                             │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────────┐     │
//! │  │ Existence  │──▶│ Local Tier │──▶│    Versioned Store     │──▶ source
//! │  │  Filter    │   │ (per-ns)   │   │ (ring-routed backend)  │     │
//! │  └────────────┘   └────────────┘   └────────────────────────┘     │
//! │        ▲                ▲                      ▲                  │
//! │        └────────────────┴──── Preloader ───────┘                  │
//! │                     (pattern tracker + worker pool)               │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Degradation
//!
//! Every tier fails soft: a degraded filter answers "possibly present", a
//! backend failure reads as a miss, and an exhausted shard topology drops
//! straight through to the source with caching skipped. Only configuration
//! mistakes surface as errors.
//!
//! # Modules
//!
//! - [`error`] - Error types
//! - [`facade`] - Read-through orchestration and lookup key grammar
//! - [`filter`] - Probabilistic existence filter
//! - [`local`] - In-process namespace caches
//! - [`preload`] - Access tracking and predictive preloading
//! - [`ring`] - Weighted consistent-hash shard router
//! - [`store`] - Versioned distributed tier

pub mod error;
pub mod facade;
pub mod filter;
pub mod local;
pub mod preload;
pub mod ring;
pub mod store;

// Re-export commonly used types
pub use error::{Error, Result};
pub use facade::{CacheFacade, CacheObservability, EntitySource, LookupKey, Payload};
pub use filter::{ExistenceFilter, FilterConfig, FilterHealth};
pub use local::{LocalTierCache, LocalTierConfig, NamespaceConfig};
pub use preload::{AccessTracker, PreloadConfig, Preloader, PreloadQueue};
pub use ring::{RouterConfig, ShardNode, ShardRouter};
pub use store::{InMemoryKvBackend, KvBackend, StoreConfig, VersionedStore, SCHEMA_VERSION};
