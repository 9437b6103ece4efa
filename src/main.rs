//! StrataCache service harness
//!
//! Wires the cache subsystem against an in-memory backend and a synthetic
//! system of record, exposing health and Prometheus metrics endpoints.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                     StrataCache Harness                    │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌───────────┐   ┌─────────────────────┐    │
//! │  │  Filter  │──▶│ Local Tier│──▶│   Versioned Store   │    │
//! │  └──────────┘   └───────────┘   └─────────────────────┘    │
//! │        ▲              ▲                    ▲               │
//! │        └──────────────┴─── Preloader ──────┘               │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratacache::error::{Error, Result};
use stratacache::facade::{CacheFacade, EntitySource, LookupKey, Payload};
use stratacache::filter::{ExistenceFilter, FilterConfig};
use stratacache::local::{LocalTierCache, LocalTierConfig, NamespaceConfig};
use stratacache::preload::{
    AccessTracker, PatternConfig, PreloadConfig, PreloadLoader, PreloadQueue, Preloader,
};
use stratacache::ring::{RouterConfig, ShardRouter};
use stratacache::store::{InMemoryKvBackend, StoreConfig, VersionedStore};

// =============================================================================
// CLI Arguments
// =============================================================================

/// StrataCache - multi-tier read-through cache service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Shard nodes as "id@host:port[@weight]", comma separated
    #[arg(
        long,
        env = "SHARD_NODES",
        default_value = "shard-a@127.0.0.1:7001,shard-b@127.0.0.1:7002"
    )]
    shard_nodes: String,

    /// Disable consistent-hash sharding (route everything to one node)
    #[arg(long, env = "SHARDING_DISABLED")]
    sharding_disabled: bool,

    /// Virtual ring positions per unit of node weight
    #[arg(long, env = "VIRTUAL_NODES_PER_WEIGHT", default_value = "150")]
    virtual_nodes_per_weight: u32,

    /// Local tier overrides as "namespace=max_entries:ttl_seconds",
    /// comma separated (e.g. "list=200:60,detail=1000:600")
    #[arg(long, env = "LOCAL_NAMESPACES", default_value = "")]
    local_namespaces: String,

    /// Keyspace prefix for distributed keys
    #[arg(long, env = "CACHE_KEYSPACE", default_value = "strata")]
    keyspace: String,

    /// Default distributed-tier TTL in seconds
    #[arg(long, env = "CACHE_TTL_SECONDS", default_value = "1800")]
    cache_ttl_seconds: u64,

    /// Expected distinct identities for the existence filter
    #[arg(long, env = "FILTER_EXPECTED_INSERTIONS", default_value = "1000000")]
    filter_expected_insertions: u64,

    /// Target false-positive rate for the existence filter
    #[arg(long, env = "FILTER_FALSE_POSITIVE_RATE", default_value = "0.01")]
    filter_false_positive_rate: f64,

    /// Preload worker count
    #[arg(long, env = "PRELOAD_WORKERS", default_value = "2")]
    preload_workers: usize,

    /// Preload queue capacity
    #[arg(long, env = "PRELOAD_QUEUE_CAPACITY", default_value = "100")]
    preload_queue_capacity: usize,

    /// Accesses before a key becomes preload-eligible
    #[arg(long, env = "PRELOAD_MIN_ACCESS_COUNT", default_value = "3")]
    preload_min_access_count: u64,

    /// Accesses per hour before a key becomes preload-eligible
    #[arg(long, env = "PRELOAD_FREQUENCY_THRESHOLD", default_value = "0.7")]
    preload_frequency_threshold: f64,

    /// Minimum seconds between two scheduled preloads of the same key
    #[arg(long, env = "PRELOAD_COOLDOWN_SECONDS", default_value = "300")]
    preload_cooldown_seconds: u64,

    /// Seconds between eligibility sweeps
    #[arg(long, env = "PRELOAD_ELIGIBILITY_SWEEP_SECONDS", default_value = "300")]
    preload_eligibility_sweep_seconds: u64,

    /// Seconds between stale-pattern sweeps
    #[arg(long, env = "PRELOAD_STALE_SWEEP_SECONDS", default_value = "3600")]
    preload_stale_sweep_seconds: u64,

    /// Synthetic records seeded into the demo source
    #[arg(long, env = "SEED_RECORDS", default_value = "1000")]
    seed_records: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Demo System of Record
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: u64,
    title: String,
    category: String,
}

/// Synthetic source standing in for the real system of record.
struct SeedSource {
    records: Vec<Record>,
}

impl SeedSource {
    fn new(count: u64) -> Self {
        let categories = ["news", "tech", "sport", "culture"];
        let records = (1..=count)
            .map(|id| Record {
                id,
                title: format!("record {}", id),
                category: categories[(id % 4) as usize].to_string(),
            })
            .collect();
        Self { records }
    }

    fn page(items: Vec<Record>, page: u32, page_size: u32) -> Option<Payload<Record>> {
        let start = (page.saturating_sub(1) * page_size) as usize;
        if start >= items.len() {
            return None;
        }
        let end = (start + page_size as usize).min(items.len());
        Some(Payload::Many(items[start..end].to_vec()))
    }
}

#[async_trait]
impl EntitySource<Record> for SeedSource {
    async fn fetch(&self, key: &LookupKey) -> Result<Option<Payload<Record>>> {
        Ok(match key {
            LookupKey::Detail { id } => self
                .records
                .iter()
                .find(|r| r.id == *id)
                .cloned()
                .map(Payload::One),
            LookupKey::List { page, page_size } => {
                Self::page(self.records.clone(), *page, *page_size)
            }
            LookupKey::Category { name, page, page_size } => {
                let filtered: Vec<_> = self
                    .records
                    .iter()
                    .filter(|r| &r.category == name)
                    .cloned()
                    .collect();
                Self::page(filtered, *page, *page_size)
            }
            LookupKey::Aggregate { .. } => {
                Some(Payload::Many(self.records.iter().take(10).cloned().collect()))
            }
        })
    }

    async fn list_identities(&self, offset: u64, limit: u64) -> Result<Vec<u64>> {
        let start = offset as usize;
        if start >= self.records.len() {
            return Ok(vec![]);
        }
        let end = (start + limit as usize).min(self.records.len());
        Ok(self.records[start..end].iter().map(|r| r.id).collect())
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting StrataCache");
    info!("  Shard nodes: {}", args.shard_nodes);
    info!("  Sharding disabled: {}", args.sharding_disabled);
    info!("  Keyspace: {}", args.keyspace);
    info!("  Cache TTL: {} seconds", args.cache_ttl_seconds);
    info!("  Preload workers: {}", args.preload_workers);

    // Shard topology
    let router = Arc::new(ShardRouter::new(RouterConfig {
        enabled: !args.sharding_disabled,
        virtual_nodes_per_weight: args.virtual_nodes_per_weight,
        ..RouterConfig::default()
    }));
    for spec in args.shard_nodes.split(',').filter(|s| !s.is_empty()) {
        let (id, address, weight) = parse_node_spec(spec)?;
        router.add_node(id, address, weight)?;
    }
    info!(
        "Shard ring ready: {} nodes, {} virtual positions",
        router.node_count(),
        router.virtual_node_count()
    );

    // Distributed tier
    let backend = Arc::new(InMemoryKvBackend::new());
    let store = Arc::new(VersionedStore::new(
        Arc::clone(&backend),
        Arc::clone(&router),
        StoreConfig {
            keyspace: args.keyspace.clone(),
            default_ttl: Duration::from_secs(args.cache_ttl_seconds),
            ..StoreConfig::default()
        },
    ));
    store.init_version().await?;

    // Local tier, filter, preload plumbing
    let mut local_config = LocalTierConfig::default();
    for spec in args.local_namespaces.split(',').filter(|s| !s.trim().is_empty()) {
        let ns = parse_namespace_spec(spec)?;
        match local_config.namespaces.iter_mut().find(|n| n.name == ns.name) {
            Some(existing) => *existing = ns,
            None => local_config.namespaces.push(ns),
        }
    }
    let local = Arc::new(LocalTierCache::new(local_config));
    let filter = Arc::new(ExistenceFilter::new(FilterConfig {
        expected_insertions: args.filter_expected_insertions,
        false_positive_rate: args.filter_false_positive_rate,
        ..FilterConfig::default()
    }));

    let preload_config = PreloadConfig {
        workers: args.preload_workers,
        queue_capacity: args.preload_queue_capacity,
        eligibility_sweep_interval: Duration::from_secs(args.preload_eligibility_sweep_seconds),
        stale_sweep_interval: Duration::from_secs(args.preload_stale_sweep_seconds),
        pattern: PatternConfig {
            min_access_count: args.preload_min_access_count,
            frequency_threshold: args.preload_frequency_threshold,
            cooldown: Duration::from_secs(args.preload_cooldown_seconds),
            ..PatternConfig::default()
        },
        ..PreloadConfig::default()
    };
    let tracker = Arc::new(AccessTracker::new(preload_config.pattern.clone()));
    let queue = Arc::new(PreloadQueue::new(preload_config.queue_capacity));

    // Façade over the demo source
    let source = Arc::new(SeedSource::new(args.seed_records));
    let facade = Arc::new(CacheFacade::new(
        filter,
        local,
        store,
        Arc::clone(&router),
        source as Arc<dyn EntitySource<Record>>,
        Arc::clone(&tracker),
        Arc::clone(&queue),
    ));

    match facade.reload_filter().await {
        Ok(count) => info!("Existence filter loaded with {} identities", count),
        Err(e) => warn!("Existence filter reload failed, running degraded: {}", e),
    }

    // Preloader
    let preloader = Arc::new(Preloader::new(preload_config, tracker, queue));
    let preload_handles =
        Arc::clone(&preloader).start(Arc::clone(&facade) as Arc<dyn PreloadLoader>);

    // Metrics export loop
    let gauges = register_gauges()?;
    {
        let facade = Arc::clone(&facade);
        let preloader = Arc::clone(&preloader);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            loop {
                tick.tick().await;
                gauges.update(&facade.observability(preloader.stats()));
            }
        });
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("StrataCache ready");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Signal handler failed: {}", e)))?;

    info!("Shutting down");
    preloader.shutdown();
    futures::future::join_all(preload_handles).await;
    info!("Shutdown complete");
    Ok(())
}

/// Parse a node spec of the form "id@host:port" or "id@host:port@weight".
fn parse_node_spec(spec: &str) -> Result<(String, String, u32)> {
    let parts: Vec<&str> = spec.trim().split('@').collect();
    match parts.as_slice() {
        [id, address] => Ok((id.to_string(), address.to_string(), 1)),
        [id, address, weight] => {
            let weight = weight
                .parse()
                .map_err(|_| Error::Config(format!("Invalid weight in node spec: {}", spec)))?;
            Ok((id.to_string(), address.to_string(), weight))
        }
        _ => Err(Error::Config(format!("Invalid node spec: {}", spec))),
    }
}

/// Parse a local-tier override of the form "namespace=max_entries:ttl_seconds".
fn parse_namespace_spec(spec: &str) -> Result<NamespaceConfig> {
    let invalid = || Error::Config(format!("Invalid namespace spec: {}", spec));

    let (name, rest) = spec.trim().split_once('=').ok_or_else(invalid)?;
    let (max_entries, ttl_seconds) = rest.split_once(':').ok_or_else(invalid)?;
    let max_entries: usize = max_entries.parse().map_err(|_| invalid())?;
    let ttl_seconds: u64 = ttl_seconds.parse().map_err(|_| invalid())?;

    Ok(NamespaceConfig::new(
        name,
        max_entries,
        Duration::from_secs(ttl_seconds),
    ))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("tower=warn".parse().expect("static directive"));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Prometheus Gauges
// =============================================================================

struct Gauges {
    local_hits: prometheus::IntGauge,
    local_misses: prometheus::IntGauge,
    local_entries: prometheus::IntGauge,
    local_evictions: prometheus::IntGauge,
    store_hits: prometheus::IntGauge,
    store_misses: prometheus::IntGauge,
    store_backend_failures: prometheus::IntGauge,
    active_nodes: prometheus::IntGauge,
    filter_rejections: prometheus::IntGauge,
    preload_queue_depth: prometheus::IntGauge,
    preload_executed: prometheus::IntGauge,
    preload_dropped: prometheus::IntGauge,
}

fn register_gauges() -> Result<Gauges> {
    fn gauge(name: &str, help: &str) -> Result<prometheus::IntGauge> {
        prometheus::register_int_gauge!(name, help)
            .map_err(|e| Error::Internal(format!("Metric registration failed: {}", e)))
    }

    Ok(Gauges {
        local_hits: gauge("stratacache_local_hits_total", "Local tier hits")?,
        local_misses: gauge("stratacache_local_misses_total", "Local tier misses")?,
        local_entries: gauge("stratacache_local_entries", "Local tier live entries")?,
        local_evictions: gauge("stratacache_local_evictions_total", "Local tier evictions")?,
        store_hits: gauge("stratacache_store_hits_total", "Distributed tier hits")?,
        store_misses: gauge("stratacache_store_misses_total", "Distributed tier misses")?,
        store_backend_failures: gauge(
            "stratacache_store_backend_failures_total",
            "Degraded backend operations",
        )?,
        active_nodes: gauge("stratacache_active_shard_nodes", "Active shard nodes")?,
        filter_rejections: gauge(
            "stratacache_filter_rejections_total",
            "Lookups short-circuited by the existence filter",
        )?,
        preload_queue_depth: gauge("stratacache_preload_queue_depth", "Queued preload tasks")?,
        preload_executed: gauge("stratacache_preload_executed_total", "Executed preloads")?,
        preload_dropped: gauge("stratacache_preload_dropped_total", "Dropped preload tasks")?,
    })
}

impl Gauges {
    fn update(&self, snap: &stratacache::CacheObservability) {
        self.local_hits.set(snap.local_aggregate.hits as i64);
        self.local_misses.set(snap.local_aggregate.misses as i64);
        self.local_entries.set(snap.local_aggregate.entries as i64);
        self.local_evictions.set(snap.local_aggregate.evictions as i64);
        self.store_hits.set(snap.store.hits as i64);
        self.store_misses.set(snap.store.misses as i64);
        self.store_backend_failures
            .set(snap.store.backend_failures as i64);
        self.active_nodes
            .set(snap.topology.iter().filter(|n| n.active).count() as i64);
        self.filter_rejections.set(snap.filter.rejections as i64);
        self.preload_queue_depth.set(snap.preload.queue_depth as i64);
        self.preload_executed.set(snap.preload.executed as i64);
        self.preload_dropped.set(snap.preload.dropped as i64);
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
