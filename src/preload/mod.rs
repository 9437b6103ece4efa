//! Predictive Preloader
//!
//! Watches access patterns and warms the cache ahead of demand: hot keys
//! produce preload tasks (next page, sibling category pages, related
//! records) that a fixed worker pool executes through the same population
//! path as a read miss.
//!
//! Background loops run on `tokio::time::interval` under a
//! `CancellationToken`: an eligibility sweep every few minutes schedules
//! hot keys independent of traffic, and an hourly sweep evicts patterns
//! that have gone cold.

mod pattern;
mod queue;

pub use pattern::{AccessTracker, PatternConfig};
pub use queue::{PreloadKind, PreloadQueue, PreloadTask};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;

/// Executes preload work and plans it from hot keys.
///
/// Implemented by the cache façade: `plan` maps a hot logical key to a
/// task, `load` fetches from the system of record and populates both tiers
/// exactly like a read miss.
#[async_trait]
pub trait PreloadLoader: Send + Sync {
    /// Map a hot key and its access frequency to a preload task, or `None`
    /// when the key's shape carries nothing worth warming.
    fn plan(&self, key: &str, frequency: f64) -> Option<PreloadTask>;

    /// Execute one preload task.
    async fn load(&self, task: &PreloadTask) -> Result<()>;
}

/// Preloader configuration
#[derive(Debug, Clone)]
pub struct PreloadConfig {
    /// Worker tasks consuming the queue
    pub workers: usize,
    /// Queue capacity; overflow drops low-value tasks
    pub queue_capacity: usize,
    /// Worker poll interval when the queue is empty
    pub poll_interval: Duration,
    /// Interval of the eligibility sweep
    pub eligibility_sweep_interval: Duration,
    /// Interval of the stale-pattern sweep
    pub stale_sweep_interval: Duration,
    /// Access pattern thresholds
    pub pattern: PatternConfig,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 100,
            poll_interval: Duration::from_secs(1),
            eligibility_sweep_interval: Duration::from_secs(300),
            stale_sweep_interval: Duration::from_secs(3600),
            pattern: PatternConfig::default(),
        }
    }
}

/// Worker pool and background sweeps over the tracker and queue.
pub struct Preloader {
    config: PreloadConfig,
    tracker: Arc<AccessTracker>,
    queue: Arc<PreloadQueue>,
    shutdown: CancellationToken,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl Preloader {
    /// Create a preloader over a shared tracker and queue.
    pub fn new(
        config: PreloadConfig,
        tracker: Arc<AccessTracker>,
        queue: Arc<PreloadQueue>,
    ) -> Self {
        Self {
            config,
            tracker,
            queue,
            shutdown: CancellationToken::new(),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Spawn the worker pool and sweep loop. Tasks run until
    /// [`shutdown`](Self::shutdown) is called.
    pub fn start(self: Arc<Self>, loader: Arc<dyn PreloadLoader>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers + 1);

        for worker_id in 0..self.config.workers {
            let this = Arc::clone(&self);
            let loader = Arc::clone(&loader);
            handles.push(tokio::spawn(async move {
                this.worker(worker_id, loader).await;
            }));
        }

        info!("preloader started with {} workers", self.config.workers);

        let this = self;
        handles.push(tokio::spawn(async move {
            this.run_sweeps(loader).await;
        }));

        handles
    }

    /// Request a clean stop of every worker and sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn worker(&self, worker_id: usize, loader: Arc<dyn PreloadLoader>) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("preload worker {} stopping", worker_id);
                return;
            }

            match self.queue.pop() {
                Some(task) => match loader.load(&task).await {
                    Ok(()) => {
                        self.executed.fetch_add(1, Ordering::Relaxed);
                        debug!("preloaded {} ({:?})", task.key, task.kind);
                    }
                    Err(e) => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("preload of {} failed: {}", task.key, e);
                    }
                },
                None => {
                    // Timeout-bounded wait so shutdown is observed promptly
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    #[instrument(skip(self, loader))]
    async fn run_sweeps(&self, loader: Arc<dyn PreloadLoader>) {
        let mut eligibility = tokio::time::interval(self.config.eligibility_sweep_interval);
        let mut stale = tokio::time::interval(self.config.stale_sweep_interval);
        // Consume the immediate first ticks; sweeps begin one interval in
        eligibility.tick().await;
        stale.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("preload sweep loop stopping");
                    return;
                }
                _ = eligibility.tick() => self.sweep_eligible(&*loader),
                _ = stale.tick() => {
                    self.tracker.evict_stale();
                }
            }
        }
    }

    /// Schedule every currently eligible key, independent of live traffic.
    fn sweep_eligible(&self, loader: &dyn PreloadLoader) {
        let eligible = self.tracker.eligible_keys();
        if eligible.is_empty() {
            return;
        }
        let mut scheduled = 0;
        for (key, frequency) in eligible {
            if let Some(task) = loader.plan(&key, frequency) {
                if self.queue.push(task) {
                    self.tracker.mark_scheduled(&key);
                    scheduled += 1;
                }
            }
        }
        debug!("eligibility sweep scheduled {} preloads", scheduled);
    }

    /// Counters for the observability surface.
    pub fn stats(&self) -> PreloadStats {
        PreloadStats {
            queue_depth: self.queue.depth(),
            scheduled: self.queue.scheduled(),
            dropped: self.queue.dropped(),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            tracked_keys: self.tracker.tracked_keys(),
        }
    }
}

/// Preloader counters
#[derive(Debug, Clone)]
pub struct PreloadStats {
    /// Tasks currently queued
    pub queue_depth: usize,
    /// Tasks ever accepted into the queue
    pub scheduled: u64,
    /// Tasks dropped at overflow
    pub dropped: u64,
    /// Tasks executed successfully
    pub executed: u64,
    /// Tasks whose execution failed
    pub failed: u64,
    /// Access patterns currently tracked
    pub tracked_keys: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingLoader {
        loaded: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingLoader {
        fn new() -> Self {
            Self {
                loaded: Mutex::new(vec![]),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl PreloadLoader for RecordingLoader {
        fn plan(&self, key: &str, frequency: f64) -> Option<PreloadTask> {
            Some(PreloadTask {
                key: key.to_string(),
                kind: PreloadKind::Related { id: 0 },
                priority: frequency,
            })
        }

        async fn load(&self, task: &PreloadTask) -> Result<()> {
            if self.fail {
                return Err(crate::error::Error::Source("boom".into()));
            }
            self.loaded.lock().push(task.key.clone());
            Ok(())
        }
    }

    fn fast_config() -> PreloadConfig {
        PreloadConfig {
            workers: 2,
            queue_capacity: 10,
            poll_interval: Duration::from_millis(10),
            eligibility_sweep_interval: Duration::from_millis(30),
            stale_sweep_interval: Duration::from_secs(3600),
            pattern: PatternConfig::default(),
        }
    }

    fn preloader(config: PreloadConfig) -> Arc<Preloader> {
        let tracker = Arc::new(AccessTracker::new(config.pattern.clone()));
        let queue = Arc::new(PreloadQueue::new(config.queue_capacity));
        Arc::new(Preloader::new(config, tracker, queue))
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let preloader = preloader(fast_config());
        let loader = Arc::new(RecordingLoader::new());

        for i in 0..5 {
            preloader.queue.push(PreloadTask {
                key: format!("k{}", i),
                kind: PreloadKind::Related { id: i },
                priority: 1.0,
            });
        }

        let handles = Arc::clone(&preloader).start(Arc::clone(&loader) as Arc<dyn PreloadLoader>);
        tokio::time::sleep(Duration::from_millis(100)).await;
        preloader.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(loader.loaded.lock().len(), 5);
        assert_eq!(preloader.stats().executed, 5);
        assert_eq!(preloader.stats().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_failed_loads_counted() {
        let preloader = preloader(fast_config());
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(vec![]),
            fail: true,
        });

        preloader.queue.push(PreloadTask {
            key: "k".to_string(),
            kind: PreloadKind::Related { id: 0 },
            priority: 1.0,
        });

        let handles = Arc::clone(&preloader).start(loader);
        tokio::time::sleep(Duration::from_millis(100)).await;
        preloader.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = preloader.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.executed, 0);
    }

    #[tokio::test]
    async fn test_eligibility_sweep_schedules_hot_keys() {
        let preloader = preloader(fast_config());
        let loader = Arc::new(RecordingLoader::new());

        // Hot enough to be eligible, but never pushed directly
        for _ in 0..5 {
            preloader.tracker.record_access("hot-key");
        }

        let handles = Arc::clone(&preloader).start(Arc::clone(&loader) as Arc<dyn PreloadLoader>);
        tokio::time::sleep(Duration::from_millis(200)).await;
        preloader.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let loaded = loader.loaded.lock();
        assert!(loaded.contains(&"hot-key".to_string()));
        // Cooldown was stamped at scheduling, so repeated sweeps did not
        // re-enqueue the same key
        assert_eq!(loaded.iter().filter(|k| *k == "hot-key").count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let preloader = preloader(PreloadConfig {
            poll_interval: Duration::from_secs(60),
            ..fast_config()
        });
        let loader = Arc::new(RecordingLoader::new());

        let handles = Arc::clone(&preloader).start(loader);
        tokio::time::sleep(Duration::from_millis(20)).await;
        preloader.shutdown();

        // Workers parked on a long poll must still observe cancellation
        let joined = tokio::time::timeout(Duration::from_secs(2), async {
            for handle in handles {
                handle.await.unwrap();
            }
        })
        .await;
        assert!(joined.is_ok());
    }
}
