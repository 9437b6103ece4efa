//! Bounded priority queue for preload work
//!
//! Highest-priority task out first; FIFO among equal priorities. Overflow
//! never blocks: the incoming task either displaces the lowest-value queued
//! task or is itself dropped, silently.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// What a preload task should warm
#[derive(Debug, Clone, PartialEq)]
pub enum PreloadKind {
    /// A list page was hot: warm the page after it
    NextPage {
        /// Page that was accessed
        page: u32,
        /// Page size of the access
        page_size: u32,
    },
    /// A category page was hot: warm the page and its successor
    SiblingPages {
        /// Category name
        category: String,
        /// Page that was accessed
        page: u32,
        /// Page size of the access
        page_size: u32,
    },
    /// A detail record was hot: re-warm it and its surrounding context
    Related {
        /// Record identity
        id: u64,
    },
}

/// One unit of preload work
#[derive(Debug, Clone)]
pub struct PreloadTask {
    /// Logical key whose access pattern produced this task
    pub key: String,
    /// What to warm
    pub kind: PreloadKind,
    /// Access frequency at scheduling time; higher wins under contention
    pub priority: f64,
}

/// Total-order bits for an f64 priority so tasks can live in a BTreeMap.
#[inline]
fn priority_bits(priority: f64) -> u64 {
    let bits = priority.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

struct QueueInner {
    // Key: (priority bits, inverted sequence) so the map's last entry is
    // the highest priority, oldest-first among equals
    tasks: BTreeMap<(u64, u64), PreloadTask>,
    sequence: u64,
}

/// Bounded, non-blocking max-priority queue.
pub struct PreloadQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    scheduled: AtomicU64,
    dropped: AtomicU64,
}

impl PreloadQueue {
    /// Create a queue holding at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner {
                tasks: BTreeMap::new(),
                sequence: 0,
            }),
            scheduled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a task. Returns whether it was accepted.
    ///
    /// At capacity, the queued minimum is evicted when the incoming task
    /// outranks it; otherwise the incoming task is dropped.
    pub fn push(&self, task: PreloadTask) -> bool {
        let mut inner = self.inner.lock();
        let bits = priority_bits(task.priority);

        if inner.tasks.len() >= self.capacity {
            let evict = match inner.tasks.keys().next() {
                Some(&(min_bits, _)) if bits > min_bits => Some(min_bits),
                _ => None,
            };
            match evict {
                Some(_) => {
                    if let Some((min_key, dropped)) = inner.tasks.pop_first() {
                        debug!(
                            "preload queue full, displacing {} (priority bits {})",
                            dropped.key, min_key.0
                        );
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    debug!("preload queue full, dropping incoming {}", task.key);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }

        inner.sequence += 1;
        let seq = u64::MAX - inner.sequence;
        inner.tasks.insert((bits, seq), task);
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the highest-priority task, if any.
    pub fn pop(&self) -> Option<PreloadTask> {
        self.inner.lock().tasks.pop_last().map(|(_, task)| task)
    }

    /// Tasks currently queued
    pub fn depth(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Tasks ever accepted
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Tasks dropped at overflow (incoming or displaced)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn task(key: &str, priority: f64) -> PreloadTask {
        PreloadTask {
            key: key.to_string(),
            kind: PreloadKind::Related { id: 1 },
            priority,
        }
    }

    #[test]
    fn test_pop_highest_first() {
        let queue = PreloadQueue::new(10);

        queue.push(task("low", 1.0));
        queue.push(task("high", 9.0));
        queue.push(task("mid", 5.0));

        assert_eq!(queue.pop().unwrap().key, "high");
        assert_eq!(queue.pop().unwrap().key, "mid");
        assert_eq!(queue.pop().unwrap().key, "low");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_among_equal_priorities() {
        let queue = PreloadQueue::new(10);

        queue.push(task("first", 2.0));
        queue.push(task("second", 2.0));
        queue.push(task("third", 2.0));

        assert_eq!(queue.pop().unwrap().key, "first");
        assert_eq!(queue.pop().unwrap().key, "second");
        assert_eq!(queue.pop().unwrap().key, "third");
    }

    #[test]
    fn test_overflow_drops_incoming_when_outranked() {
        let queue = PreloadQueue::new(2);

        assert!(queue.push(task("a", 5.0)));
        assert!(queue.push(task("b", 6.0)));
        assert!(!queue.push(task("c", 1.0)));

        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap().key, "b");
        assert_eq!(queue.pop().unwrap().key, "a");
    }

    #[test]
    fn test_overflow_displaces_queued_minimum() {
        let queue = PreloadQueue::new(2);

        queue.push(task("weak", 1.0));
        queue.push(task("strong", 6.0));
        assert!(queue.push(task("stronger", 9.0)));

        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap().key, "stronger");
        assert_eq!(queue.pop().unwrap().key, "strong");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_counters() {
        let queue = PreloadQueue::new(1);

        queue.push(task("a", 1.0));
        queue.push(task("b", 2.0)); // displaces a
        queue.push(task("c", 0.5)); // dropped incoming

        assert_eq!(queue.scheduled(), 2);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_priority_bits_ordering() {
        assert!(priority_bits(2.0) > priority_bits(1.0));
        assert!(priority_bits(1.0) > priority_bits(0.0));
        assert!(priority_bits(0.5) > priority_bits(0.1));
        assert!(priority_bits(0.0) > priority_bits(-1.0));
    }
}
