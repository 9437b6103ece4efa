//! Bloom Bit Array
//!
//! Fixed-capacity probabilistic membership structure backed by a lock-free
//! array of atomic words. Append-only for its lifetime; replaced wholesale
//! on reload.
//!
//! # Design
//!
//! - Bit and hash counts derived from expected insertions and target
//!   false-positive rate with the standard sizing formulas
//! - Double hashing: two 64-bit halves of a truncated Sha256 digest generate
//!   all k probe positions
//! - `AtomicU64` words allow concurrent `set` without a lock

use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

/// Fixed-size bloom bit array.
pub struct BloomBits {
    /// Bit storage, 64 bits per word
    words: Vec<AtomicU64>,
    /// Total number of bits
    bit_count: u64,
    /// Number of probe positions per element
    hash_count: u32,
    /// Number of elements inserted
    inserted: AtomicU64,
}

impl BloomBits {
    /// Create a bit array sized for `expected_insertions` elements at the
    /// given false-positive rate.
    pub fn sized_for(expected_insertions: u64, false_positive_rate: f64) -> Self {
        let n = expected_insertions.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        // m = -n*ln(p) / ln(2)^2, k = m/n * ln(2)
        let ln2 = std::f64::consts::LN_2;
        let bit_count = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let hash_count = ((bit_count as f64 / n) * ln2).round().max(1.0) as u32;

        let word_count = bit_count.div_ceil(64) as usize;
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        Self {
            words,
            bit_count,
            hash_count,
            inserted: AtomicU64::new(0),
        }
    }

    /// Derive the two base hashes for an element.
    #[inline]
    fn hash_pair(element: &[u8]) -> (u64, u64) {
        let digest = Sha256::digest(element);
        let h1 = u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_be_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
        (h1, h2 | 1) // odd step avoids degenerate cycles
    }

    /// Insert an element.
    pub fn set(&self, element: &[u8]) {
        let (h1, h2) = Self::hash_pair(element);
        for i in 0..self.hash_count {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bit_count;
            let word = &self.words[(bit / 64) as usize];
            word.fetch_or(1u64 << (bit % 64), Ordering::Relaxed);
        }
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// Test for possible membership. `false` means definitely absent.
    pub fn test(&self, element: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(element);
        for i in 0..self.hash_count {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.bit_count;
            let word = self.words[(bit / 64) as usize].load(Ordering::Relaxed);
            if word & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of bits in the array
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Number of probe positions per element
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Number of elements inserted since construction
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
