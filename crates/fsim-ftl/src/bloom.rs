//! Bloom filters for the retention-refresh engine.
//!
//! One filter per retention class, probed with packed `(block, layer)`
//! keys. Double hashing: two seeded 64-bit hashes generate the k probe
//! positions. False positives only inflate refresh work; false negatives
//! would lose data and must not occur, so membership of every inserted key
//! is exact.

use serde::Serialize;
use std::hash::{DefaultHasher, Hash, Hasher};

/// Sizing parameters for one filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BloomParams {
    /// Expected number of distinct keys.
    pub projected_elements: u64,
    /// Target false positive probability when sizing from the projection.
    pub false_positive_probability: f64,
    /// Pin the bit-table size instead of deriving it; 0 means derive.
    pub pinned_bits: u64,
    /// Hash seed; each filter in a bank gets its own.
    pub seed: u64,
}

impl Default for BloomParams {
    fn default() -> Self {
        Self {
            projected_elements: 10_000,
            false_positive_probability: 1.0e-6,
            pinned_bits: 0,
            seed: 0,
        }
    }
}

impl BloomParams {
    /// Optimal `(bits, hashes)` for the projection, or the pinned size with
    /// the hash count re-derived for it.
    #[must_use]
    fn table_shape(&self) -> (u64, u32) {
        let n = self.projected_elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = if self.pinned_bits > 0 {
            self.pinned_bits
        } else {
            let p = self.false_positive_probability.clamp(1.0e-15, 0.5);
            (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64
        }
        .max(64);
        let hashes = ((bits as f64 / n) * ln2).round().clamp(1.0, 64.0) as u32;
        (bits, hashes)
    }
}

/// Counters kept per filter for the statistics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BloomCounters {
    pub insertions: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
}

#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    bits: u64,
    hashes: u32,
    seed: u64,
    counters: BloomCounters,
}

impl BloomFilter {
    #[must_use]
    pub fn new(params: &BloomParams) -> Self {
        let (bits, hashes) = params.table_shape();
        Self {
            words: vec![0; bits.div_ceil(64) as usize],
            bits,
            hashes,
            seed: params.seed,
            counters: BloomCounters::default(),
        }
    }

    #[must_use]
    pub fn size_bits(&self) -> u64 {
        self.bits
    }

    #[must_use]
    pub fn hash_count(&self) -> u32 {
        self.hashes
    }

    #[must_use]
    pub fn counters(&self) -> BloomCounters {
        self.counters
    }

    fn hash_pair(&self, key: u64) -> (u64, u64) {
        let mut h1 = DefaultHasher::new();
        (self.seed, key).hash(&mut h1);
        let h1 = h1.finish();
        let mut h2 = DefaultHasher::new();
        (key, !self.seed).hash(&mut h2);
        // An even stride would cycle over half the table; force odd.
        let h2 = h2.finish() | 1;
        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, round: u32) -> (usize, u32) {
        let bit = h1.wrapping_add(h2.wrapping_mul(u64::from(round))) % self.bits;
        ((bit / 64) as usize, (bit % 64) as u32)
    }

    pub fn insert(&mut self, key: u64) {
        let (h1, h2) = self.hash_pair(key);
        for round in 0..self.hashes {
            let (word, bit) = self.bit_position(h1, h2, round);
            self.words[word] |= 1 << bit;
        }
        self.counters.insertions += 1;
    }

    /// Membership probe: false means definitely absent, true means possibly
    /// present.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        let (h1, h2) = self.hash_pair(key);
        (0..self.hashes).all(|round| {
            let (word, bit) = self.bit_position(h1, h2, round);
            self.words[word] >> bit & 1 == 1
        })
    }

    pub fn clear(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
        self.counters = BloomCounters::default();
    }

    pub fn note_true_positive(&mut self) {
        self.counters.true_positives += 1;
    }

    pub fn note_false_positive(&mut self) {
        self.counters.false_positives += 1;
    }

    pub fn note_true_negative(&mut self) {
        self.counters.true_negatives += 1;
    }
}
