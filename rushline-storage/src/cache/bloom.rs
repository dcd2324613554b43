//! Bloom pre-filter against cache penetration.
//!
//! Ids the filter has never seen are answered absent before the cache or the
//! loader is touched. False positives fall through to the normal policy;
//! there are no false negatives for inserted ids.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free bloom filter with sha2-derived double hashing.
pub struct BloomFilter {
    words: Vec<AtomicU64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at the given false-positive rate.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let num_bits = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        let num_words = num_bits.div_ceil(64) as usize;

        Self {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            num_bits,
            num_hashes,
        }
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn insert(&self, item: &str) {
        for bit in self.positions(item) {
            self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    pub fn might_contain(&self, item: &str) -> bool {
        self.positions(item).all(|bit| {
            self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(item.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[0..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        // Odd step so probes cover the table.
        let h2 = u64::from_le_bytes(second) | 1;

        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sizing() {
        let filter = BloomFilter::new(1_000, 0.01);
        // ~9.6 bits per item and ~7 hashes at 1%
        assert!(filter.num_bits() >= 9_000 && filter.num_bits() <= 10_000);
        assert_eq!(filter.num_hashes(), 7);
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let filter = BloomFilter::new(1_000, 0.01);
        for i in 0..1_000 {
            filter.insert(&format!("cache:shop:{}", i));
        }
        let false_positives = (1_000..11_000)
            .filter(|i| filter.might_contain(&format!("cache:shop:{}", i)))
            .count();
        assert!(false_positives < 300, "{} false positives", false_positives);
    }

    proptest! {
        #[test]
        fn prop_no_false_negatives(items in proptest::collection::vec("[a-z0-9:]{1,24}", 1..200)) {
            let filter = BloomFilter::new(items.len(), 0.01);
            for item in &items {
                filter.insert(item);
            }
            for item in &items {
                prop_assert!(filter.might_contain(item));
            }
        }
    }
}
