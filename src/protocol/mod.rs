//! Text protocol: tokenizer, command dispatch, and the managed-mode bucket
//! table.

pub mod handler;
pub mod parser;

use std::sync::atomic::{AtomicU32, Ordering};

/// Longest key the protocol accepts.
pub const KEY_MAX_LENGTH: usize = 250;

/// Bucket count for a managed instance.
pub const MAX_BUCKETS: usize = 32768;

/// Bucket -> owning generation for a managed instance.
///
/// Reads are unlocked single-word loads; writes are idempotent, so torn
/// interleavings are harmless.
pub struct BucketTable {
    gens: Vec<AtomicU32>,
}

impl BucketTable {
    pub fn new() -> BucketTable {
        BucketTable {
            gens: (0..MAX_BUCKETS).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn generation(&self, bucket: usize) -> u32 {
        self.gens[bucket].load(Ordering::Relaxed)
    }

    pub fn set_generation(&self, bucket: usize, gen: u32) {
        self.gens[bucket].store(gen, Ordering::Relaxed);
    }

    /// Buckets with a non-zero owning generation, for `stats buckets`.
    pub fn owned(&self) -> Vec<(usize, u32)> {
        self.gens
            .iter()
            .enumerate()
            .filter_map(|(bucket, gen)| {
                let gen = gen.load(Ordering::Relaxed);
                (gen != 0).then_some((bucket, gen))
            })
            .collect()
    }
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ownership_round_trip() {
        let table = BucketTable::new();
        assert_eq!(table.generation(7), 0);
        table.set_generation(7, 3);
        assert_eq!(table.generation(7), 3);
        assert_eq!(table.owned(), vec![(7, 3)]);
        table.set_generation(7, 0);
        assert!(table.owned().is_empty());
    }
}
