//! Key decoration and ordering
//!
//! The partitioner defines the total order that every layer of the engine
//! agrees on: memtable maps, segment append order, sparse index search and
//! compaction merging all compare decorated keys, never raw ones.

use std::cmp::Ordering;
use std::hash::{BuildHasher, Hash, Hasher};

/// Maps raw row keys to decorated keys and defines their total order.
pub trait Partitioner: Send + Sync {
    /// Produce the on-disk form of a key. Decoration must be deterministic
    /// across process restarts since decorated keys are persisted.
    fn decorate_key(&self, key: &str) -> String;

    /// Recover the raw key from its decorated form.
    fn undecorate_key(&self, decorated: &str) -> String;

    /// Compare two decorated keys.
    ///
    /// Contract: this must agree with the lexicographic order of the
    /// decorated strings. Memtable maps, the segment writer's ascending
    /// check and the compaction merge all order decorated keys with plain
    /// string comparison; an implementation that disagrees would desync
    /// them from index search. Encode any custom order into the decorated
    /// form itself, as `RandomPartitioner` does with its token prefix.
    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.cmp(b)
    }
}

/// Spreads keys uniformly by prefixing a fixed-width hash token. Decorated
/// form is `"{token:016x}:{key}"`, so plain string comparison orders by
/// token first and raw key second.
pub struct RandomPartitioner {
    hasher: ahash::RandomState,
}

impl RandomPartitioner {
    pub fn new() -> Self {
        // Fixed seeds: tokens are persisted and must not change between runs
        Self {
            hasher: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    fn token(&self, key: &str) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for RandomPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner for RandomPartitioner {
    fn decorate_key(&self, key: &str) -> String {
        format!("{:016x}:{}", self.token(key), key)
    }

    fn undecorate_key(&self, decorated: &str) -> String {
        match decorated.split_once(':') {
            Some((_, raw)) => raw.to_string(),
            None => decorated.to_string(),
        }
    }
}

/// Identity decoration: keys order by their natural string order, enabling
/// meaningful range scans at the cost of hot-spot sensitivity.
pub struct OrderPreservingPartitioner;

impl Partitioner for OrderPreservingPartitioner {
    fn decorate_key(&self, key: &str) -> String {
        key.to_string()
    }

    fn undecorate_key(&self, decorated: &str) -> String {
        decorated.to_string()
    }
}
