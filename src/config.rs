//! Engine configuration
//!
//! ## Tuning knobs
//! - Memtable thresholds control how much data buffers in memory before a
//!   flush is triggered (bytes and object count, whichever trips first)
//! - `index_interval` trades segment index memory for lookup scan length
//! - `column_index_size_bytes` bounds how many column bytes a reader must
//!   scan inside a single row before the per-row index narrows the seek

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a [`Table`](crate::Table) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding segment files and table metadata
    pub data_dir: PathBuf,

    /// Directory holding commit log files
    pub commitlog_dir: PathBuf,

    /// Memtable flush threshold in bytes
    pub memtable_threshold_bytes: usize,

    /// Memtable flush threshold in column objects
    pub memtable_threshold_objects: usize,

    /// Commit log rotation threshold in bytes
    pub log_rotation_threshold_bytes: u64,

    /// Minimum serialized block size covered by one column index entry
    pub column_index_size_bytes: usize,

    /// Bits allocated per element in bloom filters (10 gives ~1% FPR)
    pub bloom_bits_per_element: usize,

    /// One sparse index entry is kept per this many rows in a segment
    pub index_interval: usize,

    /// Tombstones older than this many seconds are purged by compaction
    pub gc_grace_seconds: i64,

    /// Number of segments that triggers a background compaction
    pub compaction_segment_threshold: usize,

    /// Capacity of the per-segment key position cache
    pub key_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            commitlog_dir: PathBuf::from("./commitlog"),
            memtable_threshold_bytes: 32 * 1024 * 1024,
            memtable_threshold_objects: 100_000,
            log_rotation_threshold_bytes: 128 * 1024 * 1024,
            column_index_size_bytes: 64 * 1024,
            bloom_bits_per_element: 10,
            index_interval: 128,
            gc_grace_seconds: 10 * 24 * 3600,
            compaction_segment_threshold: 4,
            key_cache_size: 1024,
        }
    }
}

impl Config {
    /// Config rooted at the given directory (segments under `data/`,
    /// commit logs under `commitlog/`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            commitlog_dir: root.join("commitlog"),
            ..Self::default()
        }
    }

    /// Small thresholds for memory-constrained deployments.
    pub fn low_memory(root: impl Into<PathBuf>) -> Self {
        Self {
            memtable_threshold_bytes: 4 * 1024 * 1024,
            memtable_threshold_objects: 10_000,
            log_rotation_threshold_bytes: 16 * 1024 * 1024,
            key_cache_size: 128,
            ..Self::new(root)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.index_interval, 128);
        assert!(config.memtable_threshold_bytes > 0);
        assert!(config.gc_grace_seconds > 0);
    }

    #[test]
    fn test_rooted_config() {
        let config = Config::new("/tmp/cfstore");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/cfstore/data"));
        assert_eq!(config.commitlog_dir, PathBuf::from("/tmp/cfstore/commitlog"));
    }

    #[test]
    fn test_low_memory_preset() {
        let config = Config::low_memory("/tmp/cfstore");
        assert!(config.memtable_threshold_bytes < Config::default().memtable_threshold_bytes);
    }
}
