//! Segment reader
//!
//! Readers are immutable and shared behind `Arc`. A key lookup goes bloom
//! filter, then binary search of the in-memory sparse index, then a bounded
//! forward scan of at most one index interval of rows. Exact hits are
//! remembered in a small LRU cache so hot keys skip the scan.
//!
//! A reader compacted away marks itself; its files are removed only when
//! the last reference drops, so in-flight reads always finish.

use super::row_iter::SSTableScanner;
use super::{
    deserialize_row_body, read_row_prelude, sibling_path, KeyPosition, RowPrelude, SegmentName,
    FILTER_SUFFIX, INDEX_SUFFIX,
};
use crate::bloom::BloomFilter;
use crate::config::Config;
use crate::encoding;
use crate::model::{ColumnFamily, ColumnFamilyKind};
use crate::partitioner::Partitioner;
use crate::{Result, StorageError};
use lru::LruCache;
use std::cmp::Ordering as CmpOrdering;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub struct SSTableReader {
    data_path: PathBuf,
    index_path: PathBuf,
    filter_path: PathBuf,

    cf_name: String,
    kind: ColumnFamilyKind,
    file_index: u64,

    /// Every `index_interval`-th decorated key with its data offset
    sparse: Vec<KeyPosition>,
    bloom: BloomFilter,
    partitioner: Arc<dyn Partitioner>,
    index_interval: usize,
    data_len: u64,

    /// Exact decorated key -> row offset, for hot keys
    key_cache: Mutex<LruCache<String, u64>>,

    /// Set when compaction supersedes this segment; files are removed
    /// on drop once no reads remain
    compacted: AtomicBool,
}

impl SSTableReader {
    /// Open an existing segment from its data file path, loading the
    /// sparse index and bloom filter from the sibling files.
    pub fn open(
        data_path: impl Into<PathBuf>,
        kind: ColumnFamilyKind,
        partitioner: Arc<dyn Partitioner>,
        config: &Config,
    ) -> Result<Self> {
        let data_path = data_path.into();
        let name = data_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(SegmentName::parse)
            .ok_or_else(|| {
                StorageError::Segment(format!("unparseable segment name: {:?}", data_path))
            })?;

        let index_path = sibling_path(&data_path, INDEX_SUFFIX)?;
        let filter_path = sibling_path(&data_path, FILTER_SUFFIX)?;

        let index_bytes = std::fs::read(&index_path)?;
        let mut sparse = Vec::new();
        let mut cur = Cursor::new(&index_bytes);
        while (cur.position() as usize) < index_bytes.len() {
            let key = encoding::read_string(&mut cur)?;
            let offset = encoding::read_u64(&mut cur)?;
            sparse.push(KeyPosition { key, offset });
        }

        let bloom = BloomFilter::from_bytes(&std::fs::read(&filter_path)?)?;
        let data_len = std::fs::metadata(&data_path)?.len();

        Ok(Self {
            data_path,
            index_path,
            filter_path,
            cf_name: name.cf,
            kind,
            file_index: name.index,
            sparse,
            bloom,
            partitioner,
            index_interval: config.index_interval,
            data_len,
            key_cache: Mutex::new(LruCache::new(cache_capacity(config))),
            compacted: AtomicBool::new(false),
        })
    }

    /// Build a reader from a just-closed writer's in-memory parts.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn from_parts(
        data_path: PathBuf,
        cf_name: String,
        kind: ColumnFamilyKind,
        file_index: u64,
        sparse: Vec<KeyPosition>,
        bloom: BloomFilter,
        partitioner: Arc<dyn Partitioner>,
        config: &Config,
    ) -> Result<Self> {
        let index_path = sibling_path(&data_path, INDEX_SUFFIX)?;
        let filter_path = sibling_path(&data_path, FILTER_SUFFIX)?;
        let data_len = std::fs::metadata(&data_path)?.len();
        Ok(Self {
            data_path,
            index_path,
            filter_path,
            cf_name,
            kind,
            file_index,
            sparse,
            bloom,
            partitioner,
            index_interval: config.index_interval,
            data_len,
            key_cache: Mutex::new(LruCache::new(cache_capacity(config))),
            compacted: AtomicBool::new(false),
        })
    }

    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub fn kind(&self) -> ColumnFamilyKind {
        self.kind
    }

    pub fn file_index(&self) -> u64 {
        self.file_index
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Upper bound on the number of rows, from the sparse index.
    pub fn row_count_estimate(&self) -> usize {
        self.sparse.len() * self.index_interval
    }

    /// Data file offset of the row for `decorated_key`, or `None`.
    pub fn position_of(&self, decorated_key: &str) -> Result<Option<u64>> {
        if !self.bloom.is_present(decorated_key) {
            return Ok(None);
        }

        if let Ok(mut cache) = self.key_cache.lock() {
            if let Some(offset) = cache.get(decorated_key) {
                return Ok(Some(*offset));
            }
        }

        // Last sparse entry at or before the key bounds the scan start
        let at_or_before = self
            .sparse
            .partition_point(|kp| self.partitioner.compare(&kp.key, decorated_key) != CmpOrdering::Greater);
        if at_or_before == 0 {
            return Ok(None);
        }
        let start = self.sparse[at_or_before - 1].offset;

        let file = File::open(&self.data_path)?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start))?;
        let mut position = start;

        for _ in 0..self.index_interval {
            if position >= self.data_len {
                break;
            }
            let key = encoding::read_string(&mut reader)?;
            let row_len = encoding::read_i32(&mut reader)?;
            if row_len < 0 {
                return Err(StorageError::Corruption(format!(
                    "negative row length in {:?}",
                    self.data_path
                )));
            }
            match self.partitioner.compare(&key, decorated_key) {
                CmpOrdering::Equal => {
                    if let Ok(mut cache) = self.key_cache.lock() {
                        cache.put(decorated_key.to_string(), position);
                    }
                    return Ok(Some(position));
                }
                CmpOrdering::Greater => return Ok(None),
                CmpOrdering::Less => {
                    reader.seek_relative(row_len as i64)?;
                    position += (encoding::string_size(&key) + 4 + row_len as usize) as u64;
                }
            }
        }
        Ok(None)
    }

    /// Whole-row read, deserializing every column.
    pub fn read_row(&self, decorated_key: &str) -> Result<Option<ColumnFamily>> {
        let Some(position) = self.position_of(decorated_key)? else {
            return Ok(None);
        };
        let mut reader = BufReader::new(File::open(&self.data_path)?);
        reader.seek(SeekFrom::Start(position))?;
        let _key = encoding::read_string(&mut reader)?;
        let _row_len = encoding::read_i32(&mut reader)?;
        let cf = deserialize_row_body(&mut reader, self.cf_name.clone(), self.kind)?;
        Ok(Some(cf))
    }

    /// Position a fresh file handle inside the row for `decorated_key`,
    /// with its prelude (deletion stamps, bloom, column index) parsed and
    /// the handle at the first column byte.
    pub fn open_row(&self, decorated_key: &str) -> Result<Option<RowHandle>> {
        let Some(position) = self.position_of(decorated_key)? else {
            return Ok(None);
        };
        let mut file = BufReader::new(File::open(&self.data_path)?);
        file.seek(SeekFrom::Start(position))?;
        let _key = encoding::read_string(&mut file)?;
        let _row_len = encoding::read_i32(&mut file)?;
        let prelude = read_row_prelude(&mut file)?;
        Ok(Some(RowHandle {
            file,
            prelude,
            kind: self.kind,
        }))
    }

    /// Sequential whole-segment scan, for compaction.
    pub fn scan(&self) -> Result<SSTableScanner> {
        SSTableScanner::open(&self.data_path, self.cf_name.clone(), self.kind, self.data_len)
    }

    /// Mark this segment superseded. Files are removed when the last
    /// reference drops.
    pub fn mark_compacted(&self) {
        self.compacted.store(true, Ordering::Release);
    }
}

impl Drop for SSTableReader {
    fn drop(&mut self) {
        if self.compacted.load(Ordering::Acquire) {
            for path in [&self.data_path, &self.index_path, &self.filter_path] {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "failed to remove compacted segment file");
                }
            }
        }
    }
}

/// An open data file positioned at the first column of one row.
pub struct RowHandle {
    pub file: BufReader<File>,
    pub prelude: RowPrelude,
    pub kind: ColumnFamilyKind,
}

impl RowHandle {
    /// Read the raw bytes of one index block. The handle's position is
    /// unspecified afterwards; callers seek per block.
    pub fn read_block(&mut self, offset: u64, width: u64) -> Result<Vec<u8>> {
        self.file
            .seek(SeekFrom::Start(self.prelude.columns_offset + offset))?;
        let mut buf = vec![0u8; width as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn cache_capacity(config: &Config) -> NonZeroUsize {
    NonZeroUsize::new(config.key_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN)
}
