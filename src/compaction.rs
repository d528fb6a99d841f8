//! Segment compaction
//!
//! Streams every input segment in parallel through a min-heap keyed by
//! decorated key, resolves all versions of each row into one, purges
//! tombstones older than the GC horizon, and writes a single merged
//! segment in order. Inputs are only superseded after the output is live.

use crate::config::Config;
use crate::model::{remove_deleted, ColumnFamily, ColumnFamilyKind};
use crate::partitioner::Partitioner;
use crate::sstable::{serialize_row, SSTableReader, SSTableScanner, SSTableWriter};
use crate::Result;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    pub input_segments: usize,
    /// Rows that had more than one version across inputs
    pub rows_merged: usize,
    /// Rows dropped entirely as expired tombstones
    pub rows_dropped: usize,
    pub output_rows: usize,
}

struct MergeEntry {
    key: String,
    cf: ColumnFamily,
    source: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Merge `readers` into one new segment with file index `output_index`.
/// Returns `None` when every row was GC-able and nothing was written.
#[allow(clippy::too_many_arguments)]
pub fn compact_segments(
    readers: &[Arc<SSTableReader>],
    dir: &Path,
    table: &str,
    cf_name: &str,
    kind: ColumnFamilyKind,
    output_index: u64,
    gc_before: i32,
    partitioner: Arc<dyn Partitioner>,
    config: &Config,
) -> Result<(Option<SSTableReader>, CompactionStats)> {
    let mut stats = CompactionStats {
        input_segments: readers.len(),
        ..Default::default()
    };

    let mut scanners: Vec<SSTableScanner> = Vec::with_capacity(readers.len());
    for reader in readers {
        scanners.push(reader.scan()?);
    }

    let mut heap: BinaryHeap<Reverse<MergeEntry>> = BinaryHeap::new();
    for (source, scanner) in scanners.iter_mut().enumerate() {
        if let Some(entry) = scanner.next() {
            let (key, cf) = entry?;
            heap.push(Reverse(MergeEntry { key, cf, source }));
        }
    }

    let expected_keys: usize = readers.iter().map(|r| r.row_count_estimate()).sum();
    let mut writer = SSTableWriter::create(
        dir,
        table,
        cf_name,
        kind,
        output_index,
        expected_keys.max(1),
        config,
    )?;

    let mut row_buf = Vec::new();
    while let Some(Reverse(MergeEntry { key, mut cf, source })) = heap.pop() {
        if let Some(entry) = scanners[source].next() {
            let (next_key, next_cf) = entry?;
            heap.push(Reverse(MergeEntry {
                key: next_key,
                cf: next_cf,
                source,
            }));
        }

        // Absorb every other version of this row
        let mut versions = 1;
        while heap.peek().is_some_and(|entry| entry.0.key == key) {
            if let Some(Reverse(MergeEntry {
                cf: other,
                source: other_source,
                ..
            })) = heap.pop()
            {
                cf.add_all(other);
                versions += 1;
                if let Some(entry) = scanners[other_source].next() {
                    let (next_key, next_cf) = entry?;
                    heap.push(Reverse(MergeEntry {
                        key: next_key,
                        cf: next_cf,
                        source: other_source,
                    }));
                }
            }
        }
        if versions > 1 {
            stats.rows_merged += 1;
        }

        let cf = remove_deleted(cf, gc_before);
        let keep = !cf.is_empty()
            || (cf.is_marked_for_delete() && cf.local_deletion_time > gc_before);
        if !keep {
            stats.rows_dropped += 1;
            continue;
        }

        row_buf.clear();
        serialize_row(
            &cf,
            config.column_index_size_bytes,
            config.bloom_bits_per_element,
            &mut row_buf,
        )?;
        writer.append(&key, &row_buf)?;
        stats.output_rows += 1;
    }

    if writer.row_count() == 0 {
        writer.abort()?;
        info!(cf = cf_name, "compaction produced no surviving rows");
        return Ok((None, stats));
    }

    let reader = writer.close(partitioner, config)?;
    info!(
        cf = cf_name,
        inputs = stats.input_segments,
        rows = stats.output_rows,
        dropped = stats.rows_dropped,
        "compaction finished"
    );
    Ok((Some(reader), stats))
}
