//! Column family store: one family's memtables and segments
//!
//! Owns the active memtable, the frozen ones awaiting flush, and the set
//! of live segments. The write path appends to the active memtable and
//! swaps it out when a threshold trips; the read path collates the active
//! memtable, every pending one, and every segment into a single merged
//! view. Exactly one compaction runs per family at a time; a second
//! trigger while one is running is skipped, not queued.

use crate::collated::CollatedIterator;
use crate::commitlog::CommitLogContext;
use crate::compaction::{compact_segments, CompactionStats};
use crate::config::Config;
use crate::filter::QueryFilter;
use crate::memtable::Memtable;
use crate::model::{Column, ColumnFamily, ColumnFamilyKind};
use crate::partitioner::Partitioner;
use crate::sstable::{serialize_row, SSTableReader, SSTableWriter};
use crate::{Result, StorageError};
use crossbeam::channel::Sender;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// A frozen memtable on its way to disk, tagged with the commit log
/// position it covers.
pub struct FlushTask {
    pub store: Arc<ColumnFamilyStore>,
    pub memtable: Arc<Memtable>,
    pub ctx: CommitLogContext,
}

pub struct ColumnFamilyStore {
    table: String,
    cf_name: String,
    kind: ColumnFamilyKind,
    /// Commit log dirty-bit index for this family
    cf_id: usize,
    config: Config,
    partitioner: Arc<dyn Partitioner>,

    active: Mutex<Arc<Memtable>>,
    /// Frozen memtables still readable until their segment is durable,
    /// oldest first
    pending_flush: RwLock<Vec<Arc<Memtable>>>,
    /// Live segments by file index
    segments: RwLock<BTreeMap<u64, Arc<SSTableReader>>>,

    next_file_index: AtomicU64,
    compacting: AtomicBool,
    flush_tx: Sender<FlushTask>,
}

impl ColumnFamilyStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: impl Into<String>,
        cf_name: impl Into<String>,
        kind: ColumnFamilyKind,
        cf_id: usize,
        config: Config,
        partitioner: Arc<dyn Partitioner>,
        initial_segments: Vec<SSTableReader>,
        flush_tx: Sender<FlushTask>,
    ) -> Arc<Self> {
        let cf_name = cf_name.into();
        let next_file_index = initial_segments
            .iter()
            .map(|r| r.file_index())
            .max()
            .map(|i| i + 1)
            .unwrap_or(1);
        let segments: BTreeMap<u64, Arc<SSTableReader>> = initial_segments
            .into_iter()
            .map(|r| (r.file_index(), Arc::new(r)))
            .collect();

        Arc::new(Self {
            table: table.into(),
            active: Mutex::new(Arc::new(Memtable::new(cf_name.clone(), &config))),
            cf_name,
            kind,
            cf_id,
            config,
            partitioner,
            pending_flush: RwLock::new(Vec::new()),
            segments: RwLock::new(segments),
            next_file_index: AtomicU64::new(next_file_index),
            compacting: AtomicBool::new(false),
            flush_tx,
        })
    }

    pub fn cf_id(&self) -> usize {
        self.cf_id
    }

    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub fn kind(&self) -> ColumnFamilyKind {
        self.kind
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().map(|s| s.len()).unwrap_or(0)
    }

    /// GC horizon: tombstones locally deleted before this second may be
    /// purged.
    pub fn gc_before(&self) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (now - self.config.gc_grace_seconds) as i32
    }

    /// Buffer a write that the commit log has already made durable.
    /// Trips the memtable switch when a threshold is crossed, so exactly
    /// one writer hands the frozen memtable to the flush worker.
    pub fn apply(
        self: &Arc<Self>,
        decorated_key: &str,
        cf: ColumnFamily,
        ctx: &CommitLogContext,
    ) -> Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| StorageError::Lock("memtable switch lock poisoned".into()))?;
        active.put(decorated_key, cf)?;
        if active.is_threshold_violated() {
            self.switch_locked(&mut active, ctx)?;
        }
        Ok(())
    }

    /// Force the active memtable out regardless of thresholds. Returns
    /// false when it was empty and nothing was queued.
    pub fn force_flush(self: &Arc<Self>, ctx: &CommitLogContext) -> Result<bool> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| StorageError::Lock("memtable switch lock poisoned".into()))?;
        if active.is_empty() {
            return Ok(false);
        }
        self.switch_locked(&mut active, ctx)?;
        Ok(true)
    }

    fn switch_locked(
        self: &Arc<Self>,
        active: &mut Arc<Memtable>,
        ctx: &CommitLogContext,
    ) -> Result<()> {
        let frozen = std::mem::replace(
            active,
            Arc::new(Memtable::new(self.cf_name.clone(), &self.config)),
        );
        frozen.freeze();
        self.pending_flush
            .write()
            .map_err(|_| StorageError::Lock("pending flush lock poisoned".into()))?
            .push(Arc::clone(&frozen));
        debug!(
            cf = %self.cf_name,
            bytes = frozen.current_bytes(),
            "memtable frozen"
        );

        self.flush_tx
            .send(FlushTask {
                store: Arc::clone(self),
                memtable: frozen,
                ctx: ctx.clone(),
            })
            .map_err(|_| StorageError::Memtable("flush worker is gone".into()))?;
        Ok(())
    }

    /// Write one frozen memtable out as a segment. Runs on the flush
    /// worker; also used synchronously during recovery.
    pub fn flush_memtable(&self, memtable: &Arc<Memtable>) -> Result<()> {
        let entries = memtable.sorted_entries()?;
        if entries.is_empty() {
            self.forget_pending(memtable)?;
            return Ok(());
        }

        let file_index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let mut writer = SSTableWriter::create(
            &self.config.data_dir,
            &self.table,
            &self.cf_name,
            self.kind,
            file_index,
            entries.len(),
            &self.config,
        )?;

        let mut buf = Vec::new();
        for (key, cf) in &entries {
            buf.clear();
            serialize_row(
                cf,
                self.config.column_index_size_bytes,
                self.config.bloom_bits_per_element,
                &mut buf,
            )?;
            writer.append(key, &buf)?;
        }
        let reader = writer.close(Arc::clone(&self.partitioner), &self.config)?;

        self.segments
            .write()
            .map_err(|_| StorageError::Lock("segment set lock poisoned".into()))?
            .insert(file_index, Arc::new(reader));
        self.forget_pending(memtable)?;

        info!(cf = %self.cf_name, rows = entries.len(), file_index, "memtable flushed");
        Ok(())
    }

    fn forget_pending(&self, memtable: &Arc<Memtable>) -> Result<()> {
        self.pending_flush
            .write()
            .map_err(|_| StorageError::Lock("pending flush lock poisoned".into()))?
            .retain(|m| !Arc::ptr_eq(m, memtable));
        Ok(())
    }

    /// Merged read across the active memtable, pending memtables, and
    /// every segment. `None` when the key has no trace of the family.
    pub fn read(
        &self,
        decorated_key: &str,
        filter: &QueryFilter,
        gc_before: i32,
    ) -> Result<Option<ColumnFamily>> {
        let mut result = ColumnFamily::new(self.cf_name.clone(), self.kind);
        let mut sources: Vec<Box<dyn Iterator<Item = Result<Column>>>> = Vec::new();

        // Memtables, newest first: active, then pending in reverse
        let mut memtables = vec![self
            .active
            .lock()
            .map_err(|_| StorageError::Lock("memtable switch lock poisoned".into()))?
            .clone()];
        {
            let pending = self
                .pending_flush
                .read()
                .map_err(|_| StorageError::Lock("pending flush lock poisoned".into()))?;
            memtables.extend(pending.iter().rev().cloned());
        }
        for memtable in &memtables {
            if let Some(cf) = memtable.get(decorated_key)? {
                result.delete(cf.local_deletion_time, cf.marked_for_delete_at);
                sources.push(Box::new(filter.memtable_columns(&cf).into_iter().map(Ok)));
            }
        }

        // Segments, newest first
        let segments: Vec<Arc<SSTableReader>> = {
            let segs = self
                .segments
                .read()
                .map_err(|_| StorageError::Lock("segment set lock poisoned".into()))?;
            segs.values().rev().cloned().collect()
        };
        for segment in &segments {
            if let Some(row) = filter.sstable_columns(segment, decorated_key)? {
                result.delete(row.local_deletion_time, row.marked_for_delete_at);
                sources.push(row.columns);
            }
        }

        if sources.is_empty() && !result.is_marked_for_delete() {
            return Ok(None);
        }

        let collated = CollatedIterator::new(sources, filter.is_reversed());
        filter.collect_columns(&mut result, collated, gc_before)?;

        if result.is_empty() && !result.is_marked_for_delete() {
            Ok(None)
        } else {
            Ok(Some(result))
        }
    }

    /// Merge all current segments into one. A compaction already in
    /// flight makes this a no-op.
    pub fn compact(self: &Arc<Self>) -> Result<CompactionStats> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(cf = %self.cf_name, "compaction already running, skipping");
            return Ok(CompactionStats::default());
        }
        let result = self.run_compaction();
        self.compacting.store(false, Ordering::Release);
        result
    }

    /// Compact when the segment count has reached the configured trigger.
    pub fn maybe_compact(self: &Arc<Self>) -> Result<CompactionStats> {
        if self.segment_count() >= self.config.compaction_segment_threshold {
            self.compact()
        } else {
            Ok(CompactionStats::default())
        }
    }

    fn run_compaction(&self) -> Result<CompactionStats> {
        let readers: Vec<Arc<SSTableReader>> = {
            let segs = self
                .segments
                .read()
                .map_err(|_| StorageError::Lock("segment set lock poisoned".into()))?;
            segs.values().cloned().collect()
        };
        if readers.len() < 2 {
            return Ok(CompactionStats::default());
        }

        let output_index = self.next_file_index.fetch_add(1, Ordering::SeqCst);
        let (new_reader, stats) = compact_segments(
            &readers,
            &self.config.data_dir,
            &self.table,
            &self.cf_name,
            self.kind,
            output_index,
            self.gc_before(),
            Arc::clone(&self.partitioner),
            &self.config,
        )?;

        {
            let mut segs = self
                .segments
                .write()
                .map_err(|_| StorageError::Lock("segment set lock poisoned".into()))?;
            for reader in &readers {
                segs.remove(&reader.file_index());
            }
            if let Some(reader) = new_reader {
                segs.insert(output_index, Arc::new(reader));
            }
        }
        // Files disappear once the last in-flight read lets go
        for reader in readers {
            reader.mark_compacted();
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partitioner::OrderPreservingPartitioner;
    use crossbeam::channel::unbounded;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> (Arc<ColumnFamilyStore>, crossbeam::channel::Receiver<FlushTask>) {
        let mut config = Config::default();
        config.data_dir = PathBuf::from(dir.path());
        config.memtable_threshold_objects = 4;
        let (tx, rx) = unbounded();
        let store = ColumnFamilyStore::new(
            "ks",
            "profile",
            ColumnFamilyKind::Standard,
            0,
            config,
            Arc::new(OrderPreservingPartitioner),
            Vec::new(),
            tx,
        );
        (store, rx)
    }

    fn ctx() -> CommitLogContext {
        CommitLogContext {
            file: PathBuf::from("CommitLog-test.log"),
            position: 0,
        }
    }

    fn cf_with(name: &str, value: &[u8], ts: i64) -> ColumnFamily {
        let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        cf.insert(name, value.to_vec(), ts);
        cf
    }

    #[test]
    fn test_read_from_active_memtable() {
        let dir = TempDir::new().unwrap();
        let (store, _rx) = test_store(&dir);
        store.apply("ka", cf_with("c", b"v", 1), &ctx()).unwrap();

        let got = store
            .read("ka", &QueryFilter::identity(), 0)
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(store.read("kb", &QueryFilter::identity(), 0).unwrap().is_none());
    }

    #[test]
    fn test_threshold_queues_flush_and_pending_stays_readable() {
        let dir = TempDir::new().unwrap();
        let (store, rx) = test_store(&dir);
        for i in 0..4 {
            store
                .apply(&format!("k{}", i), cf_with("c", b"v", 1), &ctx())
                .unwrap();
        }

        // Threshold of 4 objects tripped: a task is queued and the data
        // is still visible from the pending memtable
        let task = rx.try_recv().unwrap();
        assert!(task.memtable.is_frozen());
        assert!(store.read("k0", &QueryFilter::identity(), 0).unwrap().is_some());

        // Flush it and read from the segment instead
        store.flush_memtable(&task.memtable).unwrap();
        assert_eq!(store.segment_count(), 1);
        assert!(store.read("k0", &QueryFilter::identity(), 0).unwrap().is_some());
    }

    #[test]
    fn test_merged_read_prefers_newer_memtable_version() {
        let dir = TempDir::new().unwrap();
        let (store, rx) = test_store(&dir);

        store.apply("ka", cf_with("c", b"old", 1), &ctx()).unwrap();
        store.force_flush(&ctx()).unwrap();
        let task = rx.try_recv().unwrap();
        store.flush_memtable(&task.memtable).unwrap();

        store.apply("ka", cf_with("c", b"new", 2), &ctx()).unwrap();
        let got = store
            .read("ka", &QueryFilter::identity(), 0)
            .unwrap()
            .unwrap();
        match got.column("c").unwrap() {
            Column::Leaf(cell) => assert_eq!(cell.value, b"new"),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_compaction_collapses_segments() {
        let dir = TempDir::new().unwrap();
        let (store, rx) = test_store(&dir);

        for (key, value, ts) in [("ka", b"1" as &[u8], 1i64), ("kb", b"2", 1), ("ka", b"3", 2)] {
            store.apply(key, cf_with("c", value, ts), &ctx()).unwrap();
            store.force_flush(&ctx()).unwrap();
            let task = rx.try_recv().unwrap();
            store.flush_memtable(&task.memtable).unwrap();
        }
        assert_eq!(store.segment_count(), 3);

        let stats = store.compact().unwrap();
        assert_eq!(store.segment_count(), 1);
        assert_eq!(stats.input_segments, 3);

        let got = store
            .read("ka", &QueryFilter::identity(), 0)
            .unwrap()
            .unwrap();
        match got.column("c").unwrap() {
            Column::Leaf(cell) => assert_eq!(cell.value, b"3"),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_delete_shadows_older_value() {
        let dir = TempDir::new().unwrap();
        let (store, rx) = test_store(&dir);

        store.apply("ka", cf_with("c", b"v", 1), &ctx()).unwrap();
        store.force_flush(&ctx()).unwrap();
        let task = rx.try_recv().unwrap();
        store.flush_memtable(&task.memtable).unwrap();

        // Family-level delete newer than the value
        let mut tomb = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        tomb.delete(100, 5);
        store.apply("ka", tomb, &ctx()).unwrap();

        let got = store.read("ka", &QueryFilter::identity(), 0).unwrap();
        // The family shows only its deletion stamp, no live columns
        let got = got.unwrap();
        assert!(got.is_empty());
        assert!(got.is_marked_for_delete());
    }
}
