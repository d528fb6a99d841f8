//! Table: the top-level handle over a set of column family stores
//!
//! A table owns one commit log shared by all of its families, one store
//! per family, and a background worker that turns frozen memtables into
//! segments. Opening a table replays whatever the commit log holds for
//! families whose dirty bit is set, flushes the recovered state, and only
//! then starts accepting writes against a fresh log.

use crate::commitlog::{CommitLog, CommitLogContext};
use crate::compaction::CompactionStats;
use crate::config::Config;
use crate::filter::QueryFilter;
use crate::model::{Column, ColumnFamily, ColumnFamilyKind, Row, SuperColumn};
use crate::partitioner::Partitioner;
use crate::sstable::{SSTableReader, SegmentName, DATA_SUFFIX};
use crate::store::{ColumnFamilyStore, FlushTask};
use crate::{Result, StorageError};
use crossbeam::channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfDef {
    /// Commit log dirty-bit index; stable across restarts
    pub id: usize,
    pub kind: ColumnFamilyKind,
}

/// Persisted family registry. Ids are assigned once and never reused, so
/// commit log headers written before a restart still mean the same thing
/// after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMetadata {
    table: String,
    column_families: BTreeMap<String, CfDef>,
}

impl TableMetadata {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            column_families: BTreeMap::new(),
        }
    }

    fn path(data_dir: &Path, table: &str) -> PathBuf {
        data_dir.join(format!("{}-metadata.json", table))
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Register a family if unknown, keeping existing ids untouched.
    fn register(&mut self, name: &str, kind: ColumnFamilyKind) -> Result<()> {
        validate_name("column family", name)?;
        if let Some(def) = self.column_families.get(name) {
            if def.kind != kind {
                return Err(StorageError::Config(format!(
                    "column family {:?} already registered with a different kind",
                    name
                )));
            }
            return Ok(());
        }
        let id = self
            .column_families
            .values()
            .map(|d| d.id + 1)
            .max()
            .unwrap_or(0);
        self.column_families
            .insert(name.to_string(), CfDef { id, kind });
        Ok(())
    }
}

/// Table and family names become `-`-delimited segment file names, so `-`
/// is reserved, as is the in-progress segment marker.
fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('-') || name == crate::sstable::TEMP_MARKER {
        return Err(StorageError::Config(format!(
            "invalid {} name {:?}: must be non-empty, must not contain '-' or be \"tmp\"",
            what, name
        )));
    }
    Ok(())
}

pub struct Table {
    name: String,
    config: Config,
    partitioner: Arc<dyn Partitioner>,
    commit_log: Arc<CommitLog>,
    stores: HashMap<String, Arc<ColumnFamilyStore>>,
    flush_worker: Option<JoinHandle<()>>,
}

impl Table {
    /// Open (or create) a table with the given families. Replays the
    /// commit log before returning, so everything acknowledged before a
    /// crash is readable again.
    pub fn open(
        name: impl Into<String>,
        column_families: &[(&str, ColumnFamilyKind)],
        config: Config,
        partitioner: Arc<dyn Partitioner>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name("table", &name)?;
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.commitlog_dir)?;

        let metadata_path = TableMetadata::path(&config.data_dir, &name);
        let mut metadata =
            TableMetadata::load(&metadata_path)?.unwrap_or_else(|| TableMetadata::new(&name));
        for (cf_name, kind) in column_families {
            metadata.register(cf_name, *kind)?;
        }
        metadata.save(&metadata_path)?;

        let mut segments = scan_data_dir(&config.data_dir, &name, &metadata, &partitioner, &config)?;

        let (flush_tx, flush_rx) = unbounded();
        let mut stores: HashMap<String, Arc<ColumnFamilyStore>> = HashMap::new();
        for (cf_name, def) in &metadata.column_families {
            let initial = segments.remove(cf_name.as_str()).unwrap_or_default();
            stores.insert(
                cf_name.clone(),
                ColumnFamilyStore::new(
                    name.clone(),
                    cf_name.clone(),
                    def.kind,
                    def.id,
                    config.clone(),
                    Arc::clone(&partitioner),
                    initial,
                    flush_tx.clone(),
                ),
            );
        }
        drop(flush_tx);

        recover(&name, &config, &metadata, &stores, &partitioner, &flush_rx)?;

        let commit_log = Arc::new(CommitLog::open(
            config.commitlog_dir.clone(),
            name.clone(),
            metadata.column_families.len(),
            config.log_rotation_threshold_bytes,
        )?);

        let flush_worker = Some(spawn_flush_worker(flush_rx, Arc::clone(&commit_log)));

        Ok(Self {
            name,
            config,
            partitioner,
            commit_log,
            stores,
            flush_worker,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn store(&self, cf_name: &str) -> Result<&Arc<ColumnFamilyStore>> {
        self.stores
            .get(cf_name)
            .ok_or_else(|| StorageError::UnknownColumnFamily(cf_name.to_string()))
    }

    /// Apply one row mutation: commit log first, then every touched
    /// family's memtable. The write is durable once this returns.
    pub fn apply(&self, row: Row) -> Result<()> {
        if row.is_empty() {
            return Ok(());
        }

        let mut dirty_ids = Vec::new();
        for cf in row.column_families() {
            dirty_ids.push(self.store(&cf.name)?.cf_id());
        }

        let mut bytes = Vec::with_capacity(row.serialized_size());
        row.serialize(&mut bytes)?;
        let ctx = self.commit_log.add(&bytes, &dirty_ids)?;

        let decorated_key = self.partitioner.decorate_key(&row.key);
        for cf in row.into_column_families() {
            let store = self.store(&cf.name)?;
            store.apply(&decorated_key, cf, &ctx)?;
        }
        Ok(())
    }

    /// Read one family of one row through a filter.
    pub fn read(
        &self,
        key: &str,
        cf_name: &str,
        filter: &QueryFilter,
    ) -> Result<Option<ColumnFamily>> {
        let store = self.store(cf_name)?;
        let decorated_key = self.partitioner.decorate_key(key);
        store.read(&decorated_key, filter, store.gc_before())
    }

    /// Read inside one super column: the filter applies to its cells.
    pub fn read_super(
        &self,
        key: &str,
        cf_name: &str,
        super_name: &str,
        filter: &QueryFilter,
    ) -> Result<Option<SuperColumn>> {
        let store = self.store(cf_name)?;
        if store.kind() != ColumnFamilyKind::Super {
            return Err(StorageError::InvalidData(format!(
                "column family {:?} is not super",
                cf_name
            )));
        }

        let fetch = QueryFilter::names([super_name.to_string()]);
        let decorated_key = self.partitioner.decorate_key(key);
        let gc_before = store.gc_before();
        let Some(cf) = store.read(&decorated_key, &fetch, gc_before)? else {
            return Ok(None);
        };
        match cf.column(super_name) {
            Some(Column::Super(sc)) => Ok(Some(filter.filter_super_column(sc, gc_before))),
            _ => Ok(None),
        }
    }

    /// Force the family's active memtable out to disk. Returns false when
    /// there was nothing buffered.
    pub fn flush(&self, cf_name: &str) -> Result<bool> {
        let store = self.store(cf_name)?;
        let ctx = self.commit_log.current_context();
        store.force_flush(&ctx)
    }

    /// Merge all of the family's segments into one.
    pub fn compact(&self, cf_name: &str) -> Result<CompactionStats> {
        self.store(cf_name)?.compact()
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        // Dropping the stores drops the last flush senders, which ends
        // the worker's receive loop
        self.stores.clear();
        if let Some(handle) = self.flush_worker.take() {
            if handle.join().is_err() {
                error!(table = %self.name, "flush worker panicked");
            }
        }
    }
}

/// Find this table's live segments, discarding half-written temporaries.
fn scan_data_dir(
    data_dir: &Path,
    table: &str,
    metadata: &TableMetadata,
    partitioner: &Arc<dyn Partitioner>,
    config: &Config,
) -> Result<HashMap<String, Vec<SSTableReader>>> {
    let mut segments: HashMap<String, Vec<SSTableReader>> = HashMap::new();
    let temp_prefix = format!("{}-", table);

    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !file_name.starts_with(&temp_prefix) {
            continue;
        }
        if file_name.contains("-tmp-") {
            warn!(file = file_name, "removing incomplete segment file");
            std::fs::remove_file(entry.path())?;
            continue;
        }
        if !file_name.ends_with(DATA_SUFFIX) {
            continue;
        }
        let Some(parsed) = SegmentName::parse(file_name) else {
            continue;
        };
        if parsed.table != table {
            continue;
        }
        let Some(def) = metadata.column_families.get(&parsed.cf) else {
            warn!(file = file_name, "segment for unregistered family, skipping");
            continue;
        };
        let reader =
            SSTableReader::open(entry.path(), def.kind, Arc::clone(partitioner), config)?;
        segments.entry(parsed.cf).or_default().push(reader);
    }
    Ok(segments)
}

/// Replay surviving commit log segments into the stores, flush the
/// recovered memtables synchronously, and delete the old logs.
fn recover(
    table: &str,
    config: &Config,
    metadata: &TableMetadata,
    stores: &HashMap<String, Arc<ColumnFamilyStore>>,
    partitioner: &Arc<dyn Partitioner>,
    flush_rx: &Receiver<FlushTask>,
) -> Result<()> {
    let log_paths = CommitLog::list_segments(&config.commitlog_dir, table)?;
    if log_paths.is_empty() {
        return Ok(());
    }

    // Positions are meaningless against the log being replayed; headers
    // are rewritten from scratch once a fresh log is open
    let recovery_ctx = CommitLogContext {
        file: PathBuf::new(),
        position: 0,
    };

    let mut rows_applied = 0usize;
    for path in &log_paths {
        // A file whose bits are all clean has nothing left to replay
        if CommitLog::read_header(path)?.is_safe_to_delete() {
            continue;
        }
        let applied = CommitLog::replay(path, |row, header| {
            let decorated_key = partitioner.decorate_key(&row.key);
            for cf in row.into_column_families() {
                let Some(def) = metadata.column_families.get(&cf.name) else {
                    continue;
                };
                // A clean bit means this family's data already reached a
                // segment before the crash
                if !header.is_dirty(def.id) {
                    continue;
                }
                if let Some(store) = stores.get(&cf.name) {
                    store.apply(&decorated_key, cf, &recovery_ctx)?;
                }
            }
            Ok(())
        })?;
        rows_applied += applied;
    }

    for store in stores.values() {
        store.force_flush(&recovery_ctx)?;
    }
    // Recovery runs before the worker exists, so drain its queue here
    while let Ok(task) = flush_rx.try_recv() {
        task.store.flush_memtable(&task.memtable)?;
    }

    for path in &log_paths {
        std::fs::remove_file(path)?;
    }
    info!(table, rows = rows_applied, logs = log_paths.len(), "commit log recovery complete");
    Ok(())
}

fn spawn_flush_worker(rx: Receiver<FlushTask>, commit_log: Arc<CommitLog>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("memtable-flush".to_string())
        .spawn(move || {
            for task in rx.iter() {
                let cf = task.store.cf_name().to_string();
                match task.store.flush_memtable(&task.memtable) {
                    Ok(()) => {
                        if let Err(e) = commit_log.on_memtable_flush(task.store.cf_id(), &task.ctx)
                        {
                            error!(cf = %cf, error = %e, "commit log discard failed");
                        }
                        if let Err(e) = task.store.maybe_compact() {
                            error!(cf = %cf, error = %e, "compaction failed");
                        }
                    }
                    // The memtable stays readable in pending and the dirty
                    // bit stays set, so nothing acknowledged is lost
                    Err(e) => error!(cf = %cf, error = %e, "memtable flush failed"),
                }
            }
        })
        .expect("failed to spawn flush worker")
}
