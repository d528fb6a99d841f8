//! Memtable: the in-memory write buffer for one column family
//!
//! Writes merge into a sorted map keyed by decorated key. Once either
//! threshold (bytes or object count) trips, the owning store freezes this
//! memtable, swaps in a fresh one, and hands the frozen one to the flush
//! worker. A frozen memtable stays readable until its segment is durable.

use crate::config::Config;
use crate::model::ColumnFamily;
use crate::{Result, StorageError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Memtable {
    cf_name: String,

    /// Decorated key -> merged column family
    data: RwLock<BTreeMap<String, ColumnFamily>>,

    /// Current serialized size of buffered columns
    current_bytes: AtomicUsize,

    /// Current buffered column object count
    current_objects: AtomicUsize,

    /// Set once by the store when this memtable is swapped out
    frozen: AtomicBool,

    /// Creation time in milliseconds, orders flushes of the same family
    created_at: u64,

    byte_threshold: usize,
    object_threshold: usize,
}

impl Memtable {
    pub fn new(cf_name: impl Into<String>, config: &Config) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            cf_name: cf_name.into(),
            data: RwLock::new(BTreeMap::new()),
            current_bytes: AtomicUsize::new(0),
            current_objects: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
            created_at,
            byte_threshold: config.memtable_threshold_bytes,
            object_threshold: config.memtable_threshold_objects,
        }
    }

    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Merge a column family version under the decorated key.
    pub fn put(&self, decorated_key: &str, cf: ColumnFamily) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(StorageError::Memtable(format!(
                "memtable for {} is frozen",
                self.cf_name
            )));
        }

        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Lock("memtable lock poisoned".into()))?;

        match data.get_mut(decorated_key) {
            Some(existing) => {
                let old_bytes = existing.columns_size();
                let old_objects = existing.object_count();
                existing.add_all(cf);
                let new_bytes = existing.columns_size();
                let new_objects = existing.object_count();
                self.current_bytes
                    .fetch_add(new_bytes.saturating_sub(old_bytes), Ordering::Relaxed);
                self.current_objects
                    .fetch_add(new_objects.saturating_sub(old_objects), Ordering::Relaxed);
            }
            None => {
                self.current_bytes
                    .fetch_add(cf.columns_size(), Ordering::Relaxed);
                self.current_objects
                    .fetch_add(cf.object_count(), Ordering::Relaxed);
                data.insert(decorated_key.to_string(), cf);
            }
        }
        Ok(())
    }

    pub fn get(&self, decorated_key: &str) -> Result<Option<ColumnFamily>> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Lock("memtable lock poisoned".into()))?;
        Ok(data.get(decorated_key).cloned())
    }

    /// Whether either flush threshold has tripped.
    pub fn is_threshold_violated(&self) -> bool {
        self.current_bytes.load(Ordering::Relaxed) >= self.byte_threshold
            || self.current_objects.load(Ordering::Relaxed) >= self.object_threshold
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries in decorated key order, for flushing.
    pub fn sorted_entries(&self) -> Result<Vec<(String, ColumnFamily)>> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Lock("memtable lock poisoned".into()))?;
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}
