//! Column family: the unit of storage beneath a row
//!
//! Columns are kept in a `BTreeMap` keyed by name, so the ascending-name
//! invariant that segments and the column index depend on holds by
//! construction. A family-level deletion stamp suppresses all columns
//! older than it without touching them individually.

use super::{Cell, Column, SuperColumn, NO_DELETION_TIME, NO_DELETION_TIMESTAMP};
use crate::encoding;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnFamilyKind {
    Standard,
    Super,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamily {
    pub name: String,
    pub kind: ColumnFamilyKind,
    columns: BTreeMap<String, Column>,
    pub local_deletion_time: i32,
    pub marked_for_delete_at: i64,
}

impl ColumnFamily {
    pub fn new(name: impl Into<String>, kind: ColumnFamilyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            columns: BTreeMap::new(),
            local_deletion_time: NO_DELETION_TIME,
            marked_for_delete_at: NO_DELETION_TIMESTAMP,
        }
    }

    /// Convenience insert of a leaf cell (standard families).
    pub fn insert(&mut self, name: impl Into<String>, value: Vec<u8>, timestamp: i64) {
        self.add_column(Column::Leaf(Cell::new(name, value, timestamp)));
    }

    /// Convenience insert of a cell under a super column, creating the
    /// super column if absent.
    pub fn insert_sub(&mut self, super_name: impl Into<String>, cell: Cell) {
        let super_name = super_name.into();
        let mut sc = SuperColumn::new(super_name);
        sc.insert(cell);
        self.add_column(Column::Super(sc));
    }

    /// Add a column, reconciling with any existing column of the same name.
    pub fn add_column(&mut self, column: Column) {
        match self.columns.remove(column.name()) {
            Some(existing) => {
                let merged = existing.reconcile(column);
                self.columns.insert(merged.name().to_string(), merged);
            }
            None => {
                self.columns.insert(column.name().to_string(), column);
            }
        }
    }

    /// Merge another version of this family: every column reconciled in,
    /// deletion stamps taking the max.
    pub fn add_all(&mut self, other: ColumnFamily) {
        self.local_deletion_time = self.local_deletion_time.max(other.local_deletion_time);
        self.marked_for_delete_at = self.marked_for_delete_at.max(other.marked_for_delete_at);
        for (_, column) in other.columns {
            self.add_column(column);
        }
    }

    /// Mark the whole family deleted as of `timestamp`.
    pub fn delete(&mut self, local_deletion_time: i32, timestamp: i64) {
        self.local_deletion_time = self.local_deletion_time.max(local_deletion_time);
        self.marked_for_delete_at = self.marked_for_delete_at.max(timestamp);
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete_at > NO_DELETION_TIMESTAMP
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    /// Columns in ascending name order.
    pub fn columns(&self) -> std::collections::btree_map::Values<'_, String, Column> {
        self.columns.values()
    }

    pub fn into_columns(self) -> impl Iterator<Item = Column> {
        self.columns.into_values()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Recursive object count: leaves count once, super columns count
    /// themselves plus their cells. Sizes the per-row bloom filter.
    pub fn object_count(&self) -> usize {
        self.columns.values().map(|c| c.object_count()).sum()
    }

    /// Serialized size of the column content (excluding the family
    /// header fields).
    pub fn columns_size(&self) -> usize {
        self.columns.values().map(|c| c.serialized_size()).sum()
    }

    /// Exact byte count [`serialize`](Self::serialize) will emit.
    pub fn serialized_size(&self) -> usize {
        4 + 8 + 4 + self.columns_size()
    }

    /// Basic layout (commit log records, merge buffers):
    /// `localDeletionTime | markedForDeleteAt | columnCount | columns`.
    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        encoding::write_i32(w, self.local_deletion_time)?;
        encoding::write_i64(w, self.marked_for_delete_at)?;
        encoding::write_i32(w, self.columns.len() as i32)?;
        for column in self.columns.values() {
            column.serialize(w)?;
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(
        r: &mut R,
        name: impl Into<String>,
        kind: ColumnFamilyKind,
    ) -> Result<Self> {
        let mut cf = ColumnFamily::new(name, kind);
        cf.local_deletion_time = encoding::read_i32(r)?;
        cf.marked_for_delete_at = encoding::read_i64(r)?;
        let count = encoding::read_i32(r)?;
        if count < 0 {
            return Err(StorageError::Corruption(format!(
                "negative column count in family {:?}",
                cf.name
            )));
        }
        for _ in 0..count {
            cf.add_column(Column::deserialize(r, kind)?);
        }
        Ok(cf)
    }
}

/// Strip columns that deletion has made irrelevant.
///
/// A leaf is dropped when it is a tombstone old enough to collect
/// (`local_deletion_time <= gc_before`) or when it is shadowed by the
/// family-level deletion stamp. Super column cells are pruned against the
/// stricter of the family and super column stamps; a super column that
/// ends up empty and collectable is dropped entirely.
pub fn remove_deleted(mut cf: ColumnFamily, gc_before: i32) -> ColumnFamily {
    let family_delete_at = cf.marked_for_delete_at;
    let names: Vec<String> = cf.columns.keys().cloned().collect();

    for name in names {
        let drop = match cf.columns.get_mut(&name) {
            Some(Column::Leaf(cell)) => {
                (cell.deleted && cell.local_deletion_time <= gc_before)
                    || cell.timestamp <= family_delete_at
            }
            Some(Column::Super(sc)) => {
                let min_timestamp = sc.marked_for_delete_at.max(family_delete_at);
                let stale: Vec<String> = sc
                    .cells()
                    .filter(|cell| {
                        cell.timestamp <= min_timestamp
                            || (cell.deleted && cell.local_deletion_time <= gc_before)
                    })
                    .map(|cell| cell.name.clone())
                    .collect();
                for cell_name in stale {
                    sc.remove(&cell_name);
                }
                sc.is_empty() && sc.local_deletion_time <= gc_before
            }
            None => false,
        };
        if drop {
            cf.columns.remove(&name);
        }
    }
    cf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn standard_cf() -> ColumnFamily {
        ColumnFamily::new("profile", ColumnFamilyKind::Standard)
    }

    #[test]
    fn test_columns_stay_sorted() {
        let mut cf = standard_cf();
        cf.insert("c", b"3".to_vec(), 1);
        cf.insert("a", b"1".to_vec(), 1);
        cf.insert("b", b"2".to_vec(), 1);

        let names: Vec<&str> = cf.columns().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_add_column_reconciles() {
        let mut cf = standard_cf();
        cf.insert("a", b"old".to_vec(), 1);
        cf.insert("a", b"new".to_vec(), 2);

        assert_eq!(cf.len(), 1);
        match cf.column("a").unwrap() {
            Column::Leaf(cell) => assert_eq!(cell.value, b"new"),
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_add_all_merges_deletion_stamps() {
        let mut a = standard_cf();
        a.insert("x", b"1".to_vec(), 1);
        let mut b = standard_cf();
        b.insert("y", b"2".to_vec(), 2);
        b.delete(100, 5);

        a.add_all(b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.marked_for_delete_at, 5);
        assert_eq!(a.local_deletion_time, 100);
    }

    #[test]
    fn test_round_trip_is_byte_exact() {
        let mut cf = standard_cf();
        cf.insert("a", b"alpha".to_vec(), 10);
        cf.insert("b", b"beta".to_vec(), 20);
        cf.add_column(Column::Leaf(Cell::tombstone("c", 99, 30)));
        cf.delete(50, 5);

        let mut buf = Vec::new();
        cf.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), cf.serialized_size());

        let restored =
            ColumnFamily::deserialize(&mut Cursor::new(buf), "profile", ColumnFamilyKind::Standard)
                .unwrap();
        assert_eq!(restored, cf);
    }

    #[test]
    fn test_super_family_round_trip() {
        let mut cf = ColumnFamily::new("groups", ColumnFamilyKind::Super);
        cf.insert_sub("g1", Cell::new("m1", b"x".to_vec(), 1));
        cf.insert_sub("g1", Cell::new("m2", b"y".to_vec(), 2));
        cf.insert_sub("g2", Cell::new("m3", b"z".to_vec(), 3));

        let mut buf = Vec::new();
        cf.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), cf.serialized_size());

        let restored =
            ColumnFamily::deserialize(&mut Cursor::new(buf), "groups", ColumnFamilyKind::Super)
                .unwrap();
        assert_eq!(restored, cf);
        assert_eq!(restored.object_count(), 5);
    }

    #[test]
    fn test_remove_deleted_purges_old_tombstones() {
        let mut cf = standard_cf();
        cf.insert("live", b"v".to_vec(), 10);
        cf.add_column(Column::Leaf(Cell::tombstone("old", 100, 5)));
        cf.add_column(Column::Leaf(Cell::tombstone("fresh", 900, 6)));

        let cf = remove_deleted(cf, 500);
        assert!(cf.column("live").is_some());
        assert!(cf.column("old").is_none());
        // Not yet past the GC horizon: kept for read repair
        assert!(cf.column("fresh").is_some());
    }

    #[test]
    fn test_remove_deleted_respects_family_stamp() {
        let mut cf = standard_cf();
        cf.insert("shadowed", b"v".to_vec(), 3);
        cf.insert("survivor", b"v".to_vec(), 9);
        cf.delete(100, 5);

        let cf = remove_deleted(cf, 0);
        assert!(cf.column("shadowed").is_none());
        assert!(cf.column("survivor").is_some());
    }

    #[test]
    fn test_remove_deleted_prunes_super_columns() {
        let mut cf = ColumnFamily::new("groups", ColumnFamilyKind::Super);
        let mut sc = SuperColumn::new("g");
        sc.insert(Cell::new("stale", b"v".to_vec(), 1));
        sc.insert(Cell::new("fresh", b"v".to_vec(), 10));
        sc.delete(100, 5);
        cf.add_column(Column::Super(sc));

        let cf = remove_deleted(cf, 500);
        match cf.column("g") {
            Some(Column::Super(sc)) => {
                assert!(sc.cell("stale").is_none());
                assert!(sc.cell("fresh").is_some());
            }
            _ => panic!("expected super column"),
        }
    }
}
