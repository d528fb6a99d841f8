//! Columns: leaf cells, super columns, and the tagged union over both
//!
//! ## Reconciliation
//! Two versions of the same column merge deterministically: the higher
//! timestamp wins; on a timestamp tie the tombstone wins, then the greater
//! value. Super columns merge recursively (union of cells, per-cell
//! reconcile, deletion stamps take the max). `reconcile(a, a) == a` always.

use super::{NO_DELETION_TIME, NO_DELETION_TIMESTAMP};
use crate::encoding;
use crate::{Result, StorageError};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};

/// Leaf column: a named, timestamped value with explicit deletion state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub name: String,
    pub value: Vec<u8>,
    /// Client-supplied version; the only basis for conflict resolution
    pub timestamp: i64,
    /// Server-local second the deletion was applied (GC horizon input)
    pub local_deletion_time: i32,
    pub deleted: bool,
}

impl Cell {
    pub fn new(name: impl Into<String>, value: Vec<u8>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            local_deletion_time: NO_DELETION_TIME,
            deleted: false,
        }
    }

    pub fn tombstone(name: impl Into<String>, local_deletion_time: i32, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value: Vec::new(),
            timestamp,
            local_deletion_time,
            deleted: true,
        }
    }

    /// Exact byte count [`serialize`](Self::serialize) will emit.
    pub fn serialized_size(&self) -> usize {
        encoding::string_size(&self.name) + 1 + 4 + 8 + encoding::bytes_size(&self.value)
    }

    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        encoding::write_string(w, &self.name)?;
        encoding::write_u8(w, self.deleted as u8)?;
        encoding::write_i32(w, self.local_deletion_time)?;
        encoding::write_i64(w, self.timestamp)?;
        encoding::write_bytes(w, &self.value)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let name = encoding::read_string(r)?;
        let deleted = encoding::read_u8(r)? != 0;
        let local_deletion_time = encoding::read_i32(r)?;
        let timestamp = encoding::read_i64(r)?;
        let value = encoding::read_byte_buf(r)?;
        Ok(Self {
            name,
            value,
            timestamp,
            local_deletion_time,
            deleted,
        })
    }

    pub fn reconcile(self, other: Cell) -> Cell {
        debug_assert_eq!(self.name, other.name);
        match self.timestamp.cmp(&other.timestamp) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => {
                // Tie: tombstone beats value, then greater value wins
                match (self.deleted, other.deleted) {
                    (true, false) => self,
                    (false, true) => other,
                    _ => {
                        if self.value >= other.value {
                            self
                        } else {
                            other
                        }
                    }
                }
            }
        }
    }
}

/// One level of nesting: a named group of cells with its own deletion stamp.
#[derive(Debug)]
pub struct SuperColumn {
    pub name: String,
    cells: BTreeMap<String, Cell>,
    pub marked_for_delete_at: i64,
    pub local_deletion_time: i32,
    /// Summed serialized size of contained cells, maintained with atomic
    /// deltas so concurrent size reads never require walking the map
    cached_size: AtomicI64,
}

impl SuperColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            marked_for_delete_at: NO_DELETION_TIMESTAMP,
            local_deletion_time: NO_DELETION_TIME,
            cached_size: AtomicI64::new(0),
        }
    }

    /// Insert a cell, reconciling with any existing cell of the same name.
    pub fn insert(&mut self, cell: Cell) {
        let added = cell.serialized_size() as i64;
        match self.cells.remove(&cell.name) {
            Some(existing) => {
                let removed = existing.serialized_size() as i64;
                let merged = existing.reconcile(cell);
                let kept = merged.serialized_size() as i64;
                self.cells.insert(merged.name.clone(), merged);
                self.cached_size.fetch_add(kept - removed, Ordering::Relaxed);
            }
            None => {
                self.cells.insert(cell.name.clone(), cell);
                self.cached_size.fetch_add(added, Ordering::Relaxed);
            }
        }
    }

    /// Remove a cell by name (used by tombstone GC).
    pub fn remove(&mut self, name: &str) -> Option<Cell> {
        let removed = self.cells.remove(name);
        if let Some(ref cell) = removed {
            self.cached_size
                .fetch_sub(cell.serialized_size() as i64, Ordering::Relaxed);
        }
        removed
    }

    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    /// Cells in ascending name order.
    pub fn cells(&self) -> std::collections::btree_map::Values<'_, String, Cell> {
        self.cells.values()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Mark the whole group deleted; existing cells are retained and
    /// suppressed at read time by the timestamp comparison.
    pub fn delete(&mut self, local_deletion_time: i32, timestamp: i64) {
        self.local_deletion_time = self.local_deletion_time.max(local_deletion_time);
        self.marked_for_delete_at = self.marked_for_delete_at.max(timestamp);
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete_at > NO_DELETION_TIMESTAMP
    }

    /// Timestamp of the newest change anywhere in this group.
    pub fn most_recent_change_at(&self) -> i64 {
        self.cells
            .values()
            .map(|c| c.timestamp)
            .max()
            .unwrap_or(NO_DELETION_TIMESTAMP)
            .max(self.marked_for_delete_at)
    }

    pub fn serialized_size(&self) -> usize {
        encoding::string_size(&self.name)
            + 4
            + 8
            + 4
            + self.cached_size.load(Ordering::Relaxed) as usize
    }

    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        encoding::write_string(w, &self.name)?;
        encoding::write_i32(w, self.local_deletion_time)?;
        encoding::write_i64(w, self.marked_for_delete_at)?;
        encoding::write_i32(w, self.cells.len() as i32)?;
        for cell in self.cells.values() {
            cell.serialize(w)?;
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let name = encoding::read_string(r)?;
        let local_deletion_time = encoding::read_i32(r)?;
        let marked_for_delete_at = encoding::read_i64(r)?;
        let count = encoding::read_i32(r)?;
        if count < 0 {
            return Err(StorageError::Corruption(format!(
                "negative cell count in super column {:?}",
                name
            )));
        }
        let mut sc = SuperColumn::new(name);
        sc.local_deletion_time = local_deletion_time;
        sc.marked_for_delete_at = marked_for_delete_at;
        for _ in 0..count {
            sc.insert(Cell::deserialize(r)?);
        }
        Ok(sc)
    }

    pub fn reconcile(mut self, other: SuperColumn) -> SuperColumn {
        debug_assert_eq!(self.name, other.name);
        self.local_deletion_time = self.local_deletion_time.max(other.local_deletion_time);
        self.marked_for_delete_at = self.marked_for_delete_at.max(other.marked_for_delete_at);
        for (_, cell) in other.cells {
            self.insert(cell);
        }
        self
    }
}

impl Clone for SuperColumn {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cells: self.cells.clone(),
            marked_for_delete_at: self.marked_for_delete_at,
            local_deletion_time: self.local_deletion_time,
            cached_size: AtomicI64::new(self.cached_size.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for SuperColumn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.cells == other.cells
            && self.marked_for_delete_at == other.marked_for_delete_at
            && self.local_deletion_time == other.local_deletion_time
    }
}

impl Eq for SuperColumn {}

/// A column as stored in a column family: either a leaf cell (standard
/// families) or a super column (super families). A family never mixes the
/// two; the family's kind selects the deserializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Leaf(Cell),
    Super(SuperColumn),
}

impl Column {
    pub fn name(&self) -> &str {
        match self {
            Column::Leaf(c) => &c.name,
            Column::Super(sc) => &sc.name,
        }
    }

    /// Version timestamp: the cell's own for leaves, the newest contained
    /// change for super columns.
    pub fn timestamp(&self) -> i64 {
        match self {
            Column::Leaf(c) => c.timestamp,
            Column::Super(sc) => sc.most_recent_change_at(),
        }
    }

    pub fn most_recent_change_at(&self) -> i64 {
        match self {
            Column::Leaf(c) => c.timestamp,
            Column::Super(sc) => sc.most_recent_change_at(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        match self {
            Column::Leaf(c) => c.deleted,
            Column::Super(sc) => sc.is_marked_for_delete(),
        }
    }

    pub fn local_deletion_time(&self) -> i32 {
        match self {
            Column::Leaf(c) => c.local_deletion_time,
            Column::Super(sc) => sc.local_deletion_time,
        }
    }

    /// Number of objects for bloom filter sizing: a leaf counts once, a
    /// super column counts itself plus each cell.
    pub fn object_count(&self) -> usize {
        match self {
            Column::Leaf(_) => 1,
            Column::Super(sc) => 1 + sc.cell_count(),
        }
    }

    pub fn serialized_size(&self) -> usize {
        match self {
            Column::Leaf(c) => c.serialized_size(),
            Column::Super(sc) => sc.serialized_size(),
        }
    }

    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Column::Leaf(c) => c.serialize(w),
            Column::Super(sc) => sc.serialize(w),
        }
    }

    pub fn deserialize<R: Read>(r: &mut R, kind: super::ColumnFamilyKind) -> Result<Self> {
        match kind {
            super::ColumnFamilyKind::Standard => Ok(Column::Leaf(Cell::deserialize(r)?)),
            super::ColumnFamilyKind::Super => Ok(Column::Super(SuperColumn::deserialize(r)?)),
        }
    }

    /// Merge two versions of the same column. Mixed leaf/super pairs only
    /// arise from schema misuse; the newer version wins in that case.
    pub fn reconcile(self, other: Column) -> Column {
        match (self, other) {
            (Column::Leaf(a), Column::Leaf(b)) => Column::Leaf(a.reconcile(b)),
            (Column::Super(a), Column::Super(b)) => Column::Super(a.reconcile(b)),
            (a, b) => {
                debug_assert!(false, "reconciling leaf with super column {:?}", a.name());
                if a.most_recent_change_at() >= b.most_recent_change_at() {
                    a
                } else {
                    b
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnFamilyKind;
    use std::io::Cursor;

    #[test]
    fn test_cell_round_trip() {
        let cell = Cell::new("name", b"value".to_vec(), 42);
        let mut buf = Vec::new();
        cell.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), cell.serialized_size());

        let restored = Cell::deserialize(&mut Cursor::new(buf)).unwrap();
        assert_eq!(restored, cell);
    }

    #[test]
    fn test_tombstone_round_trip() {
        let cell = Cell::tombstone("gone", 1000, 42);
        let mut buf = Vec::new();
        cell.serialize(&mut buf).unwrap();
        let restored = Cell::deserialize(&mut Cursor::new(buf)).unwrap();
        assert!(restored.deleted);
        assert_eq!(restored.local_deletion_time, 1000);
    }

    #[test]
    fn test_reconcile_higher_timestamp_wins() {
        let old = Cell::new("c", b"old".to_vec(), 1);
        let new = Cell::new("c", b"new".to_vec(), 2);
        assert_eq!(old.clone().reconcile(new.clone()), new);
        let newer = Cell::new("c", b"new".to_vec(), 2);
        assert_eq!(newer.reconcile(old.clone()).value, b"new");
    }

    #[test]
    fn test_reconcile_tie_tombstone_wins() {
        let value = Cell::new("c", b"v".to_vec(), 5);
        let tomb = Cell::tombstone("c", 100, 5);
        assert!(value.clone().reconcile(tomb.clone()).deleted);
        assert!(tomb.reconcile(value).deleted);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let cell = Cell::new("c", b"v".to_vec(), 5);
        assert_eq!(cell.clone().reconcile(cell.clone()), cell);

        let mut sc = SuperColumn::new("s");
        sc.insert(Cell::new("a", b"1".to_vec(), 1));
        sc.insert(Cell::new("b", b"2".to_vec(), 2));
        assert_eq!(sc.clone().reconcile(sc.clone()), sc);
    }

    #[test]
    fn test_super_column_reconcile_unions_cells() {
        let mut a = SuperColumn::new("s");
        a.insert(Cell::new("x", b"1".to_vec(), 1));
        let mut b = SuperColumn::new("s");
        b.insert(Cell::new("y", b"2".to_vec(), 2));
        b.delete(500, 10);

        let merged = a.reconcile(b);
        assert_eq!(merged.cell_count(), 2);
        assert_eq!(merged.marked_for_delete_at, 10);
    }

    #[test]
    fn test_super_column_cached_size_tracks_cells() {
        let mut sc = SuperColumn::new("s");
        let base = sc.serialized_size();
        let cell = Cell::new("a", b"12345".to_vec(), 1);
        let cell_size = cell.serialized_size();
        sc.insert(cell);
        assert_eq!(sc.serialized_size(), base + cell_size);

        // Replacing with a bigger value adjusts by the delta
        sc.insert(Cell::new("a", b"1234567890".to_vec(), 2));
        assert_eq!(sc.serialized_size(), base + cell_size + 5);
    }

    #[test]
    fn test_super_column_serialized_size_matches_bytes() {
        let mut sc = SuperColumn::new("s");
        sc.insert(Cell::new("a", b"1".to_vec(), 1));
        sc.insert(Cell::new("b", b"22".to_vec(), 2));
        sc.delete(100, 3);

        let mut buf = Vec::new();
        sc.serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), sc.serialized_size());

        let restored = SuperColumn::deserialize(&mut Cursor::new(buf)).unwrap();
        assert_eq!(restored, sc);
    }

    #[test]
    fn test_column_deserialize_by_kind() {
        let col = Column::Leaf(Cell::new("a", b"v".to_vec(), 1));
        let mut buf = Vec::new();
        col.serialize(&mut buf).unwrap();
        let restored =
            Column::deserialize(&mut Cursor::new(buf), ColumnFamilyKind::Standard).unwrap();
        assert_eq!(restored, col);
    }
}
