//! Block-buffered slice iteration over one on-disk row
//!
//! Reads one column index block at a time, never the whole row. The start
//! bound and direction come from the query; the finish bound and count are
//! enforced by the caller folding the collated stream, so this iterator
//! only has to walk blocks in order. A block that fails to read yields the
//! error and ends the stream; it never truncates silently.

use super::reader::RowHandle;
use super::{index_for, IndexInfo};
use crate::model::{Column, ColumnFamilyKind};
use crate::Result;
use std::collections::VecDeque;
use std::io::Cursor;

pub struct SliceIterator {
    handle: RowHandle,
    start: String,
    reversed: bool,
    /// Next block to load; `None` once exhausted
    next_block: Option<usize>,
    pending: VecDeque<Column>,
}

impl SliceIterator {
    /// The first block is loaded eagerly so construction surfaces read
    /// errors; a later block read that fails comes out as an `Err` item.
    pub fn new(handle: RowHandle, start: impl Into<String>, reversed: bool) -> Result<Self> {
        let start = start.into();
        let first = index_for(&start, &handle.prelude.index, reversed);
        let mut iter = Self {
            next_block: (first < handle.prelude.index.len()).then_some(first),
            handle,
            start,
            reversed,
            pending: VecDeque::new(),
        };
        if let Some(block) = iter.next_block {
            iter.load_block(block)?;
            iter.advance_block();
        }
        Ok(iter)
    }

    fn load_block(&mut self, block: usize) -> Result<()> {
        let IndexInfo { offset, width, .. } = self.handle.prelude.index[block].clone();
        let bytes = self.handle.read_block(offset, width)?;
        let mut cur = Cursor::new(&bytes);
        let mut columns = Vec::new();
        while (cur.position() as usize) < bytes.len() {
            columns.push(Column::deserialize(&mut cur, self.kind())?);
        }

        if self.reversed {
            columns.reverse();
        }
        for column in columns {
            if !self.start.is_empty() {
                let name = column.name();
                let before_start = if self.reversed {
                    name > self.start.as_str()
                } else {
                    name < self.start.as_str()
                };
                if before_start {
                    continue;
                }
            }
            self.pending.push_back(column);
        }
        Ok(())
    }

    fn advance_block(&mut self) {
        self.next_block = match (self.next_block, self.reversed) {
            (Some(i), false) if i + 1 < self.handle.prelude.index.len() => Some(i + 1),
            (Some(i), true) if i > 0 => Some(i - 1),
            _ => None,
        };
    }

    fn kind(&self) -> ColumnFamilyKind {
        self.handle.kind
    }
}

impl Iterator for SliceIterator {
    type Item = Result<Column>;

    fn next(&mut self) -> Option<Result<Column>> {
        loop {
            if let Some(column) = self.pending.pop_front() {
                return Some(Ok(column));
            }
            let block = self.next_block?;
            if let Err(e) = self.load_block(block) {
                self.next_block = None;
                return Some(Err(e));
            }
            self.advance_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{ColumnFamily, ColumnFamilyKind};
    use crate::partitioner::OrderPreservingPartitioner;
    use crate::sstable::{serialize_row, SSTableReader, SSTableWriter};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Segment with one row of columns c00..c19, small blocks so the row
    /// spans several index blocks.
    fn build(dir: &Path) -> SSTableReader {
        let config = Config::default();
        let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        for i in 0..20 {
            cf.insert(format!("c{:02}", i), vec![b'v'; 16], 1);
        }
        let mut body = Vec::new();
        serialize_row(&cf, 64, 10, &mut body).unwrap();

        let mut writer = SSTableWriter::create(
            dir,
            "ks",
            "profile",
            ColumnFamilyKind::Standard,
            1,
            1,
            &config,
        )
        .unwrap();
        writer.append("row1", &body).unwrap();
        writer
            .close(Arc::new(OrderPreservingPartitioner), &config)
            .unwrap()
    }

    fn names(iter: SliceIterator) -> Vec<String> {
        iter.map(|c| c.unwrap().name().to_string()).collect()
    }

    #[test]
    fn test_forward_from_start() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let got = names(SliceIterator::new(handle, "c17", false).unwrap());
        assert_eq!(got, vec!["c17", "c18", "c19"]);
    }

    #[test]
    fn test_forward_unbounded() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let got = names(SliceIterator::new(handle, "", false).unwrap());
        assert_eq!(got.len(), 20);
        assert_eq!(got[0], "c00");
        assert_eq!(got[19], "c19");
    }

    #[test]
    fn test_reversed_from_start() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let got = names(SliceIterator::new(handle, "c02", true).unwrap());
        assert_eq!(got, vec!["c02", "c01", "c00"]);
    }

    #[test]
    fn test_reversed_unbounded_starts_at_end() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let got = names(SliceIterator::new(handle, "", true).unwrap());
        assert_eq!(got.len(), 20);
        assert_eq!(got[0], "c19");
        assert_eq!(got[19], "c00");
    }

    #[test]
    fn test_start_past_all_columns_is_empty() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let got = names(SliceIterator::new(handle, "d", false).unwrap());
        assert!(got.is_empty());
    }

    #[test]
    fn test_unreadable_block_is_an_error_not_a_short_slice() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        // Chop the tail of the data file so later blocks cannot be read
        let len = std::fs::metadata(reader.data_path()).unwrap().len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(reader.data_path())
            .unwrap();
        file.set_len(len - 40).unwrap();

        let results: Vec<Result<Column>> =
            SliceIterator::new(handle, "", false).unwrap().collect();
        assert!(results.iter().any(|r| r.is_err()));
        // Nothing comes after the error
        let err_at = results.iter().position(|r| r.is_err()).unwrap();
        assert_eq!(err_at, results.len() - 1);
    }
}
