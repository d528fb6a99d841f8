//! Named-column lookup inside one on-disk row
//!
//! Requested names are screened against the row's bloom filter first, then
//! resolved to their index blocks; only blocks that can hold a surviving
//! name are read. Columns come out in ascending name order.

use super::reader::RowHandle;
use super::index_for;
use crate::model::Column;
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

pub struct NamesIterator {
    columns: std::vec::IntoIter<Column>,
}

impl NamesIterator {
    pub fn new(mut handle: RowHandle, names: &BTreeSet<String>) -> Result<Self> {
        // Group surviving names by the block that could hold them
        let mut by_block: BTreeMap<usize, BTreeSet<&str>> = BTreeMap::new();
        for name in names {
            if !handle.prelude.bloom.is_present(name) {
                continue;
            }
            let block = index_for(name, &handle.prelude.index, false);
            if block < handle.prelude.index.len() {
                by_block.entry(block).or_default().insert(name.as_str());
            }
        }

        let mut columns = Vec::new();
        for (block, wanted) in by_block {
            let info = handle.prelude.index[block].clone();
            let bytes = handle.read_block(info.offset, info.width)?;
            let mut cur = Cursor::new(&bytes);
            while (cur.position() as usize) < bytes.len() {
                let column = Column::deserialize(&mut cur, handle.kind)?;
                if wanted.contains(column.name()) {
                    columns.push(column);
                }
            }
        }
        Ok(Self {
            columns: columns.into_iter(),
        })
    }
}

// Every block is read in `new`, so iteration itself cannot fail; items
// are `Result` to match the other column sources.
impl Iterator for NamesIterator {
    type Item = Result<Column>;

    fn next(&mut self) -> Option<Result<Column>> {
        self.columns.next().map(Ok)
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

    #[test]
    fn test_requested_names_found_in_order() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let names: BTreeSet<String> =
            ["c15", "c03", "c09"].iter().map(|s| s.to_string()).collect();
        let got: Vec<String> = NamesIterator::new(handle, &names)
            .unwrap()
            .map(|c| c.unwrap().name().to_string())
            .collect();
        assert_eq!(got, vec!["c03", "c09", "c15"]);
    }

    #[test]
    fn test_absent_names_yield_nothing() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let names: BTreeSet<String> = ["nope", "zz"].iter().map(|s| s.to_string()).collect();
        let got: Vec<Result<Column>> = NamesIterator::new(handle, &names).unwrap().collect();
        assert!(got.is_empty());
    }

    #[test]
    fn test_mixed_present_and_absent() {
        let dir = TempDir::new().unwrap();
        let reader = build(dir.path());
        let handle = reader.open_row("row1").unwrap().unwrap();

        let names: BTreeSet<String> = ["c00", "missing", "c19"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let got: Vec<String> = NamesIterator::new(handle, &names)
            .unwrap()
            .map(|c| c.unwrap().name().to_string())
            .collect();
        assert_eq!(got, vec!["c00", "c19"]);
    }
}
