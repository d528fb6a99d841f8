//! Sorted segment files
//!
//! A segment is the immutable, sorted on-disk form of one flushed memtable
//! (or one compaction output). It is three sibling files:
//! - `<table>-<cf>-<index>-Data.db` — rows in decorated key order
//! - `<table>-<cf>-<index>-Index.db` — sparse key index, one entry per
//!   [`Config::index_interval`](crate::Config::index_interval) rows
//! - `<table>-<cf>-<index>-Filter.db` — bloom filter over all row keys
//!
//! In-progress files carry a `tmp` marker in the name and are renamed into
//! place only once fully written and fsynced, so a crash can never leave a
//! half-built segment masquerading as a real one.

mod index;
mod names_iter;
mod reader;
mod row_iter;
mod slice_iter;
mod writer;

pub use index::{
    build_column_index, deserialize_row_body, index_for, read_row_prelude, serialize_row,
    IndexInfo, RowPrelude,
};
pub use names_iter::NamesIterator;
pub use reader::{RowHandle, SSTableReader};
pub use row_iter::SSTableScanner;
pub use slice_iter::SliceIterator;
pub use writer::SSTableWriter;

use crate::model::Column;
use crate::{Result, StorageError};
use std::path::{Path, PathBuf};

pub const DATA_SUFFIX: &str = "Data.db";
pub const INDEX_SUFFIX: &str = "Index.db";
pub const FILTER_SUFFIX: &str = "Filter.db";
pub const TEMP_MARKER: &str = "tmp";

/// One sparse index entry: a decorated key and the data file offset of its
/// row. Held in memory by readers and mirrored in the `-Index.db` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPosition {
    pub key: String,
    pub offset: u64,
}

/// Columns of one on-disk row, plus the row-level deletion stamps the
/// caller must fold into its result.
pub struct RowColumns {
    pub local_deletion_time: i32,
    pub marked_for_delete_at: i64,
    pub columns: Box<dyn Iterator<Item = Result<Column>>>,
}

/// Parsed segment file name. Table and family names must not contain `-`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub table: String,
    pub cf: String,
    pub index: u64,
    pub temporary: bool,
}

impl SegmentName {
    pub fn parse(file_name: &str) -> Option<SegmentName> {
        let stem = file_name.strip_suffix(&format!("-{}", DATA_SUFFIX))?;
        let mut parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 3 {
            return None;
        }
        let index: u64 = parts.pop()?.parse().ok()?;
        let temporary = parts.last() == Some(&TEMP_MARKER);
        if temporary {
            parts.pop();
        }
        if parts.len() != 2 {
            return None;
        }
        Some(SegmentName {
            table: parts[0].to_string(),
            cf: parts[1].to_string(),
            index,
            temporary,
        })
    }
}

pub fn data_file_name(table: &str, cf: &str, index: u64) -> String {
    format!("{}-{}-{}-{}", table, cf, index, DATA_SUFFIX)
}

pub fn temp_file_name(table: &str, cf: &str, index: u64, suffix: &str) -> String {
    format!("{}-{}-{}-{}-{}", table, cf, TEMP_MARKER, index, suffix)
}

/// Sibling path of a data file: same segment, different suffix.
pub fn sibling_path(data_path: &Path, suffix: &str) -> Result<PathBuf> {
    let name = data_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StorageError::Segment(format!("bad segment path: {:?}", data_path)))?;
    let stem = name
        .strip_suffix(DATA_SUFFIX)
        .ok_or_else(|| StorageError::Segment(format!("not a data file: {:?}", data_path)))?;
    Ok(data_path.with_file_name(format!("{}{}", stem, suffix)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_round_trip() {
        let name = data_file_name("keyspace", "profile", 7);
        assert_eq!(name, "keyspace-profile-7-Data.db");

        let parsed = SegmentName::parse(&name).unwrap();
        assert_eq!(parsed.table, "keyspace");
        assert_eq!(parsed.cf, "profile");
        assert_eq!(parsed.index, 7);
        assert!(!parsed.temporary);
    }

    #[test]
    fn test_temp_marker_detected() {
        let name = temp_file_name("ks", "cf", 3, DATA_SUFFIX);
        let parsed = SegmentName::parse(&name).unwrap();
        assert!(parsed.temporary);
        assert_eq!(parsed.index, 3);
    }

    #[test]
    fn test_non_segment_files_rejected() {
        assert!(SegmentName::parse("metadata.json").is_none());
        assert!(SegmentName::parse("ks-cf-7-Index.db").is_none());
    }

    #[test]
    fn test_sibling_path() {
        let data = PathBuf::from("/data/ks-cf-7-Data.db");
        let index = sibling_path(&data, INDEX_SUFFIX).unwrap();
        assert_eq!(index, PathBuf::from("/data/ks-cf-7-Index.db"));
    }
}
