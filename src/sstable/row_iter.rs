//! Sequential whole-segment scan
//!
//! Walks every row in key order, fully deserializing each. This is the
//! compaction input path; point reads never use it.

use super::deserialize_row_body;
use crate::encoding;
use crate::model::{ColumnFamily, ColumnFamilyKind};
use crate::{Result, StorageError};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub struct SSTableScanner {
    file: BufReader<File>,
    length: u64,
    position: u64,
    cf_name: String,
    kind: ColumnFamilyKind,
}

impl SSTableScanner {
    pub(super) fn open(
        data_path: &Path,
        cf_name: String,
        kind: ColumnFamilyKind,
        length: u64,
    ) -> Result<Self> {
        Ok(Self {
            file: BufReader::new(File::open(data_path)?),
            length,
            position: 0,
            cf_name,
            kind,
        })
    }

    fn read_next(&mut self) -> Result<(String, ColumnFamily)> {
        let key = encoding::read_string(&mut self.file)?;
        let row_len = encoding::read_i32(&mut self.file)?;
        if row_len < 0 {
            return Err(StorageError::Corruption(
                "negative row length in segment scan".into(),
            ));
        }
        let mut body = vec![0u8; row_len as usize];
        self.file.read_exact(&mut body)?;
        self.position += (encoding::string_size(&key) + 4 + row_len as usize) as u64;

        let cf = deserialize_row_body(
            &mut std::io::Cursor::new(body),
            self.cf_name.clone(),
            self.kind,
        )?;
        Ok((key, cf))
    }
}

impl Iterator for SSTableScanner {
    type Item = Result<(String, ColumnFamily)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.length {
            return None;
        }
        Some(self.read_next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::partitioner::OrderPreservingPartitioner;
    use crate::sstable::{serialize_row, SSTableWriter};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_scan_yields_all_rows_in_order() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let mut writer = SSTableWriter::create(
            dir.path(),
            "ks",
            "profile",
            ColumnFamilyKind::Standard,
            1,
            3,
            &config,
        )
        .unwrap();

        for key in ["ka", "kb", "kc"] {
            let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
            cf.insert("col", key.as_bytes().to_vec(), 1);
            let mut body = Vec::new();
            serialize_row(&cf, 64, 10, &mut body).unwrap();
            writer.append(key, &body).unwrap();
        }
        let reader = writer
            .close(Arc::new(OrderPreservingPartitioner), &config)
            .unwrap();

        let rows: Vec<(String, ColumnFamily)> = reader
            .scan()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ka", "kb", "kc"]);
        assert_eq!(rows[1].1.len(), 1);
    }

    #[test]
    fn test_scan_empty_segment() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let writer = SSTableWriter::create(
            dir.path(),
            "ks",
            "profile",
            ColumnFamilyKind::Standard,
            2,
            0,
            &config,
        )
        .unwrap();
        let reader = writer
            .close(Arc::new(OrderPreservingPartitioner), &config)
            .unwrap();
        assert_eq!(reader.scan().unwrap().count(), 0);
    }
}
