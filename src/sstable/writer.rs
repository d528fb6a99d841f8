//! Segment writer
//!
//! Rows must arrive in strictly ascending decorated key order; anything
//! else is rejected before it can corrupt the file. All three files are
//! written under temp names, fsynced, then renamed into place, and the
//! finished segment is handed back as an open reader without re-reading
//! what was just written.

use super::reader::SSTableReader;
use super::{
    data_file_name, sibling_path, temp_file_name, KeyPosition, DATA_SUFFIX, FILTER_SUFFIX,
    INDEX_SUFFIX,
};
use crate::bloom::BloomFilter;
use crate::config::Config;
use crate::encoding;
use crate::model::ColumnFamilyKind;
use crate::partitioner::Partitioner;
use crate::{Result, StorageError};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct SSTableWriter {
    dir: PathBuf,
    table: String,
    cf: String,
    kind: ColumnFamilyKind,
    file_index: u64,

    data: BufWriter<File>,
    temp_data_path: PathBuf,

    bloom: BloomFilter,
    sparse: Vec<KeyPosition>,
    index_interval: usize,

    last_key: Option<String>,
    row_count: usize,
    offset: u64,
}

impl SSTableWriter {
    pub fn create(
        dir: &Path,
        table: &str,
        cf: &str,
        kind: ColumnFamilyKind,
        file_index: u64,
        expected_keys: usize,
        config: &Config,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let temp_data_path = dir.join(temp_file_name(table, cf, file_index, DATA_SUFFIX));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_data_path)
            .map_err(|e| StorageError::Segment(format!("create {:?}: {}", temp_data_path, e)))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            table: table.to_string(),
            cf: cf.to_string(),
            kind,
            file_index,
            data: BufWriter::new(file),
            temp_data_path,
            bloom: BloomFilter::with_capacity(expected_keys, config.bloom_bits_per_element),
            sparse: Vec::new(),
            index_interval: config.index_interval,
            last_key: None,
            row_count: 0,
            offset: 0,
        })
    }

    /// Append one row: the decorated key, its body length, and the body
    /// produced by [`serialize_row`](super::serialize_row).
    pub fn append(&mut self, decorated_key: &str, row_body: &[u8]) -> Result<()> {
        if decorated_key.is_empty() {
            return Err(StorageError::InvalidData(
                "empty decorated key in segment append".into(),
            ));
        }
        if let Some(last) = &self.last_key {
            if last.as_str() >= decorated_key {
                return Err(StorageError::Corruption(format!(
                    "segment keys out of order: {:?} after {:?}",
                    decorated_key, last
                )));
            }
        }

        if self.row_count % self.index_interval == 0 {
            self.sparse.push(KeyPosition {
                key: decorated_key.to_string(),
                offset: self.offset,
            });
        }

        encoding::write_string(&mut self.data, decorated_key)?;
        encoding::write_i32(&mut self.data, row_body.len() as i32)?;
        self.data.write_all(row_body)?;

        self.bloom.fill(decorated_key);
        self.offset += (encoding::string_size(decorated_key) + 4 + row_body.len()) as u64;
        self.last_key = Some(decorated_key.to_string());
        self.row_count += 1;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// Finish the segment and open it for reading. The sparse index and
    /// bloom filter move straight into the reader; nothing is re-read.
    pub fn close(self, partitioner: Arc<dyn Partitioner>, config: &Config) -> Result<SSTableReader> {
        let mut data = self
            .data
            .into_inner()
            .map_err(|e| StorageError::Segment(format!("segment flush failed: {}", e)))?;
        data.sync_all()?;
        drop(data);

        // Index file: the sparse entries, in order
        let temp_index_path = self
            .dir
            .join(temp_file_name(&self.table, &self.cf, self.file_index, INDEX_SUFFIX));
        let mut index_file = BufWriter::new(File::create(&temp_index_path)?);
        for entry in &self.sparse {
            encoding::write_string(&mut index_file, &entry.key)?;
            encoding::write_u64(&mut index_file, entry.offset)?;
        }
        let index_file = index_file
            .into_inner()
            .map_err(|e| StorageError::Segment(format!("index flush failed: {}", e)))?;
        index_file.sync_all()?;
        drop(index_file);

        // Filter file: the serialized key bloom
        let temp_filter_path = self
            .dir
            .join(temp_file_name(&self.table, &self.cf, self.file_index, FILTER_SUFFIX));
        let mut filter_file = File::create(&temp_filter_path)?;
        filter_file.write_all(&self.bloom.to_bytes())?;
        filter_file.sync_all()?;
        drop(filter_file);

        // Rename the data file last: its presence marks the segment live
        let data_path = self
            .dir
            .join(data_file_name(&self.table, &self.cf, self.file_index));
        let index_path = sibling_path(&data_path, INDEX_SUFFIX)?;
        let filter_path = sibling_path(&data_path, FILTER_SUFFIX)?;
        std::fs::rename(&temp_index_path, &index_path)?;
        std::fs::rename(&temp_filter_path, &filter_path)?;
        std::fs::rename(&self.temp_data_path, &data_path)?;

        info!(
            path = %data_path.display(),
            rows = self.row_count,
            "segment written"
        );

        SSTableReader::from_parts(
            data_path,
            self.cf,
            self.kind,
            self.file_index,
            self.sparse,
            self.bloom,
            partitioner,
            config,
        )
    }

    /// Drop an unfinished segment, removing its temp files.
    pub fn abort(self) -> Result<()> {
        drop(self.data);
        std::fs::remove_file(&self.temp_data_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnFamily, ColumnFamilyKind};
    use crate::partitioner::OrderPreservingPartitioner;
    use crate::sstable::serialize_row;
    use tempfile::TempDir;

    fn row_body(cols: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        for (name, value) in cols {
            cf.insert(*name, value.to_vec(), 1);
        }
        let mut buf = Vec::new();
        serialize_row(&cf, 64, 10, &mut buf).unwrap();
        buf
    }

    fn writer(dir: &Path) -> SSTableWriter {
        SSTableWriter::create(
            dir,
            "ks",
            "profile",
            ColumnFamilyKind::Standard,
            1,
            16,
            &Config::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_out_of_order_append_rejected() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(dir.path());
        w.append("kb", &row_body(&[("a", b"1")])).unwrap();

        assert!(w.append("ka", &row_body(&[("a", b"1")])).is_err());
        assert!(w.append("kb", &row_body(&[("a", b"1")])).is_err());
        assert!(w.append("", &row_body(&[("a", b"1")])).is_err());
    }

    #[test]
    fn test_close_renames_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(dir.path());
        w.append("ka", &row_body(&[("a", b"1")])).unwrap();
        let reader = w
            .close(Arc::new(OrderPreservingPartitioner), &Config::default())
            .unwrap();

        assert!(dir.path().join("ks-profile-1-Data.db").exists());
        assert!(dir.path().join("ks-profile-1-Index.db").exists());
        assert!(dir.path().join("ks-profile-1-Filter.db").exists());
        // No temp leftovers
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains("-tmp-")
            })
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(reader.row_count_estimate(), Config::default().index_interval);
    }

    #[test]
    fn test_abort_removes_temp_data() {
        let dir = TempDir::new().unwrap();
        let mut w = writer(dir.path());
        w.append("ka", &row_body(&[("a", b"1")])).unwrap();
        w.abort().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
