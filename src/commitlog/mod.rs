//! Commit log: the per-table write-ahead journal
//!
//! Every mutation is appended and fsynced here before it touches a
//! memtable, so a crash can lose nothing that was acknowledged. Each log
//! file starts with a rewritable header of per-family dirty bits; a flush
//! clears the bits it made durable, and a file whose bits are all clear is
//! deleted. Files rotate at a size threshold.
//!
//! ## Record layout
//! `length(i32) | serialized row | crc32(u32)`, records back to back after
//! the length-prefixed header region.

mod header;

pub use header::CommitLogHeader;

use crate::encoding;
use crate::model::Row;
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Where in the log a write landed. Handed back to the store on apply and
/// returned on flush so the log knows what became durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogContext {
    pub file: PathBuf,
    pub position: u64,
}

struct LogState {
    file: File,
    path: PathBuf,
    /// Next append offset in the active file
    position: u64,
    header: CommitLogHeader,
    /// Rotated-out files still holding dirty bits, oldest first
    old_files: Vec<(PathBuf, CommitLogHeader)>,
}

pub struct CommitLog {
    directory: PathBuf,
    table: String,
    cf_count: usize,
    rotation_threshold: u64,
    next_seq: AtomicU64,
    state: Mutex<LogState>,
}

impl CommitLog {
    /// Create a fresh log for the table. Recovery of earlier log files must
    /// happen before this (see [`list_segments`](Self::list_segments) and
    /// [`replay`](Self::replay)); opening does not read them.
    pub fn open(
        directory: impl Into<PathBuf>,
        table: impl Into<String>,
        cf_count: usize,
        rotation_threshold: u64,
    ) -> Result<Self> {
        let directory = directory.into();
        let table = table.into();
        std::fs::create_dir_all(&directory)?;

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let next_seq = AtomicU64::new(millis);

        let seq = next_seq.fetch_add(1, Ordering::SeqCst);
        let state = create_segment(&directory, &table, seq, cf_count)?;

        Ok(Self {
            directory,
            table,
            cf_count,
            rotation_threshold,
            next_seq,
            state: Mutex::new(state),
        })
    }

    /// Append a serialized row, fsync, and return where it landed.
    ///
    /// `dirty_ids` are the family ids the row touches; first contact with a
    /// family in this file turns its dirty bit on. Failures here mean
    /// durability can no longer be promised, so the returned error is
    /// terminal for the engine.
    pub fn add(&self, row_bytes: &[u8], dirty_ids: &[usize]) -> Result<CommitLogContext> {
        let mut st = self.state.lock();
        let st = &mut *st;
        let record_position = st.position;

        let mut header_touched = false;
        for &id in dirty_ids {
            if !st.header.is_dirty(id) {
                st.header.turn_on(id, record_position);
                header_touched = true;
            }
        }
        if header_touched {
            write_header(&mut st.file, &st.header)?;
        }

        st.file
            .seek(SeekFrom::Start(record_position))
            .map_err(|e| StorageError::CommitLog(format!("seek failed: {}", e)))?;
        let crc = crc32fast::hash(row_bytes);
        let mut record = Vec::with_capacity(8 + row_bytes.len());
        record.extend_from_slice(&(row_bytes.len() as i32).to_be_bytes());
        record.extend_from_slice(row_bytes);
        record.extend_from_slice(&crc.to_be_bytes());
        st.file
            .write_all(&record)
            .map_err(|e| StorageError::CommitLog(format!("append failed: {}", e)))?;
        st.file
            .sync_data()
            .map_err(|e| StorageError::CommitLog(format!("fsync failed: {}", e)))?;
        st.position = record_position + record.len() as u64;

        let ctx = CommitLogContext {
            file: st.path.clone(),
            position: record_position,
        };

        if st.position >= self.rotation_threshold {
            self.rotate(st)?;
        }
        Ok(ctx)
    }

    fn rotate(&self, st: &mut LogState) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let fresh = create_segment(&self.directory, &self.table, seq, self.cf_count)?;
        let old_path = std::mem::replace(&mut st.path, fresh.path);
        let old_header = std::mem::replace(&mut st.header, fresh.header);
        st.file = fresh.file;
        st.position = fresh.position;
        info!(path = %old_path.display(), "commit log rotated");
        st.old_files.push((old_path, old_header));
        Ok(())
    }

    /// Context for the current tail of the active file. Used to tag forced
    /// flushes that are not triggered by a specific write.
    pub fn current_context(&self) -> CommitLogContext {
        let st = self.state.lock();
        CommitLogContext {
            file: st.path.clone(),
            position: st.position,
        }
    }

    /// A memtable for family `cf_id` frozen at `ctx` has been flushed.
    ///
    /// Files older than the context file carry only flushed data for this
    /// family: their bits turn off and fully-clean files are deleted. The
    /// context file keeps its bit but re-armed at the flush position, since
    /// later writes in it belong to the replacement memtable.
    pub fn on_memtable_flush(&self, cf_id: usize, ctx: &CommitLogContext) -> Result<()> {
        let mut st = self.state.lock();
        let st = &mut *st;

        if ctx.file == st.path {
            // Everything rotated out before the active file is durable now
            for (path, header) in st.old_files.iter_mut() {
                header.turn_off(cf_id);
                rewrite_header(path, header)?;
            }
            st.header.turn_off(cf_id);
            st.header.turn_on(cf_id, ctx.position);
            write_header(&mut st.file, &st.header)?;
        } else {
            let split = st.old_files.iter().position(|(p, _)| *p == ctx.file);
            let Some(split) = split else {
                // Context file already discarded by an earlier flush
                return Ok(());
            };
            for (i, (path, header)) in st.old_files.iter_mut().enumerate() {
                if i < split {
                    header.turn_off(cf_id);
                } else if i == split {
                    header.turn_on(cf_id, ctx.position);
                } else {
                    continue;
                }
                rewrite_header(path, header)?;
            }
        }

        let mut kept = Vec::with_capacity(st.old_files.len());
        for (path, header) in st.old_files.drain(..) {
            if header.is_safe_to_delete() {
                info!(path = %path.display(), "commit log segment obsolete, deleting");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to delete commit log segment");
                }
            } else {
                kept.push((path, header));
            }
        }
        st.old_files = kept;
        Ok(())
    }

    /// Log files left over for a table, in creation order.
    pub fn list_segments(directory: &Path, table: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("CommitLog-{}-", table);
        let mut paths = Vec::new();
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".log") {
                paths.push(entry.path());
            }
        }
        // Sequence numbers are fixed width, name order is creation order
        paths.sort();
        Ok(paths)
    }

    pub fn read_header(path: &Path) -> Result<CommitLogHeader> {
        let mut file = File::open(path)?;
        read_header(&mut file)
    }

    /// Replay all intact records, oldest first. Stops at the first torn or
    /// corrupt record (a crash mid-append leaves exactly one, at the tail).
    /// The callback receives each row together with the file's header so
    /// the caller can skip families whose bits are clean.
    pub fn replay<F>(path: &Path, mut apply: F) -> Result<usize>
    where
        F: FnMut(Row, &CommitLogHeader) -> Result<()>,
    {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let header = read_header(&mut file)?;

        let start = header
            .lowest_dirty_position()
            .max(header_region_size(&header));
        file.seek(SeekFrom::Start(start))?;
        let mut position = start;
        let mut replayed = 0usize;

        while position < file_len {
            if file_len - position < 8 {
                warn!(path = %path.display(), position, "torn record at commit log tail");
                break;
            }
            let len = encoding::read_i32(&mut file)?;
            if len < 0 || position + 8 + len as u64 > file_len {
                warn!(path = %path.display(), position, "torn record at commit log tail");
                break;
            }
            let mut body = vec![0u8; len as usize];
            file.read_exact(&mut body)?;
            let mut crc_buf = [0u8; 4];
            file.read_exact(&mut crc_buf)?;
            if crc32fast::hash(&body) != u32::from_be_bytes(crc_buf) {
                warn!(path = %path.display(), position, "checksum mismatch, stopping replay");
                break;
            }
            let row = Row::deserialize(&mut std::io::Cursor::new(body))?;
            apply(row, &header)?;
            replayed += 1;
            position += 8 + len as u64;
        }
        Ok(replayed)
    }

    pub fn active_path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }
}

/// Header region: `headerLength(i32) | header bytes`. Fixed size for a
/// given family count, which is what makes in-place rewrite possible.
fn header_region_size(header: &CommitLogHeader) -> u64 {
    4 + header.serialized_size() as u64
}

fn write_header(file: &mut File, header: &CommitLogHeader) -> Result<()> {
    let bytes = header.serialize();
    file.seek(SeekFrom::Start(0))
        .map_err(|e| StorageError::CommitLog(format!("header seek failed: {}", e)))?;
    file.write_all(&(bytes.len() as i32).to_be_bytes())
        .map_err(|e| StorageError::CommitLog(format!("header write failed: {}", e)))?;
    file.write_all(&bytes)
        .map_err(|e| StorageError::CommitLog(format!("header write failed: {}", e)))?;
    file.sync_data()
        .map_err(|e| StorageError::CommitLog(format!("header fsync failed: {}", e)))?;
    Ok(())
}

fn rewrite_header(path: &Path, header: &CommitLogHeader) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StorageError::CommitLog(format!("open {:?}: {}", path, e)))?;
    write_header(&mut file, header)
}

fn read_header(file: &mut File) -> Result<CommitLogHeader> {
    file.seek(SeekFrom::Start(0))?;
    let bytes = encoding::read_byte_buf(file)?;
    CommitLogHeader::deserialize(&bytes)
}

fn create_segment(directory: &Path, table: &str, seq: u64, cf_count: usize) -> Result<LogState> {
    let path = directory.join(format!("CommitLog-{}-{:020}.log", table, seq));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| StorageError::CommitLog(format!("create {:?}: {}", path, e)))?;

    let header = CommitLogHeader::new(cf_count);
    write_header(&mut file, &header)?;
    let position = header_region_size(&header);
    info!(path = %path.display(), "commit log segment created");
    Ok(LogState {
        file,
        path,
        position,
        header,
        old_files: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColumnFamily, ColumnFamilyKind};
    use tempfile::TempDir;

    fn row_bytes(key: &str, col: &str, value: &[u8], ts: i64) -> Vec<u8> {
        let mut row = Row::new(key);
        let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        cf.insert(col, value.to_vec(), ts);
        row.add_column_family(cf);
        let mut buf = Vec::new();
        row.serialize(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), "test", 2, 1024 * 1024).unwrap();

        log.add(&row_bytes("k1", "a", b"1", 1), &[0]).unwrap();
        log.add(&row_bytes("k2", "b", b"2", 2), &[0]).unwrap();
        let path = log.active_path();
        drop(log);

        let mut rows = Vec::new();
        let replayed = CommitLog::replay(&path, |row, header| {
            assert!(header.is_dirty(0));
            rows.push(row.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(replayed, 2);
        assert_eq!(rows, vec!["k1", "k2"]);
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), "test", 1, 1024 * 1024).unwrap();
        log.add(&row_bytes("k1", "a", b"1", 1), &[0]).unwrap();
        log.add(&row_bytes("k2", "a", b"2", 2), &[0]).unwrap();
        let path = log.active_path();
        drop(log);

        // Chop a few bytes off the last record
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let replayed = CommitLog::replay(&path, |_, _| Ok(())).unwrap();
        assert_eq!(replayed, 1);
    }

    #[test]
    fn test_flush_clears_dirty_bit() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), "test", 2, 1024 * 1024).unwrap();

        log.add(&row_bytes("k1", "a", b"1", 1), &[0]).unwrap();
        let ctx = log.current_context();
        log.on_memtable_flush(0, &ctx).unwrap();

        let path = log.active_path();
        let header = CommitLog::read_header(&path).unwrap();
        // Re-armed at the flush position, nothing older to replay
        assert!(header.is_dirty(0));
        assert_eq!(header.position_of(0), ctx.position);
        assert_eq!(header.lowest_dirty_position(), ctx.position);
    }

    #[test]
    fn test_rotation_and_discard() {
        let dir = TempDir::new().unwrap();
        // Threshold low enough that every append rotates
        let log = CommitLog::open(dir.path(), "test", 1, 64).unwrap();

        log.add(&row_bytes("k1", "a", b"1", 1), &[0]).unwrap();
        log.add(&row_bytes("k2", "a", b"2", 2), &[0]).unwrap();
        assert!(CommitLog::list_segments(dir.path(), "test").unwrap().len() >= 3);

        // Flushing everything up to now deletes the rotated files
        let ctx = log.current_context();
        log.on_memtable_flush(0, &ctx).unwrap();
        assert_eq!(
            CommitLog::list_segments(dir.path(), "test").unwrap().len(),
            1
        );
    }

    #[test]
    fn test_replay_skips_before_dirty_position() {
        let dir = TempDir::new().unwrap();
        let log = CommitLog::open(dir.path(), "test", 1, 1024 * 1024).unwrap();

        log.add(&row_bytes("k1", "a", b"1", 1), &[0]).unwrap();
        let ctx = log.current_context();
        log.on_memtable_flush(0, &ctx).unwrap();
        log.add(&row_bytes("k2", "a", b"2", 2), &[0]).unwrap();
        let path = log.active_path();
        drop(log);

        let mut rows = Vec::new();
        CommitLog::replay(&path, |row, _| {
            rows.push(row.key.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(rows, vec!["k2"]);
    }
}
