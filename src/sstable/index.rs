//! Per-row column index and the on-disk row layout
//!
//! A row's columns are grouped into contiguous blocks of at least
//! `column_index_size_bytes` serialized bytes; one [`IndexInfo`] per block
//! records its name range and position. A reader answering a slice or
//! names query seeks straight to the first candidate block instead of
//! scanning the row from its start.
//!
//! ## Row layout
//! `localDeletionTime(i32) | markedForDeleteAt(i64) |
//!  bloomLength(i32) + bloom | indexLength(i32) + entries |
//!  columnCount(i32) | columns...`
//!
//! preceded in the data file by the length-prefixed decorated key and the
//! i32 byte length of everything above.

use crate::bloom::BloomFilter;
use crate::encoding;
use crate::model::{Column, ColumnFamily, ColumnFamilyKind};
use crate::{Result, StorageError};
use std::io::{Cursor, Read, Seek, Write};

/// Name range and position of one column block inside a row. Offsets are
/// relative to the first column byte, widths in serialized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub first_name: String,
    pub last_name: String,
    pub offset: u64,
    pub width: u64,
}

impl IndexInfo {
    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        encoding::write_string(w, &self.first_name)?;
        encoding::write_string(w, &self.last_name)?;
        encoding::write_u64(w, self.offset)?;
        encoding::write_u64(w, self.width)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            first_name: encoding::read_string(r)?,
            last_name: encoding::read_string(r)?,
            offset: encoding::read_u64(r)?,
            width: encoding::read_u64(r)?,
        })
    }
}

/// Group a family's columns into index blocks of at least `block_size`
/// serialized bytes each. The trailing partial block is always emitted, so
/// a non-empty family always yields at least one block.
pub fn build_column_index(cf: &ColumnFamily, block_size: usize) -> Vec<IndexInfo> {
    let mut blocks = Vec::new();
    let mut first: Option<&str> = None;
    let mut last: Option<&str> = None;
    let mut block_start = 0u64;
    let mut position = 0u64;

    for column in cf.columns() {
        if first.is_none() {
            first = Some(column.name());
        }
        last = Some(column.name());
        position += column.serialized_size() as u64;

        if position - block_start >= block_size as u64 {
            blocks.push(IndexInfo {
                first_name: first.unwrap_or_default().to_string(),
                last_name: last.unwrap_or_default().to_string(),
                offset: block_start,
                width: position - block_start,
            });
            block_start = position;
            first = None;
            last = None;
        }
    }

    if let (Some(first), Some(last)) = (first, last) {
        blocks.push(IndexInfo {
            first_name: first.to_string(),
            last_name: last.to_string(),
            offset: block_start,
            width: position - block_start,
        });
    }

    debug_assert!(cf.is_empty() || !blocks.is_empty());
    blocks
}

/// Find the block where iteration for `name` begins. Returns
/// `blocks.len()` when no block can contain it (the exhausted sentinel).
///
/// Forward: the first block whose name range ends at or after `name`; an
/// empty `name` starts at the first block. Reversed: the last block whose
/// range starts at or before `name`; an empty `name` starts at the last.
pub fn index_for(name: &str, blocks: &[IndexInfo], reversed: bool) -> usize {
    if blocks.is_empty() {
        return 0;
    }
    if reversed {
        if name.is_empty() {
            return blocks.len() - 1;
        }
        let at_or_before = blocks.partition_point(|b| b.first_name.as_str() <= name);
        if at_or_before == 0 {
            blocks.len()
        } else {
            at_or_before - 1
        }
    } else {
        if name.is_empty() {
            return 0;
        }
        blocks.partition_point(|b| b.last_name.as_str() < name)
    }
}

/// Serialize a family as a segment row body (everything the row byte
/// length covers). The row bloom filter holds every column name and, for
/// super families, every sub-column name.
pub fn serialize_row<W: Write>(
    cf: &ColumnFamily,
    block_size: usize,
    bloom_bits_per_element: usize,
    w: &mut W,
) -> Result<()> {
    encoding::write_i32(w, cf.local_deletion_time)?;
    encoding::write_i64(w, cf.marked_for_delete_at)?;

    let mut bloom = BloomFilter::with_capacity(cf.object_count(), bloom_bits_per_element);
    for column in cf.columns() {
        bloom.fill(column.name());
        if let Column::Super(sc) = column {
            for cell in sc.cells() {
                bloom.fill(&cell.name);
            }
        }
    }
    encoding::write_bytes(w, &bloom.to_bytes())?;

    let blocks = build_column_index(cf, block_size);
    if !cf.is_empty() && blocks.is_empty() {
        return Err(StorageError::Corruption(format!(
            "no index blocks for non-empty family {:?}",
            cf.name
        )));
    }
    let mut index_buf = Vec::new();
    for block in &blocks {
        block.serialize(&mut index_buf)?;
    }
    encoding::write_bytes(w, &index_buf)?;

    encoding::write_i32(w, cf.len() as i32)?;
    for column in cf.columns() {
        column.serialize(w)?;
    }
    Ok(())
}

/// Row header plus everything needed to seek within its columns.
pub struct RowPrelude {
    pub local_deletion_time: i32,
    pub marked_for_delete_at: i64,
    pub bloom: BloomFilter,
    pub index: Vec<IndexInfo>,
    pub column_count: i32,
    /// Absolute file offset of the first column byte
    pub columns_offset: u64,
}

/// Read a row up to (not including) its columns. The reader must be
/// positioned just past the row byte length.
pub fn read_row_prelude<R: Read + Seek>(r: &mut R) -> Result<RowPrelude> {
    let local_deletion_time = encoding::read_i32(r)?;
    let marked_for_delete_at = encoding::read_i64(r)?;
    let bloom = BloomFilter::from_bytes(&encoding::read_byte_buf(r)?)?;

    let index_buf = encoding::read_byte_buf(r)?;
    let mut index = Vec::new();
    let mut cur = Cursor::new(&index_buf);
    while (cur.position() as usize) < index_buf.len() {
        index.push(IndexInfo::deserialize(&mut cur)?);
    }

    let column_count = encoding::read_i32(r)?;
    if column_count < 0 {
        return Err(StorageError::Corruption(
            "negative column count in segment row".into(),
        ));
    }
    let columns_offset = r.stream_position()?;
    Ok(RowPrelude {
        local_deletion_time,
        marked_for_delete_at,
        bloom,
        index,
        column_count,
        columns_offset,
    })
}

/// Deserialize a full row body into a family (whole-row reads and
/// compaction scans; the bloom and index are skipped, not kept).
pub fn deserialize_row_body<R: Read>(
    r: &mut R,
    name: impl Into<String>,
    kind: ColumnFamilyKind,
) -> Result<ColumnFamily> {
    let mut cf = ColumnFamily::new(name, kind);
    cf.local_deletion_time = encoding::read_i32(r)?;
    cf.marked_for_delete_at = encoding::read_i64(r)?;
    let _bloom = encoding::read_byte_buf(r)?;
    let _index = encoding::read_byte_buf(r)?;
    let count = encoding::read_i32(r)?;
    if count < 0 {
        return Err(StorageError::Corruption(
            "negative column count in segment row".into(),
        ));
    }
    for _ in 0..count {
        cf.add_column(Column::deserialize(r, kind)?);
    }
    Ok(cf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family_with(names: &[&str], value_len: usize) -> ColumnFamily {
        let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        for name in names {
            cf.insert(*name, vec![0u8; value_len], 1);
        }
        cf
    }

    #[test]
    fn test_blocks_cover_all_columns_in_order() {
        let cf = family_with(&["a", "b", "c", "d", "e"], 40);
        let blocks = build_column_index(&cf, 100);

        assert!(blocks.len() > 1);
        assert_eq!(blocks[0].first_name, "a");
        assert_eq!(blocks.last().unwrap().last_name, "e");
        // Blocks are contiguous
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].offset + pair[0].width, pair[1].offset);
        }
        let total: u64 = blocks.iter().map(|b| b.width).sum();
        assert_eq!(total, cf.columns_size() as u64);
    }

    #[test]
    fn test_trailing_partial_block_emitted() {
        let cf = family_with(&["a", "b", "c"], 10);
        let blocks = build_column_index(&cf, 1 << 20);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].first_name, "a");
        assert_eq!(blocks[0].last_name, "c");
    }

    #[test]
    fn test_empty_family_has_no_blocks() {
        let cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
        assert!(build_column_index(&cf, 64).is_empty());
    }

    #[test]
    fn test_index_for_forward() {
        let blocks = vec![
            IndexInfo {
                first_name: "a".into(),
                last_name: "f".into(),
                offset: 0,
                width: 10,
            },
            IndexInfo {
                first_name: "g".into(),
                last_name: "m".into(),
                offset: 10,
                width: 10,
            },
        ];
        assert_eq!(index_for("", &blocks, false), 0);
        assert_eq!(index_for("c", &blocks, false), 0);
        assert_eq!(index_for("g", &blocks, false), 1);
        // Past every block: sentinel
        assert_eq!(index_for("z", &blocks, false), 2);
    }

    #[test]
    fn test_index_for_reversed() {
        let blocks = vec![
            IndexInfo {
                first_name: "a".into(),
                last_name: "f".into(),
                offset: 0,
                width: 10,
            },
            IndexInfo {
                first_name: "g".into(),
                last_name: "m".into(),
                offset: 10,
                width: 10,
            },
        ];
        assert_eq!(index_for("", &blocks, true), 1);
        assert_eq!(index_for("h", &blocks, true), 1);
        assert_eq!(index_for("c", &blocks, true), 0);
        // Before every block: sentinel
        assert_eq!(index_for("A", &blocks, true), 2);
    }

    #[test]
    fn test_row_round_trip() {
        let cf = family_with(&["a", "b", "c"], 16);
        let mut buf = Vec::new();
        serialize_row(&cf, 32, 10, &mut buf).unwrap();

        let restored =
            deserialize_row_body(&mut Cursor::new(&buf), "profile", ColumnFamilyKind::Standard)
                .unwrap();
        assert_eq!(restored, cf);
    }

    #[test]
    fn test_prelude_bloom_covers_sub_columns() {
        use crate::model::Cell;
        let mut cf = ColumnFamily::new("groups", ColumnFamilyKind::Super);
        cf.insert_sub("g1", Cell::new("member", b"x".to_vec(), 1));

        let mut buf = Vec::new();
        serialize_row(&cf, 32, 10, &mut buf).unwrap();
        let prelude = read_row_prelude(&mut Cursor::new(&buf)).unwrap();

        assert!(prelude.bloom.is_present("g1"));
        assert!(prelude.bloom.is_present("member"));
        assert_eq!(prelude.column_count, 1);
    }
}
