//! Commit log header: per-family dirty bits and replay positions
//!
//! The header lives at offset 0 of every log file and is rewritten in
//! place. One bit per column family id says whether the file still holds
//! unflushed writes for that family; the matching offset records where its
//! first unflushed write begins, so replay can seek past flushed data.

use crate::encoding;
use crate::{Result, StorageError};
use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitLogHeader {
    dirty: Vec<bool>,
    positions: Vec<i32>,
}

impl CommitLogHeader {
    pub fn new(cf_count: usize) -> Self {
        Self {
            dirty: vec![false; cf_count],
            positions: vec![0; cf_count],
        }
    }

    pub fn cf_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn turn_on(&mut self, id: usize, position: u64) {
        self.dirty[id] = true;
        self.positions[id] = position as i32;
    }

    pub fn turn_off(&mut self, id: usize) {
        self.dirty[id] = false;
        self.positions[id] = 0;
    }

    pub fn is_dirty(&self, id: usize) -> bool {
        id < self.dirty.len() && self.dirty[id]
    }

    pub fn position_of(&self, id: usize) -> u64 {
        self.positions[id] as u64
    }

    /// A file whose header has no dirty bits holds nothing unflushed and
    /// can be deleted.
    pub fn is_safe_to_delete(&self) -> bool {
        self.dirty.iter().all(|d| !d)
    }

    /// Lowest replay position among dirty families (0 if none are dirty).
    pub fn lowest_dirty_position(&self) -> u64 {
        self.dirty
            .iter()
            .zip(&self.positions)
            .filter(|(d, _)| **d)
            .map(|(_, p)| *p as u64)
            .min()
            .unwrap_or(0)
    }

    /// Layout: `dirtyBitsetLength | bitset bytes | offsetsCount | offsets`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());
        buf.extend_from_slice(&(self.dirty.len() as i32).to_be_bytes());
        for d in &self.dirty {
            buf.push(*d as u8);
        }
        buf.extend_from_slice(&(self.positions.len() as i32).to_be_bytes());
        for p in &self.positions {
            buf.extend_from_slice(&p.to_be_bytes());
        }
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let bit_len = encoding::read_i32(&mut cur)?;
        if bit_len < 0 {
            return Err(StorageError::Corruption(
                "negative bitset length in commit log header".into(),
            ));
        }
        let mut dirty = Vec::with_capacity(bit_len as usize);
        for _ in 0..bit_len {
            dirty.push(encoding::read_u8(&mut cur)? != 0);
        }
        let offset_count = encoding::read_i32(&mut cur)?;
        if offset_count != bit_len {
            return Err(StorageError::Corruption(format!(
                "commit log header mismatch: {} bits, {} offsets",
                bit_len, offset_count
            )));
        }
        let mut positions = Vec::with_capacity(offset_count as usize);
        for _ in 0..offset_count {
            positions.push(encoding::read_i32(&mut cur)?);
        }
        Ok(Self { dirty, positions })
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.dirty.len() + 4 + self.positions.len() * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_bit_lifecycle() {
        let mut header = CommitLogHeader::new(3);
        assert!(header.is_safe_to_delete());

        header.turn_on(1, 4096);
        assert!(header.is_dirty(1));
        assert!(!header.is_dirty(0));
        assert_eq!(header.position_of(1), 4096);
        assert!(!header.is_safe_to_delete());

        header.turn_off(1);
        assert!(header.is_safe_to_delete());
    }

    #[test]
    fn test_round_trip() {
        let mut header = CommitLogHeader::new(4);
        header.turn_on(0, 128);
        header.turn_on(3, 9000);

        let restored = CommitLogHeader::deserialize(&header.serialize()).unwrap();
        assert_eq!(restored, header);
        assert_eq!(restored.serialized_size(), header.serialize().len());
    }

    #[test]
    fn test_lowest_dirty_position() {
        let mut header = CommitLogHeader::new(3);
        assert_eq!(header.lowest_dirty_position(), 0);
        header.turn_on(0, 500);
        header.turn_on(2, 100);
        assert_eq!(header.lowest_dirty_position(), 100);
    }
}
