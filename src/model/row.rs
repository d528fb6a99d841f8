//! Row: the unit of mutation
//!
//! A row groups the column families touched by one write under a single
//! raw key. Rows are transient — the commit log records them whole, the
//! memtable and segments store each family separately.

use super::{ColumnFamily, ColumnFamilyKind};
use crate::encoding;
use crate::{Result, StorageError};
use ahash::AHashMap;
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: String,
    column_families: AHashMap<String, ColumnFamily>,
}

impl Row {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            column_families: AHashMap::new(),
        }
    }

    pub fn add_column_family(&mut self, cf: ColumnFamily) {
        match self.column_families.get_mut(&cf.name) {
            Some(existing) => existing.add_all(cf),
            None => {
                self.column_families.insert(cf.name.clone(), cf);
            }
        }
    }

    pub fn column_family(&self, name: &str) -> Option<&ColumnFamily> {
        self.column_families.get(name)
    }

    pub fn column_families(&self) -> impl Iterator<Item = &ColumnFamily> {
        self.column_families.values()
    }

    pub fn into_column_families(self) -> impl Iterator<Item = ColumnFamily> {
        self.column_families.into_values()
    }

    pub fn is_empty(&self) -> bool {
        self.column_families.is_empty()
    }

    pub fn serialized_size(&self) -> usize {
        encoding::string_size(&self.key)
            + 4
            + self
                .column_families
                .values()
                .map(|cf| encoding::string_size(&cf.name) + 1 + cf.serialized_size())
                .sum::<usize>()
    }

    /// Commit log layout: `key | cfCount | (name | kind | family)...`.
    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        encoding::write_string(w, &self.key)?;
        encoding::write_i32(w, self.column_families.len() as i32)?;
        for cf in self.column_families.values() {
            encoding::write_string(w, &cf.name)?;
            let kind = match cf.kind {
                ColumnFamilyKind::Standard => 0u8,
                ColumnFamilyKind::Super => 1u8,
            };
            encoding::write_u8(w, kind)?;
            cf.serialize(w)?;
        }
        Ok(())
    }

    pub fn deserialize<R: Read>(r: &mut R) -> Result<Self> {
        let key = encoding::read_string(r)?;
        let count = encoding::read_i32(r)?;
        if count < 0 {
            return Err(StorageError::Corruption(format!(
                "negative family count in row {:?}",
                key
            )));
        }
        let mut row = Row::new(key);
        for _ in 0..count {
            let name = encoding::read_string(r)?;
            let kind = match encoding::read_u8(r)? {
                0 => ColumnFamilyKind::Standard,
                1 => ColumnFamilyKind::Super,
                other => {
                    return Err(StorageError::Corruption(format!(
                        "unknown column family kind tag: {}",
                        other
                    )))
                }
            };
            row.add_column_family(ColumnFamily::deserialize(r, name, kind)?);
        }
        Ok(row)
    }
}
