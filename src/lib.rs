//! cfstore: a single-node column family storage engine
//!
//! Rows are keyed by string and hold named column families; a family holds
//! columns (or super columns holding cells), each stamped with a client
//! timestamp. Writes go to a commit log and an in-memory memtable;
//! memtables flush to immutable sorted segment files; reads collate every
//! live version of a row and resolve conflicts by timestamp; compaction
//! merges segments and purges expired tombstones.
//!
//! ## Architecture
//! - Write path: commit log (fsync per append) -> memtable -> segment
//! - Read path: bloom filter -> key cache -> sparse index -> column index
//! - Deletes: tombstones at cell, super column, and family level, collected
//!   once older than the GC grace period
//!
//! ```no_run
//! use cfstore::{Config, ColumnFamily, ColumnFamilyKind, QueryFilter, Row, Table};
//! use cfstore::RandomPartitioner;
//! use std::sync::Arc;
//!
//! # fn main() -> cfstore::Result<()> {
//! let table = Table::open(
//!     "ks",
//!     &[("profile", ColumnFamilyKind::Standard)],
//!     Config::new("/var/lib/cfstore"),
//!     Arc::new(RandomPartitioner::new()),
//! )?;
//!
//! let mut cf = ColumnFamily::new("profile", ColumnFamilyKind::Standard);
//! cf.insert("email", b"alice@example.com".to_vec(), 1);
//! let mut row = Row::new("alice");
//! row.add_column_family(cf);
//! table.apply(row)?;
//!
//! let result = table.read("alice", "profile", &QueryFilter::identity())?;
//! # Ok(())
//! # }
//! ```

pub mod bloom;
pub mod collated;
pub mod commitlog;
pub mod compaction;
pub mod config;
pub mod filter;
pub mod memtable;
pub mod model;
pub mod partitioner;
pub mod sstable;
pub mod store;
pub mod table;

mod encoding;
mod error;

pub use config::Config;
pub use error::{Result, StorageError};
pub use filter::QueryFilter;
pub use model::{Cell, Column, ColumnFamily, ColumnFamilyKind, Row, SuperColumn};
pub use partitioner::{OrderPreservingPartitioner, Partitioner, RandomPartitioner};
pub use table::Table;
