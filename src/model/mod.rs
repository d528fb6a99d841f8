//! Column-family data model
//!
//! A row holds column families; a column family holds columns sorted by
//! name; a column is either a leaf cell or a super column (one nesting
//! level of cells). Deletion is explicit at every level: each object
//! carries its own deletion stamp rather than inferring tombstones from
//! empty values.

mod column;
mod column_family;
mod row;

pub use column::{Cell, Column, SuperColumn};
pub use column_family::{remove_deleted, ColumnFamily, ColumnFamilyKind};
pub use row::Row;

/// Sentinel for "not deleted" on second-resolution deletion times.
pub const NO_DELETION_TIME: i32 = i32::MIN;

/// Sentinel for "not deleted" on microsecond deletion timestamps.
pub const NO_DELETION_TIMESTAMP: i64 = i64::MIN;
