//! Error types for the cfstore storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Commit log append or header write failed. The log can no longer
    /// guarantee durability for subsequent writes, so callers must treat
    /// the engine as unusable once they see this.
    #[error("Commit log error: {0}")]
    CommitLog(String),

    #[error("Memtable error: {0}")]
    Memtable(String),

    #[error("Segment error: {0}")]
    Segment(String),

    #[error("Compaction error: {0}")]
    Compaction(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown column family: {0}")]
    UnknownColumnFamily(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidData(err.to_string())
    }
}
