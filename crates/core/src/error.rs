use std::path::PathBuf;

use thiserror::Error;

use crate::control_db;

pub type Result<T> = core::result::Result<T, StorageError>;

/// Everything that can go wrong in the hosted storage core.
///
/// The first group of variants is the failure taxonomy surfaced to callers;
/// the rest are infrastructure conversions.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no worker available to take document {0}")]
    Unavailable(String),
    #[error("storage for document {0} did not become consistent after retries")]
    Inconsistent(String),
    #[error("document {0} is deleted")]
    Deleted(String),
    #[error("fork {0} not found")]
    ForkNotFound(String),
    #[error("{0} is an immutable snapshot")]
    SnapshotImmutable(String),
    #[error("document {doc_id} has schema v{found}, newer than supported v{current}")]
    MigrationRequired {
        doc_id: String,
        found: i64,
        current: i64,
    },
    #[error("document {0} is already being prepared in parallel")]
    PrepareInParallel(String),
    #[error("{0} is not a valid fork of {1}")]
    InvalidFork(String, String),
    #[error("{object} is {size} bytes, over the {limit} byte limit")]
    TooLarge {
        object: String,
        size: u64,
        limit: u64,
    },
    #[error("object {0} not found in external storage")]
    ObjectNotFound(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("local doc root {0} is locked by another process")]
    RootLocked(PathBuf),

    #[error("ControlDbError: {0}")]
    Control(#[from] control_db::Error),
    #[error("SqliteError: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("JsonError: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Whether retrying the failed operation can possibly help.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}
