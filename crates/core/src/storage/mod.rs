//! The pluggable, versioned external blob store.
//!
//! Keys are opaque strings; every upload mints a new immutable version. The
//! layers above never talk to an [`ExternalStorage`] directly for document
//! data: they go through [`keyed::KeyedStorage`], which owns the key layout.
//!
//! Implementations may serve cached reads: `exists`, `versions`, `head` and
//! latest-version downloads are allowed to be stale with respect to recent
//! uploads and removals for a bounded TTL. Callers verify downloaded content
//! against the checksum registry and retry, so a stale read delays
//! convergence but never corrupts state.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StorageError};

pub mod cached;
pub mod keyed;
pub mod memory;

pub use keyed::{KeyedStorage, Purpose};

/// Metadata attached to an uploaded version: an open string map. Unknown
/// keys pass through untouched; the recognized ones have accessors on
/// [`ObjSnapshot`].
pub type SnapshotMetadata = BTreeMap<String, String>;

pub const META_LABEL: &str = "label";
pub const META_TZ: &str = "tz";
pub const META_ACTION_HASH: &str = "h";

/// One stored version of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjSnapshot {
    pub snapshot_id: String,
    pub last_modified: DateTime<Utc>,
    pub metadata: SnapshotMetadata,
}

impl ObjSnapshot {
    pub fn label(&self) -> Option<&str> {
        self.metadata.get(META_LABEL).map(|s| s.as_str())
    }

    /// The document's timezone at push time.
    pub fn timezone(&self) -> Option<&str> {
        self.metadata.get(META_TZ).map(|s| s.as_str())
    }

    /// The head action hash at push time.
    pub fn action_hash(&self) -> Option<&str> {
        self.metadata.get(META_ACTION_HASH).map(|s| s.as_str())
    }
}

/// A versioned key → bytes store.
#[async_trait]
pub trait ExternalStorage: Send + Sync + 'static {
    /// Whether the key (or one specific version of it) is addressable.
    async fn exists(&self, key: &str, snapshot_id: Option<&str>) -> Result<bool>;

    /// The requested version with its metadata, defaulting to the latest.
    async fn head(&self, key: &str, snapshot_id: Option<&str>) -> Result<Option<ObjSnapshot>>;

    /// Store the file at `source` as a new version; returns the minted id.
    async fn upload(
        &self,
        key: &str,
        source: &Path,
        metadata: Option<SnapshotMetadata>,
    ) -> Result<String>;

    /// Write the requested version's bytes to `dest`; returns the id served.
    ///
    /// On failure, `dest` is either left absent or holds content that cannot
    /// pass token verification; a partial-but-valid file is never produced.
    async fn download(&self, key: &str, dest: &Path, snapshot_id: Option<&str>) -> Result<String>;

    /// All versions of the key, newest first.
    async fn versions(&self, key: &str) -> Result<Vec<ObjSnapshot>>;

    /// With `snapshot_ids`, remove exactly those versions; without, remove
    /// the key entirely.
    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> Result<()>;

    /// Human-displayable locator for the key.
    fn url(&self, key: &str) -> String;

    /// Whether an error from this store is worth retrying.
    fn is_fatal(&self, err: &StorageError) -> bool {
        !err.is_transient()
    }
}
