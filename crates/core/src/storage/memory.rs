//! In-memory [`ExternalStorage`], used by tests and single-process setups.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::storage::{ExternalStorage, ObjSnapshot, SnapshotMetadata};

#[derive(Clone)]
struct Version {
    snapshot: ObjSnapshot,
    bytes: Bytes,
}

/// A versioned store backed by a map. Versions are held newest first.
#[derive(Default)]
pub struct MemoryStorage {
    keys: Mutex<HashMap<String, Vec<Version>>>,
    counter: AtomicU64,
    /// Fail this many upcoming uploads with a transient error.
    fail_uploads: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` uploads fail with a retryable error.
    pub fn inject_upload_failures(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    fn mint_id(&self, bytes: &[u8]) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let digest = blake3::hash(bytes);
        format!("v{n}-{}", &digest.to_hex().as_str()[..8])
    }
}

#[async_trait]
impl ExternalStorage for MemoryStorage {
    async fn exists(&self, key: &str, snapshot_id: Option<&str>) -> Result<bool> {
        let keys = self.keys.lock();
        Ok(match keys.get(key) {
            None => false,
            Some(versions) => match snapshot_id {
                None => !versions.is_empty(),
                Some(id) => versions.iter().any(|v| v.snapshot.snapshot_id == id),
            },
        })
    }

    async fn head(&self, key: &str, snapshot_id: Option<&str>) -> Result<Option<ObjSnapshot>> {
        let keys = self.keys.lock();
        let versions = match keys.get(key) {
            None => return Ok(None),
            Some(v) => v,
        };
        Ok(match snapshot_id {
            None => versions.first().map(|v| v.snapshot.clone()),
            Some(id) => versions
                .iter()
                .find(|v| v.snapshot.snapshot_id == id)
                .map(|v| v.snapshot.clone()),
        })
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        metadata: Option<SnapshotMetadata>,
    ) -> Result<String> {
        if self
            .fail_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Transient(format!("injected upload failure for {key}")));
        }
        let bytes = Bytes::from(std::fs::read(source)?);
        let snapshot_id = self.mint_id(&bytes);
        let version = Version {
            snapshot: ObjSnapshot {
                snapshot_id: snapshot_id.clone(),
                last_modified: Utc::now(),
                metadata: metadata.unwrap_or_default(),
            },
            bytes,
        };
        self.keys.lock().entry(key.to_string()).or_default().insert(0, version);
        Ok(snapshot_id)
    }

    async fn download(&self, key: &str, dest: &Path, snapshot_id: Option<&str>) -> Result<String> {
        let version = {
            let keys = self.keys.lock();
            let versions = keys
                .get(key)
                .ok_or_else(|| StorageError::ObjectNotFound(key.to_string()))?;
            let found = match snapshot_id {
                None => versions.first(),
                Some(id) => versions.iter().find(|v| v.snapshot.snapshot_id == id),
            };
            found
                .cloned()
                .ok_or_else(|| StorageError::ObjectNotFound(format!("{key}@{}", snapshot_id.unwrap_or("latest"))))?
        };
        std::fs::write(dest, &version.bytes)?;
        Ok(version.snapshot.snapshot_id)
    }

    async fn versions(&self, key: &str) -> Result<Vec<ObjSnapshot>> {
        let keys = self.keys.lock();
        Ok(keys
            .get(key)
            .map(|versions| versions.iter().map(|v| v.snapshot.clone()).collect())
            .unwrap_or_default())
    }

    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> Result<()> {
        let mut keys = self.keys.lock();
        match snapshot_ids {
            None => {
                keys.remove(key);
            }
            Some(ids) => {
                if let Some(versions) = keys.get_mut(key) {
                    versions.retain(|v| !ids.contains(&v.snapshot.snapshot_id));
                }
            }
        }
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        format!("memory://{key}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn upload_download_round_trip() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = MemoryStorage::new();

        let src = write_file(&tmp, "in", b"workbook bytes");
        let id = store.upload("k", &src, None).await?;
        assert!(store.exists("k", None).await?);
        assert!(store.exists("k", Some(&id)).await?);

        let dest = tmp.path().join("out");
        let served = store.download("k", &dest, None).await?;
        assert_eq!(served, id);
        assert_eq!(std::fs::read(&dest)?, b"workbook bytes");
        Ok(())
    }

    #[tokio::test]
    async fn versions_are_newest_first_and_removable() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = MemoryStorage::new();

        let a = write_file(&tmp, "a", b"one");
        let b = write_file(&tmp, "b", b"two");
        let id_a = store.upload("k", &a, None).await?;
        let id_b = store.upload("k", &b, None).await?;

        let versions = store.versions("k").await?;
        assert_eq!(
            versions.iter().map(|v| v.snapshot_id.as_str()).collect::<Vec<_>>(),
            vec![id_b.as_str(), id_a.as_str()]
        );

        store.remove("k", Some(&[id_b.clone()])).await?;
        let head = store.head("k", None).await?.unwrap();
        assert_eq!(head.snapshot_id, id_a);

        store.remove("k", None).await?;
        assert!(!store.exists("k", None).await?);
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures_are_transient() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let store = MemoryStorage::new();
        let src = write_file(&tmp, "in", b"x");

        store.inject_upload_failures(1);
        let err = store.upload("k", &src, None).await.unwrap_err();
        assert!(!store.is_fatal(&err));
        store.upload("k", &src, None).await?;
        Ok(())
    }
}
