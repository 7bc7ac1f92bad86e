//! The worker-private store of `.grist` files.
//!
//! One directory per worker holds a SQLite file and a small hash-marker file
//! per document. The marker carries the token of the last pushed content, so
//! opening a document does not require hashing the whole database. All
//! replacement goes through a staging file and an atomic rename.

use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as _;
use gridhost_paths::{DocFilePath, DocsDir, TrashDir};
use log::warn;

use crate::error::{Result, StorageError};

/// Exclusive lock on the doc root, held for the lifetime of the store.
/// A second process opening the same root fails fast instead of racing
/// file replacements.
#[derive(Clone)]
pub struct LockFile {
    path: Arc<Path>,
    #[allow(unused)]
    lock: Arc<File>,
}

impl LockFile {
    pub fn lock(root: &DocsDir) -> Result<Self> {
        root.create()?;
        let path = root.lock_file();
        let lock = File::create(&path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::RootLocked(root.0.clone()))?;

        Ok(Self {
            path: path.into(),
            lock: lock.into(),
        })
    }
}

impl fmt::Debug for LockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFile").field("path", &self.path).finish()
    }
}

pub struct LocalStore {
    dir: DocsDir,
    trash: TrashDir,
    _lock: LockFile,
}

impl LocalStore {
    pub fn open(dir: DocsDir) -> Result<Self> {
        let lock = LockFile::lock(&dir)?;
        let trash = dir.trash();
        trash.create()?;
        Ok(Self {
            dir,
            trash,
            _lock: lock,
        })
    }

    pub fn path_for(&self, doc_id: &str) -> DocFilePath {
        self.dir.doc_file(doc_id)
    }

    pub fn exists(&self, doc_id: &str) -> bool {
        self.path_for(doc_id).0.exists()
    }

    pub fn read_hash_marker(&self, doc_id: &str) -> Result<Option<String>> {
        let marker = self.path_for(doc_id).hash_marker();
        match fs::read_to_string(&marker.0) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_hash_marker(&self, doc_id: &str, token: &str) -> Result<()> {
        fs::write(self.path_for(doc_id).hash_marker().0, token)?;
        Ok(())
    }

    /// The document's local token: the marker if present, a fresh hash of
    /// the file otherwise. `None` when there is no local copy.
    pub fn local_token(&self, doc_id: &str) -> Result<Option<String>> {
        if !self.exists(doc_id) {
            return Ok(None);
        }
        match self.read_hash_marker(doc_id)? {
            Some(token) => Ok(Some(token)),
            None => Ok(Some(compute_token(&self.path_for(doc_id).0)?)),
        }
    }

    /// Install `source` as the document's content: stage, fsync, rename.
    pub fn atomic_replace(&self, doc_id: &str, source: &Path) -> Result<()> {
        let target = self.path_for(doc_id);
        let staging = target.temp_file();
        fs::copy(source, &staging)?;
        File::open(&staging)?.sync_all()?;
        fs::rename(&staging, &target.0)?;
        Ok(())
    }

    /// Drop a stale marker without touching the document file.
    pub fn clear_hash_marker(&self, doc_id: &str) -> Result<()> {
        remove_if_present(&self.path_for(doc_id).hash_marker().0)
    }

    /// Remove the document file and its marker. Absent files are fine.
    pub fn remove(&self, doc_id: &str) -> Result<()> {
        let path = self.path_for(doc_id);
        remove_if_present(&path.0)?;
        remove_if_present(&path.hash_marker().0)?;
        Ok(())
    }

    /// Move an untrusted local copy into `trash/` instead of deleting it.
    /// Returns the new location, or `None` if there was nothing to move.
    pub fn move_aside(&self, doc_id: &str) -> Result<Option<PathBuf>> {
        let path = self.path_for(doc_id);
        if !path.0.exists() {
            return Ok(None);
        }
        let stamp = chrono::Utc::now().timestamp_millis();
        let dest = self.trash.0.join(format!("{doc_id}.grist.{stamp}"));
        fs::rename(&path.0, &dest)?;
        remove_if_present(&path.hash_marker().0)?;
        Ok(Some(dest))
    }

    /// Drop staging and backup leftovers from earlier crashes.
    pub fn cleanup_strays(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir.0)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".grist-backup") || name.ends_with(".grist-tmp") {
                warn!("removing stray file from a previous run: {name}");
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!("could not remove stray {name}: {e}");
                } else {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// The ids of all locally present documents.
    pub fn list_docs(&self) -> Result<Vec<String>> {
        let mut docs = Vec::new();
        for entry in fs::read_dir(&self.dir.0)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(doc_id) = name.strip_suffix(".grist") {
                docs.push(doc_id.to_string());
            }
        }
        docs.sort();
        Ok(docs)
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The content token of a file: a hex blake3 digest of its bytes.
pub fn compute_token(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use gridhost_paths::{DataDir, FromPathUnchecked};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (LocalStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let docs = DataDir::from_path_unchecked(tmp.path()).docs();
        let store = LocalStore::open(docs).unwrap();
        (store, tmp)
    }

    #[test]
    fn atomic_replace_and_tokens() -> Result<()> {
        let (store, tmp) = setup();
        let source = tmp.path().join("incoming");
        fs::write(&source, b"content-a")?;

        store.atomic_replace("d1", &source)?;
        assert!(store.exists("d1"));

        // No marker yet: the token comes from hashing the file.
        let token = store.local_token("d1")?.unwrap();
        assert_eq!(token, compute_token(&store.path_for("d1").0)?);

        // With a marker, the marker wins.
        store.write_hash_marker("d1", "pinned")?;
        assert_eq!(store.local_token("d1")?.as_deref(), Some("pinned"));

        store.remove("d1")?;
        assert!(!store.exists("d1"));
        assert_eq!(store.local_token("d1")?, None);
        Ok(())
    }

    #[test]
    fn move_aside_preserves_bytes() -> Result<()> {
        let (store, tmp) = setup();
        let source = tmp.path().join("incoming");
        fs::write(&source, b"precious")?;
        store.atomic_replace("d1", &source)?;
        store.write_hash_marker("d1", "t")?;

        let dest = store.move_aside("d1")?.unwrap();
        assert!(!store.exists("d1"));
        assert_eq!(store.read_hash_marker("d1")?, None);
        assert_eq!(fs::read(dest)?, b"precious");

        assert_eq!(store.move_aside("d1")?, None);
        Ok(())
    }

    #[test]
    fn stray_cleanup_leaves_documents_alone() -> Result<()> {
        let (store, _tmp) = setup();
        let source = store.path_for("keep").0.clone();
        fs::write(&source, b"db")?;
        fs::write(store.path_for("gone").backup_file(), b"partial")?;
        fs::write(store.path_for("gone").temp_file(), b"partial")?;

        assert_eq!(store.cleanup_strays()?, 2);
        assert_eq!(store.list_docs()?, vec!["keep".to_string()]);
        Ok(())
    }

    #[test]
    fn second_lock_fails_fast() {
        let (store, tmp) = setup();
        let docs = DataDir::from_path_unchecked(tmp.path()).docs();
        assert!(matches!(
            LocalStore::open(docs),
            Err(StorageError::RootLocked(_))
        ));
        drop(store);
    }
}
