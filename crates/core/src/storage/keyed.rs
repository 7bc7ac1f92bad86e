//! Maps logical document ids to opaque storage keys.
//!
//! Every document id maps to exactly one key per purpose, laid out as
//! `<prefix>/<purpose>/<docId>`. The mapping is injective per purpose since
//! document ids never contain `/`. Layers above always go through this
//! wrapper, never the raw store; it also enforces the per-operation
//! deadline, so a wedged store surfaces as a retryable failure instead of a
//! hung worker.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, StorageError};
use crate::storage::{ExternalStorage, ObjSnapshot, SnapshotMetadata};

/// What a key holds: the document's SQLite bytes, or ancillary state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    Doc,
    Meta,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Doc => "doc",
            Purpose::Meta => "meta",
        }
    }
}

#[derive(Clone)]
pub struct KeyedStorage {
    storage: Arc<dyn ExternalStorage>,
    prefix: String,
    purpose: Purpose,
    op_timeout: Duration,
}

impl KeyedStorage {
    pub fn new(storage: Arc<dyn ExternalStorage>, prefix: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            purpose,
            op_timeout: Duration::from_secs(60),
        }
    }

    /// Cap every storage operation at `timeout`; elapsing counts as a
    /// transient failure.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn key_for(&self, doc_id: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.purpose.as_str(), doc_id)
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Transient(format!(
                "storage {op} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    pub async fn exists(&self, doc_id: &str, snapshot_id: Option<&str>) -> Result<bool> {
        self.bounded("exists", self.storage.exists(&self.key_for(doc_id), snapshot_id))
            .await
    }

    pub async fn head(&self, doc_id: &str, snapshot_id: Option<&str>) -> Result<Option<ObjSnapshot>> {
        self.bounded("head", self.storage.head(&self.key_for(doc_id), snapshot_id))
            .await
    }

    pub async fn upload(
        &self,
        doc_id: &str,
        source: &Path,
        metadata: Option<SnapshotMetadata>,
    ) -> Result<String> {
        self.bounded("upload", self.storage.upload(&self.key_for(doc_id), source, metadata))
            .await
    }

    pub async fn download(&self, doc_id: &str, dest: &Path, snapshot_id: Option<&str>) -> Result<String> {
        self.bounded(
            "download",
            self.storage.download(&self.key_for(doc_id), dest, snapshot_id),
        )
        .await
    }

    pub async fn versions(&self, doc_id: &str) -> Result<Vec<ObjSnapshot>> {
        self.bounded("versions", self.storage.versions(&self.key_for(doc_id)))
            .await
    }

    pub async fn remove(&self, doc_id: &str, snapshot_ids: Option<&[String]>) -> Result<()> {
        self.bounded("remove", self.storage.remove(&self.key_for(doc_id), snapshot_ids))
            .await
    }

    pub fn url(&self, doc_id: &str) -> String {
        self.storage.url(&self.key_for(doc_id))
    }

    pub fn is_fatal(&self, err: &StorageError) -> bool {
        self.storage.is_fatal(err)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn key_layout_is_prefix_purpose_doc() {
        let store = Arc::new(MemoryStorage::new());
        let docs = KeyedStorage::new(store.clone(), "grist", Purpose::Doc);
        let meta = KeyedStorage::new(store, "grist", Purpose::Meta);
        assert_eq!(docs.key_for("d1"), "grist/doc/d1");
        assert_eq!(meta.key_for("d1"), "grist/meta/d1");
        assert_eq!(docs.key_for("d1~fork1"), "grist/doc/d1~fork1");
    }

    /// A store that never answers.
    struct BlackHole;

    #[async_trait]
    impl ExternalStorage for BlackHole {
        async fn exists(&self, _: &str, _: Option<&str>) -> Result<bool> {
            futures::future::pending().await
        }
        async fn head(&self, _: &str, _: Option<&str>) -> Result<Option<ObjSnapshot>> {
            futures::future::pending().await
        }
        async fn upload(&self, _: &str, _: &Path, _: Option<SnapshotMetadata>) -> Result<String> {
            futures::future::pending().await
        }
        async fn download(&self, _: &str, _: &Path, _: Option<&str>) -> Result<String> {
            futures::future::pending().await
        }
        async fn versions(&self, _: &str) -> Result<Vec<ObjSnapshot>> {
            futures::future::pending().await
        }
        async fn remove(&self, _: &str, _: Option<&[String]>) -> Result<()> {
            futures::future::pending().await
        }
        fn url(&self, key: &str) -> String {
            format!("blackhole://{key}")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn operations_respect_the_deadline() {
        let keyed = KeyedStorage::new(Arc::new(BlackHole), "grist", Purpose::Doc)
            .with_op_timeout(Duration::from_millis(100));
        let err = keyed.exists("d1", None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
