//! A read-caching [`ExternalStorage`] wrapper.
//!
//! Listings and heads are served from a per-key cache for a fixed TTL, so
//! `exists`/`head`/`versions` and latest-version downloads can be stale with
//! respect to recent uploads and removals. This matches the consistency of
//! real object-store frontends and doubles as the deliberately-stale test
//! double for the verification layers above.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, StorageError};
use crate::storage::{ExternalStorage, ObjSnapshot, SnapshotMetadata};

pub struct CachedStorage {
    inner: Arc<dyn ExternalStorage>,
    ttl: Duration,
    listings: Mutex<HashMap<String, (Instant, Vec<ObjSnapshot>)>>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn ExternalStorage>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            listings: Mutex::new(HashMap::new()),
        }
    }

    async fn listing(&self, key: &str) -> Result<Vec<ObjSnapshot>> {
        if let Some((at, cached)) = self.listings.lock().get(key) {
            if at.elapsed() < self.ttl {
                return Ok(cached.clone());
            }
        }
        let fresh = self.inner.versions(key).await?;
        self.listings
            .lock()
            .insert(key.to_string(), (Instant::now(), fresh.clone()));
        Ok(fresh)
    }
}

#[async_trait]
impl ExternalStorage for CachedStorage {
    async fn exists(&self, key: &str, snapshot_id: Option<&str>) -> Result<bool> {
        let listing = self.listing(key).await?;
        Ok(match snapshot_id {
            None => !listing.is_empty(),
            Some(id) => listing.iter().any(|v| v.snapshot_id == id),
        })
    }

    async fn head(&self, key: &str, snapshot_id: Option<&str>) -> Result<Option<ObjSnapshot>> {
        let listing = self.listing(key).await?;
        Ok(match snapshot_id {
            None => listing.first().cloned(),
            Some(id) => listing.into_iter().find(|v| v.snapshot_id == id),
        })
    }

    async fn upload(
        &self,
        key: &str,
        source: &Path,
        metadata: Option<SnapshotMetadata>,
    ) -> Result<String> {
        // Deliberately does not invalidate: readers see the old listing
        // until the TTL lapses.
        self.inner.upload(key, source, metadata).await
    }

    async fn download(&self, key: &str, dest: &Path, snapshot_id: Option<&str>) -> Result<String> {
        match snapshot_id {
            Some(id) => self.inner.download(key, dest, Some(id)).await,
            None => {
                // Resolve "latest" through the (possibly stale) listing.
                let head = self
                    .listing(key)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| StorageError::ObjectNotFound(key.to_string()))?;
                self.inner.download(key, dest, Some(&head.snapshot_id)).await
            }
        }
    }

    async fn versions(&self, key: &str) -> Result<Vec<ObjSnapshot>> {
        self.listing(key).await
    }

    async fn remove(&self, key: &str, snapshot_ids: Option<&[String]>) -> Result<()> {
        self.inner.remove(key, snapshot_ids).await
    }

    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }

    fn is_fatal(&self, err: &StorageError) -> bool {
        self.inner.is_fatal(err)
    }
}
