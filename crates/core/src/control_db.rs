//! The shared coordination registry.
//!
//! Workers agree on two things through this registry: which worker owns each
//! document, and what the current content token of each document is. Both
//! live as named trees of one durable, low-latency embedded store.
//!
//! The checksum tree is the consistency oracle between the local filesystem
//! and the external blob store; it is not a lock. The worker map is the only
//! mutual-exclusion primitive for write access to a document.

use std::path::Path;

use serde::{Deserialize, Serialize};

pub type Result<T> = core::result::Result<T, Error>;

/// Canonical token of a freshly created document with no pushed content.
pub const CHECKSUM_FRESH: &str = "null";

/// Tombstone written at deletion time, so stale local copies cannot
/// resurrect a deleted document.
pub const CHECKSUM_DELETED: &str = "DELETED";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("registry error: {0}")]
    Db(#[from] sled::Error),
    #[error("worker {0} is not registered")]
    WorkerNotFound(String),
    #[error("no available worker for document {0}")]
    NoWorkerAvailable(String),
    #[error("malformed registry value: {0}")]
    BadValue(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub struct ControlDb {
    db: sled::Db,
}

impl ControlDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let config = sled::Config::default()
            .path(path.as_ref())
            .flush_every_ms(Some(50))
            .mode(sled::Mode::HighThroughput);
        let db = config.open()?;
        Ok(Self { db })
    }

    pub fn checksums(&self) -> Result<ChecksumRegistry> {
        Ok(ChecksumRegistry {
            tree: self.db.open_tree("checksum")?,
        })
    }

    pub fn workers(&self) -> Result<WorkerMap> {
        Ok(WorkerMap {
            workers: self.db.open_tree("worker")?,
            assignments: self.db.open_tree("doc_worker")?,
        })
    }
}

/// The shared `doc-<docId>-checksum` → token map.
#[derive(Clone)]
pub struct ChecksumRegistry {
    tree: sled::Tree,
}

impl ChecksumRegistry {
    fn key(doc_id: &str) -> String {
        format!("doc-{doc_id}-checksum")
    }

    pub fn get(&self, doc_id: &str) -> Result<Option<String>> {
        match self.tree.get(Self::key(doc_id))? {
            Some(value) => Ok(Some(String::from_utf8(value.to_vec())?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, doc_id: &str, token: &str) -> Result<()> {
        self.tree.insert(Self::key(doc_id), token.as_bytes())?;
        Ok(())
    }

    /// Write the deletion tombstone. The key itself is kept; removing it
    /// would let a stale local copy pass the trust-local rule.
    pub fn mark_deleted(&self, doc_id: &str) -> Result<()> {
        self.set(doc_id, CHECKSUM_DELETED)
    }

    pub fn is_deleted(&self, doc_id: &str) -> Result<bool> {
        Ok(self.get(doc_id)?.as_deref() == Some(CHECKSUM_DELETED))
    }

    /// Drop the key entirely. Only for operator cleanup, long after
    /// deletion; normal operation writes the tombstone instead.
    pub fn remove(&self, doc_id: &str) -> Result<()> {
        self.tree.remove(Self::key(doc_id))?;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub public_url: String,
    pub internal_url: String,
    pub available: bool,
}

/// Maps each document to at most one worker.
#[derive(Clone)]
pub struct WorkerMap {
    workers: sled::Tree,
    assignments: sled::Tree,
}

impl WorkerMap {
    pub fn add_worker(&self, worker_id: &str, info: WorkerInfo) -> Result<()> {
        self.workers.insert(worker_id, serde_json::to_vec(&info)?)?;
        Ok(())
    }

    /// Deregister a worker and release every document assigned to it.
    pub fn remove_worker(&self, worker_id: &str) -> Result<()> {
        self.workers.remove(worker_id)?;
        for entry in self.assignments.iter() {
            let (doc, assigned) = entry?;
            if assigned.as_ref() == worker_id.as_bytes() {
                self.assignments.remove(doc)?;
            }
        }
        Ok(())
    }

    pub fn set_worker_availability(&self, worker_id: &str, available: bool) -> Result<()> {
        let mut info = self.get_worker(worker_id)?.ok_or_else(|| Error::WorkerNotFound(worker_id.into()))?;
        info.available = available;
        self.workers.insert(worker_id, serde_json::to_vec(&info)?)?;
        Ok(())
    }

    pub fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerInfo>> {
        match self.workers.get(worker_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_doc_worker(&self, doc_id: &str) -> Result<Option<String>> {
        match self.assignments.get(doc_id)? {
            Some(value) => Ok(Some(String::from_utf8(value.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Assign the document to some available worker, idempotently.
    ///
    /// Racing calls from multiple workers resolve to one and only one
    /// assignment: the compare-and-swap loser adopts the winner's choice.
    pub fn assign_doc_worker(&self, doc_id: &str) -> Result<String> {
        if let Some(existing) = self.get_doc_worker(doc_id)? {
            return Ok(existing);
        }
        let candidate = self
            .first_available_worker()?
            .ok_or_else(|| Error::NoWorkerAvailable(doc_id.into()))?;
        match self
            .assignments
            .compare_and_swap(doc_id, None as Option<&[u8]>, Some(candidate.as_bytes()))?
        {
            Ok(()) => Ok(candidate),
            Err(race) => {
                let winner = race.current.expect("lost CAS against a removal");
                Ok(String::from_utf8(winner.to_vec())?)
            }
        }
    }

    /// Release the document's lease, if any.
    pub fn unassign_doc(&self, doc_id: &str) -> Result<()> {
        self.assignments.remove(doc_id)?;
        Ok(())
    }

    fn first_available_worker(&self) -> Result<Option<String>> {
        for entry in self.workers.iter() {
            let (id, value) = entry?;
            let info: WorkerInfo = serde_json::from_slice(&value)?;
            if info.available {
                return Ok(Some(String::from_utf8(id.to_vec())?));
            }
        }
        Ok(None)
    }
}
