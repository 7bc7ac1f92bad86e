//! The document id grammar.
//!
//! A plain `docId` names a trunk document. `<docId>~<suffix>` names a fork
//! whose trunk is `docId`. `<id>~v=<snapshotId>` names an immutable snapshot
//! of `<id>` (which may itself be a fork). The parser is total: every string
//! maps to exactly one shape.

/// A parsed document identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocName {
    /// A trunk document.
    Trunk { doc_id: String },
    /// A fork; `fork_id` is the full id including the trunk prefix.
    Fork { trunk: String, fork_id: String },
    /// An immutable snapshot reference of a trunk or fork.
    Snapshot { doc_id: String, snapshot_id: String },
}

impl DocName {
    pub fn parse(id: &str) -> DocName {
        if let Some((base, snap)) = id.rsplit_once("~v=") {
            return DocName::Snapshot {
                doc_id: base.to_string(),
                snapshot_id: snap.to_string(),
            };
        }
        if let Some((trunk, _suffix)) = id.split_once('~') {
            return DocName::Fork {
                trunk: trunk.to_string(),
                fork_id: id.to_string(),
            };
        }
        DocName::Trunk { doc_id: id.to_string() }
    }

    /// The id that owns local files and storage keys: the full fork id for
    /// forks, the underlying document for snapshot references.
    pub fn storage_id(&self) -> &str {
        match self {
            DocName::Trunk { doc_id } => doc_id,
            DocName::Fork { fork_id, .. } => fork_id,
            DocName::Snapshot { doc_id, .. } => doc_id,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, DocName::Snapshot { .. })
    }
}

/// The trunk prefix of any id shape: everything up to the first `~`.
pub fn trunk_id(id: &str) -> &str {
    id.split('~').next().unwrap_or(id)
}
