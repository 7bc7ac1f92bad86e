//! The on-disk layout of a gridhost worker, represented as a type hierarchy.
//!
//! Rather than passing raw [`PathBuf`]s around, each directory and file the
//! worker touches has its own newtype. Constructing one from an arbitrary
//! path is possible, but requires going through [`FromPathUnchecked`], which
//! makes the unchecked-ness explicit at the call site.

use std::io;
use std::path::{Path, PathBuf};

/// Construct a typed path from an arbitrary [`PathBuf`], without checking
/// that the path actually exists or has the expected shape.
pub trait FromPathUnchecked {
    fn from_path_unchecked(path: impl Into<PathBuf>) -> Self;
}

macro_rules! path_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(pub PathBuf);

        impl FromPathUnchecked for $name {
            fn from_path_unchecked(path: impl Into<PathBuf>) -> Self {
                Self(path.into())
            }
        }

        impl AsRef<Path> for $name {
            fn as_ref(&self) -> &Path {
                &self.0
            }
        }

        impl $name {
            pub fn display(&self) -> std::path::Display<'_> {
                self.0.display()
            }
        }
    };
}

path_type! {
    /// The root data directory of one worker process.
    DataDir
}

impl DataDir {
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.0)
    }

    /// Where this worker keeps its local copies of documents.
    pub fn docs(&self) -> DocsDir {
        DocsDir(self.0.join("docs"))
    }

    /// The embedded coordination registry (checksums, worker assignments).
    pub fn control_db(&self) -> PathBuf {
        self.0.join("control-db")
    }
}

path_type! {
    /// The directory holding `<docId>.grist` files and their hash markers.
    DocsDir
}

impl DocsDir {
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.0)
    }

    pub fn doc_file(&self, doc_id: &str) -> DocFilePath {
        DocFilePath(self.0.join(format!("{doc_id}.grist")))
    }

    /// Untrusted local copies are moved here instead of being deleted.
    pub fn trash(&self) -> TrashDir {
        TrashDir(self.0.join("trash"))
    }

    /// The exclusive lock taken by the owning worker process.
    pub fn lock_file(&self) -> PathBuf {
        self.0.join("docs.lock")
    }
}

path_type! {
    /// Holds local copies that were moved aside because their hash marker
    /// disagreed with the checksum registry.
    TrashDir
}

impl TrashDir {
    pub fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.0)
    }
}

path_type! {
    /// A single document's SQLite file, `<docs>/<docId>.grist`.
    DocFilePath
}

impl DocFilePath {
    /// The sibling marker file holding the last pushed content token,
    /// `<docId>.grist-hash-doc`. Avoids hashing the whole database on open.
    pub fn hash_marker(&self) -> HashMarkerPath {
        HashMarkerPath(sibling(&self.0, "-hash-doc"))
    }

    /// The scratch file LiveBackup writes into, `<docId>.grist-backup`.
    /// Leftovers of this shape are swept on worker start.
    pub fn backup_file(&self) -> PathBuf {
        sibling(&self.0, "-backup")
    }

    /// The staging file used for atomic replacement, `<docId>.grist-tmp`.
    pub fn temp_file(&self) -> PathBuf {
        sibling(&self.0, "-tmp")
    }
}

path_type! {
    /// The `<docId>.grist-hash-doc` token marker.
    HashMarkerPath
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().expect("doc file path has a name").to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_file_naming() {
        let docs = DataDir::from_path_unchecked("/srv/gridhost").docs();
        let doc = docs.doc_file("abc123");
        assert_eq!(doc.0, PathBuf::from("/srv/gridhost/docs/abc123.grist"));
        assert_eq!(
            doc.hash_marker().0,
            PathBuf::from("/srv/gridhost/docs/abc123.grist-hash-doc")
        );
        assert_eq!(doc.backup_file(), PathBuf::from("/srv/gridhost/docs/abc123.grist-backup"));
    }

    #[test]
    fn fork_ids_are_valid_file_names() {
        let docs = DataDir::from_path_unchecked("/data").docs();
        let doc = docs.doc_file("trunk~fork1");
        assert_eq!(doc.0, PathBuf::from("/data/docs/trunk~fork1.grist"));
    }
}
