//! On-open schema migration.
//!
//! Every document records its schema version in `_grist_DocInfo`. Opening a
//! document older than [`SCHEMA_VERSION`] runs the missing steps inside one
//! transaction; opening a current document performs no mutation at all, so
//! a view-only open never produces a snapshot. Documents from a newer build
//! are refused rather than guessed at.

use log::info;
use rusqlite::Connection;

use crate::error::{Result, StorageError};

/// The schema version this build writes and expects.
pub const SCHEMA_VERSION: i64 = 3;

/// History of the internal tables:
/// v1 — `_grist_DocInfo` (id, schemaVersion, timezone) and `_gristsys_Files`.
/// v2 — `_grist_DocInfo.actionHash`.
/// v3 — `_grist_Attachments`, making the orphan sweep possible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from: i64,
    pub to: i64,
}

impl MigrationOutcome {
    /// The label stamped on the snapshot pushed right after a migration.
    pub fn snapshot_label(&self) -> String {
        format!("migrate-schema-v{}-to-v{}", self.from, self.to)
    }
}

/// Bring the document up to [`SCHEMA_VERSION`]. Returns `None` when the
/// document was already current.
pub fn migrate_to_current(conn: &mut Connection, doc_id: &str) -> Result<Option<MigrationOutcome>> {
    let found = schema_version_of(conn)?;
    if found == SCHEMA_VERSION {
        return Ok(None);
    }
    if found > SCHEMA_VERSION {
        return Err(StorageError::MigrationRequired {
            doc_id: doc_id.to_string(),
            found,
            current: SCHEMA_VERSION,
        });
    }

    let tx = conn.transaction()?;
    for version in found..SCHEMA_VERSION {
        apply_step(&tx, version)?;
    }
    tx.execute(
        "UPDATE _grist_DocInfo SET schemaVersion = ?1 WHERE id = 1",
        [SCHEMA_VERSION],
    )?;
    tx.commit()?;

    let outcome = MigrationOutcome {
        from: found,
        to: SCHEMA_VERSION,
    };
    info!("migrated {doc_id} from schema v{} to v{}", outcome.from, outcome.to);
    Ok(Some(outcome))
}

fn apply_step(tx: &rusqlite::Transaction<'_>, from: i64) -> Result<()> {
    match from {
        1 => {
            tx.execute_batch("ALTER TABLE _grist_DocInfo ADD COLUMN actionHash TEXT NOT NULL DEFAULT ''")?;
        }
        2 => {
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS _grist_Attachments (
                     id INTEGER PRIMARY KEY,
                     fileIdent TEXT NOT NULL
                 )",
            )?;
        }
        other => {
            return Err(StorageError::Other(anyhow::anyhow!(
                "no migration step defined from schema v{other}"
            )));
        }
    }
    Ok(())
}

/// The document's recorded schema version. Files with no `_grist_DocInfo`
/// at all (imports from before the table existed) count as v1 and get the
/// base tables created on the spot.
fn schema_version_of(conn: &mut Connection) -> Result<i64> {
    let has_info: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = '_grist_DocInfo'",
        [],
        |r| r.get(0),
    )?;
    if has_info == 0 {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE _grist_DocInfo (
                 id INTEGER PRIMARY KEY,
                 schemaVersion INTEGER NOT NULL,
                 timezone TEXT NOT NULL DEFAULT 'UTC'
             );
             CREATE TABLE IF NOT EXISTS _gristsys_Files (
                 id INTEGER PRIMARY KEY,
                 ident TEXT UNIQUE NOT NULL,
                 data BLOB
             );",
        )?;
        tx.execute("INSERT INTO _grist_DocInfo (id, schemaVersion) VALUES (1, 1)", [])?;
        tx.commit()?;
        return Ok(1);
    }
    let version = conn.query_row("SELECT schemaVersion FROM _grist_DocInfo WHERE id = 1", [], |r| {
        r.get(0)
    })?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn v1_document(tmp: &TempDir) -> Connection {
        let conn = Connection::open(tmp.path().join("old.grist")).unwrap();
        conn.execute_batch(
            "CREATE TABLE _grist_DocInfo (
                 id INTEGER PRIMARY KEY,
                 schemaVersion INTEGER NOT NULL,
                 timezone TEXT NOT NULL DEFAULT 'UTC'
             );
             CREATE TABLE _gristsys_Files (id INTEGER PRIMARY KEY, ident TEXT UNIQUE NOT NULL, data BLOB);
             INSERT INTO _grist_DocInfo (id, schemaVersion) VALUES (1, 1);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn migrates_v1_to_current() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut conn = v1_document(&tmp);

        let outcome = migrate_to_current(&mut conn, "old")?.unwrap();
        assert_eq!(outcome, MigrationOutcome { from: 1, to: SCHEMA_VERSION });
        assert_eq!(outcome.snapshot_label(), "migrate-schema-v1-to-v3");

        // The new columns and tables are usable.
        conn.execute("UPDATE _grist_DocInfo SET actionHash = 'h' WHERE id = 1", [])?;
        conn.execute("INSERT INTO _grist_Attachments (fileIdent) VALUES ('f')", [])?;
        Ok(())
    }

    #[test]
    fn migration_is_idempotent() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut conn = v1_document(&tmp);

        assert!(migrate_to_current(&mut conn, "old")?.is_some());
        assert_eq!(migrate_to_current(&mut conn, "old")?, None);
        Ok(())
    }

    #[test]
    fn refuses_documents_from_the_future() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut conn = v1_document(&tmp);
        conn.execute("UPDATE _grist_DocInfo SET schemaVersion = ?1 WHERE id = 1", [SCHEMA_VERSION + 1])?;

        let err = migrate_to_current(&mut conn, "new").unwrap_err();
        assert!(matches!(err, StorageError::MigrationRequired { .. }));
        Ok(())
    }

    #[test]
    fn bare_files_bootstrap_as_v1() -> Result<()> {
        let tmp = TempDir::new()?;
        let mut conn = Connection::open(tmp.path().join("bare.grist"))?;
        conn.execute_batch("CREATE TABLE UserData (x)")?;

        let outcome = migrate_to_current(&mut conn, "bare")?.unwrap();
        assert_eq!(outcome.from, 1);
        let v: i64 = conn.query_row("SELECT schemaVersion FROM _grist_DocInfo WHERE id = 1", [], |r| r.get(0))?;
        assert_eq!(v, SCHEMA_VERSION);
        Ok(())
    }
}
