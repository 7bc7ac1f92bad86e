//! The per-document SQLite facade.
//!
//! A [`Document`] owns one connection to a `.grist` file. SQL runs on the
//! blocking pool; the connection is never held across an await point. The
//! internal tables the storage layer cares about are `_grist_DocInfo`
//! (schema version, timezone, head action hash), `_gristsys_Files` (the
//! attachment blob store) and `_grist_Attachments` (the rows referencing
//! those blobs).

use std::path::Path;
use std::sync::Arc;

use gridhost_paths::DocFilePath;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};

use crate::error::Result;
use crate::migrate::SCHEMA_VERSION;
use crate::util::asyncify;

pub struct Document {
    doc_id: String,
    path: DocFilePath,
    conn: Arc<Mutex<Connection>>,
    read_only: bool,
}

impl Document {
    /// Create a fresh, empty document at `path` with the current schema.
    pub(crate) fn create_new(doc_id: impl Into<String>, path: DocFilePath) -> Result<Self> {
        let conn = Connection::open(&path.0)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "BEGIN;
             CREATE TABLE _grist_DocInfo (
                 id INTEGER PRIMARY KEY,
                 schemaVersion INTEGER NOT NULL,
                 timezone TEXT NOT NULL DEFAULT 'UTC',
                 actionHash TEXT NOT NULL DEFAULT ''
             );
             CREATE TABLE _gristsys_Files (
                 id INTEGER PRIMARY KEY,
                 ident TEXT UNIQUE NOT NULL,
                 data BLOB
             );
             CREATE TABLE _grist_Attachments (
                 id INTEGER PRIMARY KEY,
                 fileIdent TEXT NOT NULL
             );
             COMMIT;",
        )?;
        conn.execute(
            "INSERT INTO _grist_DocInfo (id, schemaVersion, timezone, actionHash) VALUES (1, ?1, 'UTC', '')",
            [SCHEMA_VERSION],
        )?;
        Ok(Self {
            doc_id: doc_id.into(),
            path,
            conn: Arc::new(Mutex::new(conn)),
            read_only: false,
        })
    }

    /// Open an existing document file.
    pub(crate) fn open(doc_id: impl Into<String>, path: DocFilePath, read_only: bool) -> Result<Self> {
        let conn = if read_only {
            Connection::open_with_flags(&path.0, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            Connection::open(&path.0)?
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            doc_id: doc_id.into(),
            path,
            conn: Arc::new(Mutex::new(conn)),
            read_only,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn path(&self) -> &DocFilePath {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn with_conn<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        asyncify(move || {
            let mut guard = conn.lock();
            f(&mut *guard)
        })
        .await
    }

    /// Execute one SQL statement. Every statement executed through the
    /// handle is an action: the head action hash advances over it.
    pub async fn execute(&self, sql: String) -> Result<usize> {
        self.with_conn(move |conn| {
            let n = conn.execute(&sql, [])?;
            advance_action_hash(conn, &sql)?;
            Ok(n)
        })
        .await
    }

    /// The first row of a query, as owned values. `None` on an empty result.
    pub async fn query_row(&self, sql: String) -> Result<Option<Vec<Value>>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let ncols = stmt.column_count();
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => {
                    let mut out = Vec::with_capacity(ncols);
                    for i in 0..ncols {
                        out.push(row.get::<_, Value>(i)?);
                    }
                    Ok(Some(out))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// Single text cell convenience for the common lookup shape.
    pub async fn query_text(&self, sql: String) -> Result<Option<String>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn timezone(&self) -> Result<String> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT timezone FROM _grist_DocInfo WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
    }

    pub async fn action_hash(&self) -> Result<String> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT actionHash FROM _grist_DocInfo WHERE id = 1", [], |r| r.get(0))?)
        })
        .await
    }

    pub async fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT schemaVersion FROM _grist_DocInfo WHERE id = 1", [], |r| {
                r.get(0)
            })?)
        })
        .await
    }

    /// Store an attachment blob. The caller owns creating the
    /// `_grist_Attachments` row that references it.
    pub(crate) async fn put_attachment(&self, ident: String, data: Vec<u8>) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO _gristsys_Files (ident, data) VALUES (?1, ?2)",
                rusqlite::params![ident, data],
            )?;
            Ok(())
        })
        .await
    }

    /// Drop attachment blobs no row references any more. Runs on close so
    /// unreferenced uploads do not bloat the file forever.
    pub(crate) async fn sweep_orphans(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM _gristsys_Files
                 WHERE ident NOT IN (SELECT fileIdent FROM _grist_Attachments)",
                [],
            )?;
            Ok(n)
        })
        .await
    }
}

fn advance_action_hash(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let prev: String = conn.query_row("SELECT actionHash FROM _grist_DocInfo WHERE id = 1", [], |r| r.get(0))?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev.as_bytes());
    hasher.update(sql.as_bytes());
    let next = hasher.finalize().to_hex().to_string();
    conn.execute("UPDATE _grist_DocInfo SET actionHash = ?1 WHERE id = 1", [next])?;
    Ok(())
}

/// Read `(timezone, actionHash)` straight from a file, without a
/// [`Document`]. Files predating the current schema yield defaults.
pub(crate) fn read_doc_meta(path: &Path) -> Result<(String, String)> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let res = conn.query_row(
        "SELECT timezone, actionHash FROM _grist_DocInfo WHERE id = 1",
        [],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    );
    match res {
        Ok(meta) => Ok(meta),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(("UTC".into(), String::new())),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such") => {
            Ok(("UTC".into(), String::new()))
        }
        Err(e) => Err(e.into()),
    }
}
