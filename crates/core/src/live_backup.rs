//! Consistent copies of live SQLite databases.
//!
//! The copy proceeds in bounded page batches under a brief read lock, so
//! concurrent readers and writers on other connections keep making progress
//! between batches. If the source is written mid-copy, SQLite restarts the
//! affected pages; if it is locked, the step is retried up to a bound to
//! rule out livelock. A partial destination file is never left behind.

use std::path::Path;
use std::time::Duration;

use log::debug;
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};

use crate::error::{Result, StorageError};

/// Pages copied per lock hold. Small enough that a step stays well under
/// the responsiveness bound on any plausible hardware.
const PAGES_PER_STEP: std::os::raw::c_int = 64;

/// Pause between steps, the window in which writers proceed.
const STEP_PAUSE: Duration = Duration::from_millis(1);

/// Pause after a busy/locked step before retrying.
const BUSY_PAUSE: Duration = Duration::from_millis(5);

/// Consecutive busy steps tolerated before giving up.
const MAX_BUSY_RETRIES: u32 = 600;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupPhase {
    Before,
    After,
}

/// Emitted around each atomic piece of backup work. The `After` event of a
/// pair fires within a hard bound of its `Before`, which tests use to assert
/// that the source stays responsive throughout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackupEvent {
    pub phase: BackupPhase,
    pub action: &'static str,
}

/// Copy the database at `source` into `dest` while other connections stay
/// open on the source.
///
/// A pre-existing file at `dest` (a leftover of a crashed run, possibly
/// truncated or not SQLite at all) is replaced, not an obstacle. On any
/// error the destination is removed before returning.
pub fn backup_live_db(
    source: &Path,
    dest: &Path,
    mut observe: impl FnMut(BackupEvent),
) -> Result<()> {
    let mut emit = |phase, action| observe(BackupEvent { phase, action });

    emit(BackupPhase::Before, "open");
    if dest.exists() {
        std::fs::remove_file(dest)?;
    }
    let src = Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut dst = Connection::open(dest)?;
    emit(BackupPhase::After, "open");

    // Anything below that bails out must not leave a partial file behind.
    let cleanup = scopeguard::guard(dest.to_path_buf(), |path| {
        let _ = std::fs::remove_file(path);
    });

    {
        let backup = Backup::new(&src, &mut dst)?;
        let mut busy: u32 = 0;
        loop {
            emit(BackupPhase::Before, "step");
            let step = backup.step(PAGES_PER_STEP);
            emit(BackupPhase::After, "step");
            match step? {
                StepResult::Done => break,
                StepResult::More => {
                    busy = 0;
                    std::thread::sleep(STEP_PAUSE);
                }
                StepResult::Busy | StepResult::Locked => {
                    busy += 1;
                    if busy > MAX_BUSY_RETRIES {
                        return Err(StorageError::Transient(format!(
                            "backup of {} starved by a locked source",
                            source.display()
                        )));
                    }
                    std::thread::sleep(BUSY_PAUSE);
                }
                _ => {
                    busy += 1;
                    if busy > MAX_BUSY_RETRIES {
                        return Err(StorageError::Transient(format!(
                            "backup of {} starved by a locked source",
                            source.display()
                        )));
                    }
                    std::thread::sleep(BUSY_PAUSE);
                }
            }
        }
        let progress = backup.progress();
        debug!(
            "backed up {} pages of {}",
            progress.pagecount,
            source.display()
        );
    }

    emit(BackupPhase::Before, "finish");
    drop(src);
    dst.close().map_err(|(_, e)| e)?;
    emit(BackupPhase::After, "finish");

    // Success: the destination stays.
    let _ = scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;

    fn make_db(path: &Path, rows: usize) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, payload TEXT)")
            .unwrap();
        let filler = "x".repeat(512);
        for i in 0..rows {
            conn.execute("INSERT INTO t (id, payload) VALUES (?1, ?2)", (i as i64, &filler))
                .unwrap();
        }
        conn
    }

    fn row_count(path: &Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn copies_a_quiet_database() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let src_path = tmp.path().join("src.grist");
        let dst_path = tmp.path().join("dst.grist");
        let _conn = make_db(&src_path, 100);

        backup_live_db(&src_path, &dst_path, |_| {})?;
        assert_eq!(row_count(&dst_path), 100);
        Ok(())
    }

    #[test]
    fn replaces_a_corrupt_destination() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let src_path = tmp.path().join("src.grist");
        let dst_path = tmp.path().join("dst.grist");
        let _conn = make_db(&src_path, 10);
        std::fs::write(&dst_path, b"definitely not sqlite")?;

        backup_live_db(&src_path, &dst_path, |_| {})?;
        assert_eq!(row_count(&dst_path), 10);
        Ok(())
    }

    #[test]
    fn event_pairs_stay_responsive_under_concurrent_writes() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let src_path = tmp.path().join("src.grist");
        let dst_path = tmp.path().join("dst.grist");
        let conn = make_db(&src_path, 5_000);

        // A connection that holds an exclusive lock for half a second
        // mid-backup.
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let writer = std::thread::spawn(move || {
            started_rx.recv().unwrap();
            conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
            std::thread::sleep(Duration::from_millis(500));
            conn.execute_batch("COMMIT").unwrap();
        });

        let mut last_before: Option<Instant> = None;
        let mut worst = Duration::ZERO;
        let mut signalled = false;
        backup_live_db(&src_path, &dst_path, |event| {
            match event.phase {
                BackupPhase::Before => last_before = Some(Instant::now()),
                BackupPhase::After => {
                    let span = last_before.take().expect("after without before").elapsed();
                    worst = worst.max(span);
                }
            }
            if !signalled {
                signalled = true;
                started_tx.send(()).unwrap();
            }
        })?;
        writer.join().unwrap();

        // Each atomic step stays within the responsiveness bound, and the
        // 500 ms exclusive lock did not prevent completion.
        assert!(worst <= Duration::from_millis(100), "worst step took {worst:?}");
        assert_eq!(row_count(&dst_path), 5_000);
        Ok(())
    }

    #[test]
    fn failed_backups_leave_no_partial_file() {
        let tmp = TempDir::new().unwrap();
        let src_path = tmp.path().join("missing.grist");
        let dst_path = tmp.path().join("dst.grist");

        let err = backup_live_db(&src_path, &dst_path, |_| {}).unwrap_err();
        assert!(matches!(err, StorageError::Sqlite(_)));
        assert!(!dst_path.exists());
    }
}
