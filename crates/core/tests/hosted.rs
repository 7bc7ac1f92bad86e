//! End-to-end lifecycle tests: one worker, an in-memory object store, and
//! the embedded coordination registry, surviving restarts and local wipes.

use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;
use gridhost::config::SKIP_CHECKSUM_MISMATCH_ENV;
use gridhost::control_db::CHECKSUM_DELETED;
use gridhost::storage::cached::CachedStorage;
use gridhost::storage::memory::MemoryStorage;
use gridhost::storage::ExternalStorage;
use gridhost::{FetchMode, HostedStorageManager, HsmConfig, StorageError};
use gridhost_paths::{DataDir, FromPathUnchecked};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn enable_logging() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

struct Fixture {
    tmp: TempDir,
    storage: Arc<MemoryStorage>,
}

impl Fixture {
    fn new() -> Self {
        enable_logging();
        Self {
            tmp: TempDir::new().unwrap(),
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    fn config() -> HsmConfig {
        HsmConfig {
            seconds_before_push: 0.02,
            seconds_before_first_retry: 0.02,
            retry_attempts: 4,
            // Keep background pruning out of the tests' way; retention is
            // exercised explicitly.
            prune_after_pushes: 100,
            ..HsmConfig::default()
        }
    }

    fn manager(&self) -> HostedStorageManager {
        self.manager_with(Self::config())
    }

    fn manager_with(&self, config: HsmConfig) -> HostedStorageManager {
        let storage = Arc::clone(&self.storage) as Arc<dyn ExternalStorage>;
        self.manager_on(config, storage)
    }

    fn manager_on(&self, config: HsmConfig, storage: Arc<dyn ExternalStorage>) -> HostedStorageManager {
        HostedStorageManager::new(
            &DataDir::from_path_unchecked(self.tmp.path()),
            "w1",
            config,
            move |_purpose| Arc::clone(&storage),
        )
        .unwrap()
    }

    /// Simulate losing the worker's disk. Only valid with no manager alive.
    fn wipe_local(&self) {
        std::fs::remove_dir_all(self.tmp.path().join("docs")).unwrap();
    }
}

async fn seed_doc(m: &HostedStorageManager, doc_id: &str, value: &str) {
    let doc = m.fetch_doc(doc_id, FetchMode::Open).await.unwrap();
    doc.execute("CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT)").await.unwrap();
    doc.execute(format!("INSERT INTO Table1 (id, A) VALUES (1, '{value}')")).await.unwrap();
}

async fn read_a(m: &HostedStorageManager, doc_id: &str) -> Option<String> {
    let doc = m.fetch_doc(doc_id, FetchMode::Open).await.unwrap();
    doc.query_text("SELECT A FROM Table1 WHERE id = 1").await.unwrap()
}

#[tokio::test]
async fn create_modify_restart() {
    let fx = Fixture::new();
    {
        let m = fx.manager();
        let doc = m.fetch_doc("D1", FetchMode::Open).await.unwrap();
        doc.execute("CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT)").await.unwrap();
        doc.execute("INSERT INTO Table1 (id, A) VALUES (1, 'magic_word')").await.unwrap();
        m.shutdown().await.unwrap();
    }
    fx.wipe_local();

    let m = fx.manager();
    assert_eq!(read_a(&m, "D1").await.as_deref(), Some("magic_word"));

    // The local copy, the registry and the stored head all agree.
    let doc = m.fetch_doc("D1", FetchMode::Open).await.unwrap();
    let registry_token = m.checksums().get("D1").unwrap().unwrap();
    let local_token =
        gridhost::local_store::compute_token(&fx.tmp.path().join("docs").join("D1.grist")).unwrap();
    assert_eq!(registry_token, local_token);
    assert!(m.doc_storage().exists("D1", None).await.unwrap());
    drop(doc);
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn viewing_produces_no_new_snapshot() {
    let fx = Fixture::new();
    let m = fx.manager();
    seed_doc(&m, "DV", "quiet").await;
    m.close_doc("DV").await.unwrap();
    let baseline = m.get_snapshots("DV").await.unwrap().len();

    let doc = m.fetch_doc("DV", FetchMode::Open).await.unwrap();
    drop(doc);
    m.close_doc("DV").await.unwrap();

    assert_eq!(m.get_snapshots("DV").await.unwrap().len(), baseline);
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn checksum_mismatch_fails_closed_until_override() {
    let fx = Fixture::new();
    {
        let m = fx.manager();
        seed_doc(&m, "D1", "magic_word").await;
        m.shutdown().await.unwrap();
        m.checksums().set("D1", "nobble").unwrap();
    }
    fx.wipe_local();

    {
        let m = fx.manager();
        let err = m.fetch_doc("D1", FetchMode::Open).await.unwrap_err();
        assert!(
            err.to_string().contains("did not become consistent"),
            "unexpected error: {err}"
        );
    }

    // The operator override accepts the download and repairs the registry.
    std::env::set_var(SKIP_CHECKSUM_MISMATCH_ENV, "1");
    let mut config = HsmConfig::from_env();
    std::env::remove_var(SKIP_CHECKSUM_MISMATCH_ENV);
    assert!(config.skip_checksum_mismatch);
    config.seconds_before_push = 0.02;
    config.seconds_before_first_retry = 0.02;
    config.retry_attempts = 2;

    let m = fx.manager_with(config);
    assert_eq!(read_a(&m, "D1").await.as_deref(), Some("magic_word"));
    assert_ne!(m.checksums().get("D1").unwrap().as_deref(), Some("nobble"));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn fork_divergence() {
    let fx = Fixture::new();
    {
        let m = fx.manager();
        seed_doc(&m, "T1", "trunk").await;
        m.prepare_fork("T1", "T1~fork1").await.unwrap();

        let fork = m.fetch_doc("T1~fork1", FetchMode::Open).await.unwrap();
        fork.execute("UPDATE Table1 SET A = 'fork' WHERE id = 1").await.unwrap();
        m.shutdown().await.unwrap();
    }
    fx.wipe_local();

    let m = fx.manager();
    assert_eq!(read_a(&m, "T1").await.as_deref(), Some("trunk"));
    assert_eq!(read_a(&m, "T1~fork1").await.as_deref(), Some("fork"));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn unmodified_fork_survives_trunk_wipe() {
    let fx = Fixture::new();
    {
        let m = fx.manager();
        seed_doc(&m, "D2", "trunk").await;
        m.prepare_fork("D2", "D2~fork1").await.unwrap();
        m.shutdown().await.unwrap();
    }
    fx.wipe_local();

    let m = fx.manager();
    assert_eq!(read_a(&m, "D2~fork1").await.as_deref(), Some("trunk"));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn fork_of_nothing_is_an_error() {
    let fx = Fixture::new();
    let m = fx.manager();

    let err = m.fetch_doc("ghost~fork1", FetchMode::Open).await.unwrap_err();
    assert!(matches!(err, StorageError::ForkNotFound(_)));

    let err = m.prepare_fork("A", "B~fork1").await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidFork(..)));
}

#[tokio::test]
async fn pruning_keeps_the_tail() {
    let fx = Fixture::new();
    let m = fx.manager();
    let doc = m.fetch_doc("D5", FetchMode::Open).await.unwrap();
    doc.execute("CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT)").await.unwrap();
    for i in 0..8 {
        doc.execute(format!("INSERT INTO Table1 (id, A) VALUES ({i}, 'row{i}')")).await.unwrap();
        m.make_backup("D5", &format!("step{i}")).await.unwrap();
    }
    let before = m.get_snapshots("D5").await.unwrap();
    assert!(before.len() >= 8);
    let newest = before[0].snapshot_id.clone();

    m.prune_snapshots("D5").await.unwrap();
    m.wait_for_prunes().await;

    let after = m.get_snapshots("D5").await.unwrap();
    // Five kept verbatim, plus at most one hour-bucket head if the test
    // straddled an hour boundary.
    assert!(
        (5..=6).contains(&after.len()),
        "kept {} snapshots",
        after.len()
    );
    assert_eq!(after[0].snapshot_id, newest, "the current snapshot is never pruned");
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_then_recreate() {
    let fx = Fixture::new();
    let m = fx.manager();
    seed_doc(&m, "D3", "doomed").await;
    m.close_doc("D3").await.unwrap();

    m.delete_doc("D3", true).await.unwrap();
    assert!(!m.doc_storage().exists("D3", None).await.unwrap());
    assert_eq!(m.checksums().get("D3").unwrap().as_deref(), Some(CHECKSUM_DELETED));

    // Idempotent.
    m.delete_doc("D3", true).await.unwrap();
    assert_eq!(m.checksums().get("D3").unwrap().as_deref(), Some(CHECKSUM_DELETED));

    // Plain opens refuse; the explicit creation path succeeds.
    let err = m.fetch_doc("D3", FetchMode::Open).await.unwrap_err();
    assert!(matches!(err, StorageError::Deleted(_)));

    let doc = m.fetch_doc("D3", FetchMode::Create).await.unwrap();
    doc.execute("CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT)").await.unwrap();
    m.close_doc("D3").await.unwrap();
    let token = m.checksums().get("D3").unwrap().unwrap();
    assert_ne!(token, CHECKSUM_DELETED);
    assert_ne!(token, "null");
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn backup_labels_and_metadata() {
    let fx = Fixture::new();
    let m = fx.manager();
    let doc = m.fetch_doc("D8", FetchMode::Open).await.unwrap();
    doc.execute("CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT)").await.unwrap();
    doc.execute("UPDATE _grist_DocInfo SET timezone = 'America/New_York' WHERE id = 1").await.unwrap();

    let snapshot = m.make_backup("D8", "hello").await.unwrap();
    assert_eq!(snapshot.label(), Some("hello"));
    assert_eq!(snapshot.timezone().unwrap(), doc.timezone().await.unwrap());
    assert_eq!(
        snapshot.action_hash().unwrap(),
        doc.action_hash().await.unwrap()
    );

    // The same metadata comes back through the listing.
    let listed = m.get_snapshots("D8").await.unwrap();
    assert_eq!(listed[0].metadata, snapshot.metadata);
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrent_fetches_share_one_handle() {
    let fx = Fixture::new();
    let m = fx.manager();
    let (a, b) = tokio::join!(
        m.fetch_doc("DD", FetchMode::Open),
        m.fetch_doc("DD", FetchMode::Open)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn parallel_prepare_fails_fast() {
    let fx = Fixture::new();
    let m = fx.manager();
    let (first, second) = tokio::join!(
        m.prepare_local_doc("DP", FetchMode::Open),
        m.prepare_local_doc("DP", FetchMode::Open)
    );
    assert!(first.is_ok());
    assert!(matches!(second, Err(StorageError::PrepareInParallel(_))));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn snapshot_references_open_read_only() {
    let fx = Fixture::new();
    let m = fx.manager();
    seed_doc(&m, "DS", "one").await;
    let first = m.make_backup("DS", "first").await.unwrap();

    let doc = m.fetch_doc("DS", FetchMode::Open).await.unwrap();
    doc.execute("UPDATE Table1 SET A = 'two' WHERE id = 1").await.unwrap();
    m.make_backup("DS", "second").await.unwrap();

    let snap_ref = format!("DS~v={}", first.snapshot_id);
    let old = m.fetch_doc(&snap_ref, FetchMode::Open).await.unwrap();
    assert!(old.is_read_only());
    assert_eq!(
        old.query_text("SELECT A FROM Table1 WHERE id = 1").await.unwrap().as_deref(),
        Some("one")
    );
    let err = old.execute("UPDATE Table1 SET A = 'three'").await.unwrap_err();
    assert!(matches!(err, StorageError::SnapshotImmutable(_)));

    // Replacing a snapshot reference is refused too.
    let err = m.replace_doc(&snap_ref, "DS").await.unwrap_err();
    assert!(matches!(err, StorageError::SnapshotImmutable(_)));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn replace_swaps_in_the_source_content() {
    let fx = Fixture::new();
    let m = fx.manager();
    seed_doc(&m, "RA", "alpha").await;
    m.close_doc("RA").await.unwrap();
    seed_doc(&m, "RB", "beta").await;
    m.close_doc("RB").await.unwrap();

    let before = m.get_snapshots("RA").await.unwrap().len();
    m.replace_doc("RA", "RB").await.unwrap();
    assert_eq!(read_a(&m, "RA").await.as_deref(), Some("beta"));
    assert_eq!(m.get_snapshots("RA").await.unwrap().len(), before + 1);
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn untrusted_local_copy_is_moved_aside_on_restart() {
    let fx = Fixture::new();
    {
        let m = fx.manager();
        seed_doc(&m, "DR", "clean").await;
        m.shutdown().await.unwrap();
    }
    // Corrupt the marker behind the manager's back.
    let marker = fx.tmp.path().join("docs").join("DR.grist-hash-doc");
    std::fs::write(&marker, "garbage").unwrap();

    let m = fx.manager();
    assert!(!fx.tmp.path().join("docs").join("DR.grist").exists());
    assert!(fx.tmp.path().join("docs").join("trash").read_dir().unwrap().next().is_some());

    // The next fetch downloads a verified copy.
    assert_eq!(read_a(&m, "DR").await.as_deref(), Some("clean"));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_cache_delays_but_never_corrupts() {
    let fx = Fixture::new();
    let cached: Arc<dyn ExternalStorage> = Arc::new(CachedStorage::new(
        Arc::clone(&fx.storage) as Arc<dyn ExternalStorage>,
        Duration::from_millis(300),
    ));
    {
        let m = fx.manager_on(Fixture::config(), Arc::clone(&cached));
        seed_doc(&m, "DC", "v1").await;
        m.close_doc("DC").await.unwrap();
        // Prime the listing cache, then push newer content behind it.
        m.get_snapshots("DC").await.unwrap();
        let doc = m.fetch_doc("DC", FetchMode::Open).await.unwrap();
        doc.execute("UPDATE Table1 SET A = 'v2' WHERE id = 1").await.unwrap();
        m.shutdown().await.unwrap();
    }
    fx.wipe_local();

    // The first downloads resolve through the stale listing and fail
    // verification; the retry loop outlives the TTL and converges.
    let m = fx.manager_on(Fixture::config(), cached);
    assert_eq!(read_a(&m, "DC").await.as_deref(), Some("v2"));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn attachment_cap_is_enforced() {
    let fx = Fixture::new();
    let mut config = Fixture::config();
    config.max_attachment_bytes = Some(4);
    let m = fx.manager_with(config);

    let doc = m.fetch_doc("DA", FetchMode::Open).await.unwrap();
    doc.add_attachment("small", vec![1, 2]).await.unwrap();
    let err = doc.add_attachment("big", vec![0; 16]).await.unwrap_err();
    assert!(matches!(err, StorageError::TooLarge { .. }));
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_upload_failures_are_absorbed() {
    let fx = Fixture::new();
    let m = fx.manager();
    seed_doc(&m, "DT", "persisted").await;
    fx.storage.inject_upload_failures(2);
    m.close_doc("DT").await.unwrap();

    assert!(m.doc_storage().exists("DT", None).await.unwrap());
    assert!(!m.needs_update());
    m.shutdown().await.unwrap();
}

#[tokio::test]
async fn legacy_files_migrate_on_open() {
    let fx = Fixture::new();
    // A schema-v1 file appears in the doc root (say, restored by an
    // operator) before the worker boots.
    let docs_dir = fx.tmp.path().join("docs");
    std::fs::create_dir_all(&docs_dir).unwrap();
    {
        let conn = rusqlite::Connection::open(docs_dir.join("OLD.grist")).unwrap();
        conn.execute_batch(
            "CREATE TABLE _grist_DocInfo (
                 id INTEGER PRIMARY KEY,
                 schemaVersion INTEGER NOT NULL,
                 timezone TEXT NOT NULL DEFAULT 'UTC'
             );
             CREATE TABLE _gristsys_Files (id INTEGER PRIMARY KEY, ident TEXT UNIQUE NOT NULL, data BLOB);
             INSERT INTO _grist_DocInfo (id, schemaVersion) VALUES (1, 1);
             CREATE TABLE Table1 (id INTEGER PRIMARY KEY, A TEXT);
             INSERT INTO Table1 (id, A) VALUES (1, 'vintage');",
        )
        .unwrap();
    }

    let m = fx.manager();
    let doc = m.fetch_doc("OLD", FetchMode::Open).await.unwrap();
    assert_eq!(doc.schema_version().await.unwrap(), gridhost::migrate::SCHEMA_VERSION);
    assert_eq!(
        doc.query_text("SELECT A FROM Table1 WHERE id = 1").await.unwrap().as_deref(),
        Some("vintage")
    );

    // The migration pushed a labeled snapshot.
    let snapshots = m.get_snapshots("OLD").await.unwrap();
    assert_eq!(snapshots[0].label(), Some("migrate-schema-v1-to-v3"));
    m.shutdown().await.unwrap();
}
