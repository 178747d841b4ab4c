//! Integration tests for segbackup.
//!
//! Full backup and restore runs against the in-process database engine.
//!
//! Run with: `cargo test --test integration`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use segbackup_core::config::DatabaseConfig;
use segbackup_core::storage::{FilesystemBackend, MemoryBackend, StorageBackendConfig};
use segbackup_core::{
    BackupEngine, BackupManifest, BackupOptions, Config, EntryHandler, EntryOutput, MemoryDatabase, Mode,
    ObjectKind, ObjectSelection, ParallelExecutor, Phase, PhaseConcurrency, RestoreEngine, RestoreOptions,
    Result, Session, SessionPool, StorageBackend, TocEntry,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn database_config(selection: ObjectSelection) -> DatabaseConfig {
    DatabaseConfig {
        url: "postgres://gpadmin@coordinator:5432/warehouse".to_string(),
        connect_timeout_secs: 5,
        selection,
    }
}

fn backup_config(backup_id: &str, options: BackupOptions) -> Config {
    Config {
        mode: Mode::Backup,
        backup_id: backup_id.to_string(),
        source: Some(database_config(ObjectSelection::default())),
        target: None,
        storage: StorageBackendConfig::Memory,
        backup: Some(options),
        restore: None,
    }
}

fn restore_config(backup_id: &str, options: RestoreOptions, selection: ObjectSelection) -> Config {
    Config {
        mode: Mode::Restore,
        backup_id: backup_id.to_string(),
        source: None,
        target: Some(database_config(selection)),
        storage: StorageBackendConfig::Memory,
        backup: None,
        restore: Some(options),
    }
}

fn new_database(version: &str) -> MemoryDatabase {
    MemoryDatabase::new(version.parse().expect("bad version"))
}

async fn run_backup(db: &MemoryDatabase, storage: &Arc<dyn StorageBackend>, backup_id: &str) -> BackupManifest {
    let engine = BackupEngine::with_collaborators(
        backup_config(backup_id, BackupOptions::default()),
        Arc::new(db.clone()),
        storage.clone(),
    )
    .expect("Failed to create backup engine");
    let report = engine.run().await.expect("Backup failed");
    assert!(report.is_success(), "{}", report);

    BackupManifest::load(storage.as_ref(), backup_id)
        .await
        .expect("Failed to load manifest")
}

fn restore_engine(
    storage: &Arc<dyn StorageBackend>,
    target: &MemoryDatabase,
    backup_id: &str,
    options: RestoreOptions,
    selection: ObjectSelection,
) -> RestoreEngine {
    RestoreEngine::with_collaborators(
        restore_config(backup_id, options, selection),
        Arc::new(target.clone()),
        storage.clone(),
    )
    .expect("Failed to create restore engine")
}

/// `public.metrics` with three integer columns and 100 analyzed rows.
fn wide_table_database() -> MemoryDatabase {
    let db = new_database("gpdb-7.1.0");
    db.run("CREATE TABLE public.metrics (id int, doubled int, bucket int)")
        .unwrap();
    db.insert(
        "public.metrics",
        (0..100).map(|i| vec![i, i * 2, i % 7]),
    )
    .unwrap();
    db.analyze("public.metrics").unwrap();
    db
}

/// Orders referencing customers through a foreign key.
fn foreign_key_database() -> MemoryDatabase {
    let db = new_database("gpdb-7.1.0");
    db.run(
        "CREATE SCHEMA sales;
         CREATE TABLE sales.customers (id int, name text);
         CREATE TABLE sales.orders (id int, customer_id int)",
    )
    .unwrap();
    db.insert("sales.customers", vec![vec!["1", "ada"], vec!["2", "grace"]]).unwrap();
    db.insert("sales.orders", vec![vec!["10", "1"], vec!["11", "2"], vec!["12", "1"]])
        .unwrap();
    db.run(
        "ALTER TABLE sales.customers ADD CONSTRAINT customers_pk PRIMARY KEY (id);
         ALTER TABLE sales.orders ADD CONSTRAINT orders_customer_fk FOREIGN KEY (customer_id) REFERENCES sales.customers (id);
         CREATE INDEX orders_customer_idx ON sales.orders (customer_id)",
    )
    .unwrap();
    db
}

/// A primary key whose name sorts after the foreign key that needs it.
fn late_key_database() -> MemoryDatabase {
    let db = new_database("gpdb-7.1.0");
    db.run(
        "CREATE SCHEMA sales;
         CREATE TABLE sales.customers (id int);
         CREATE TABLE sales.orders (id int, customer_id int)",
    )
    .unwrap();
    db.insert("sales.customers", vec![vec!["1"], vec!["2"]]).unwrap();
    db.insert("sales.orders", vec![vec!["10", "2"]]).unwrap();
    db.run(
        "ALTER TABLE sales.customers ADD CONSTRAINT zz_customers_pk PRIMARY KEY (id);
         ALTER TABLE sales.orders ADD CONSTRAINT aa_orders_fk FOREIGN KEY (customer_id) REFERENCES sales.customers (id)",
    )
    .unwrap();
    db
}

/// `public.foo (i int, j text, k bool)` with four analyzed rows.
fn foo_database(version: &str) -> MemoryDatabase {
    let db = new_database(version);
    db.run("CREATE TABLE foo (i int, j text, k bool)").unwrap();
    db.insert(
        "public.foo",
        vec![
            vec!["1", "a", "t"],
            vec!["2", "b", "f"],
            vec!["3", "c", "t"],
            vec!["4", "d", "f"],
        ],
    )
    .unwrap();
    db.analyze("public.foo").unwrap();
    db
}

fn strings(items: &[&str]) -> Option<Vec<String>> {
    Some(items.iter().map(|s| s.to_string()).collect())
}

// ============================================================================
// Backup and restore round trips
// ============================================================================

#[tokio::test]
async fn test_wide_table_round_trip() {
    let source = wide_table_database();
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let manifest = run_backup(&source, &storage, "wide").await;

    // public exists everywhere, so only the table, one data chunk, nothing
    // attached, one statistics entry
    assert_eq!(manifest.toc.count(Phase::PreData), 1);
    assert_eq!(manifest.toc.count(Phase::Data), 1);
    assert_eq!(manifest.toc.count(Phase::PostData), 0);
    assert_eq!(manifest.toc.count(Phase::Statistics), 1);
    assert_eq!(manifest.total_rows(), 100);

    let target = new_database("gpdb-7.1.0");
    let report = restore_engine(
        &storage,
        &target,
        "wide",
        RestoreOptions::default(),
        ObjectSelection::default(),
    )
    .run()
    .await
    .expect("Restore failed");

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.rows(), 100);
    assert_eq!(target.row_count("public.metrics"), Some(100));
    assert_eq!(target.rows("public.metrics"), source.rows("public.metrics"));

    let source_stats = source.attribute_statistics("public.metrics");
    let restored_stats = target.attribute_statistics("public.metrics");
    assert_eq!(restored_stats.len(), 3);
    for (src, dst) in source_stats.iter().zip(&restored_stats) {
        assert_eq!(src.attname, dst.attname);
        assert_eq!(src.kinds, dst.kinds);
        assert_eq!(src.values.first(), dst.values.first());
        assert!(dst.values[0].is_some(), "{} has no first slot values", dst.attname);
        assert_eq!(src.distinct, dst.distinct);
    }
    assert_eq!(
        target.tuple_statistic("public.metrics"),
        source.tuple_statistic("public.metrics")
    );
    assert_eq!(target.held_locks(), 0);
}

#[tokio::test]
async fn test_round_trip_through_filesystem_storage() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let storage: Arc<dyn StorageBackend> = Arc::new(FilesystemBackend::new(temp_dir.path().to_path_buf()));

    let source = foreign_key_database();
    let manifest = run_backup(&source, &storage, "fs-backup").await;
    assert!(temp_dir.path().join("fs-backup/manifest.json").exists());
    assert!(temp_dir.path().join("fs-backup/metadata.sql").exists());
    for artifact in &manifest.artifacts {
        assert!(temp_dir.path().join(&artifact.key).exists());
    }

    let target = new_database("gpdb-7.1.0");
    let report = restore_engine(
        &storage,
        &target,
        "fs-backup",
        RestoreOptions::default(),
        ObjectSelection::default(),
    )
    .run()
    .await
    .expect("Restore failed");

    assert!(report.is_success(), "{}", report);
    assert_eq!(target.row_count("sales.customers"), Some(2));
    assert_eq!(target.row_count("sales.orders"), Some(3));
    assert!(target.has_object(ObjectKind::Constraint, "sales", "orders_customer_fk"));
    assert!(target.has_object(ObjectKind::Index, "sales", "orders_customer_idx"));
}

#[tokio::test]
async fn test_foreign_key_follows_both_data_entries() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let manifest = run_backup(&foreign_key_database(), &storage, "fk").await;

    let data_ordinal = |name: &str| {
        manifest
            .toc
            .phase(Phase::Data)
            .find(|e| e.name == name)
            .map(|e| e.ordinal)
            .expect("missing data entry")
    };
    let fk = manifest
        .toc
        .iter()
        .find(|e| e.name == "orders_customer_fk")
        .expect("missing constraint entry");

    assert_eq!(fk.phase, Phase::PostData);
    assert!(fk.ordinal > data_ordinal("customers"));
    assert!(fk.ordinal > data_ordinal("orders"));
    manifest.toc.validate().expect("TOC invariants violated");
}

#[tokio::test]
async fn test_foreign_key_waits_for_referenced_key() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let manifest = run_backup(&late_key_database(), &storage, "keys").await;

    let entry = |name: &str| {
        manifest
            .toc
            .iter()
            .find(|e| e.name == name)
            .expect("missing constraint entry")
    };
    let pk = entry("zz_customers_pk");
    let fk = entry("aa_orders_fk");
    assert!(fk.depends_on.contains(&pk.ordinal));
    assert!(fk.ordinal > pk.ordinal);

    let target = new_database("gpdb-7.1.0");
    let report = restore_engine(&storage, &target, "keys", RestoreOptions::default(), ObjectSelection::default())
        .run()
        .await
        .expect("Restore failed");
    assert!(report.is_success(), "{}", report);
    assert!(target.has_object(ObjectKind::Constraint, "sales", "zz_customers_pk"));
    assert!(target.has_object(ObjectKind::Constraint, "sales", "aa_orders_fk"));
}

#[tokio::test]
async fn test_foo_statistics_survive_restore_on_each_engine() {
    for version in ["gpdb-6.25.3", "gpdb-7.1.0", "cbdb-2.1.0"] {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        run_backup(&foo_database(version), &storage, "foo").await;

        let target = new_database(version);
        let report = restore_engine(&storage, &target, "foo", RestoreOptions::default(), ObjectSelection::default())
            .run()
            .await
            .expect("Restore failed");
        assert!(report.is_success(), "{}: {}", version, report);
        assert_eq!(target.tuple_statistic("public.foo"), Some((4.0, 1)), "{}", version);

        let stats = target.attribute_statistics("public.foo");
        assert_eq!(stats.len(), 3, "{}", version);
        let (i, j, k) = (&stats[0], &stats[1], &stats[2]);

        assert_eq!(i.distinct, -1.0);
        assert_eq!(i.width, 4);
        assert_eq!(i.kinds[..2], [2, 3]);
        assert_eq!(i.operators[..2], [97, 97]);
        assert_eq!(i.values[0], strings(&["1", "2", "3", "4"]));

        assert_eq!(j.distinct, -1.0);
        assert_eq!(j.width, 2);
        assert_eq!(j.kinds[..2], [2, 3]);
        assert_eq!(j.operators[..2], [664, 664]);
        assert_eq!(j.values[0], strings(&["a", "b", "c", "d"]));

        assert_eq!(k.distinct, -0.5);
        assert_eq!(k.kinds[..2], [1, 3]);
        assert_eq!(k.operators[..2], [91, 58]);
        assert_eq!(k.values[0], strings(&["f", "t"]));
        assert_eq!(k.numbers[0], strings(&["0.5", "0.5"]));

        match version {
            "gpdb-6.25.3" => {
                assert!(stats.iter().all(|s| s.kinds.len() == 2));
                assert!(stats.iter().all(|s| s.collations.iter().all(|c| *c == 0)));
            }
            "gpdb-7.1.0" => {
                assert!(stats.iter().all(|s| s.kinds.len() == 2));
                assert_eq!(i.collations, vec![0, 0]);
                assert_eq!(j.collations, vec![100, 100]);
            }
            _ => {
                assert!(stats.iter().all(|s| s.kinds[2] == 8));
                assert_eq!(i.operators[2], 97);
                assert_eq!(j.operators[2], 664);
                assert_eq!(k.operators[2], 58);
                assert_eq!(j.collations[2], 100);
                assert_eq!(i.values[2], strings(&["4"]));
                assert_eq!(j.values[2], strings(&["4"]));
            }
        }
    }
}

#[tokio::test]
async fn test_foo_statistics_downgrade_drops_segment_ndv() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    run_backup(&foo_database("cbdb-2.1.0"), &storage, "foo-down").await;

    let target = new_database("gpdb-6.25.3");
    let report = restore_engine(&storage, &target, "foo-down", RestoreOptions::default(), ObjectSelection::default())
        .run()
        .await
        .expect("Restore failed");
    assert!(report.is_success(), "{}", report);

    let stats = target.attribute_statistics("public.foo");
    let kinds: Vec<Vec<i16>> = stats.iter().map(|s| s.kinds.clone()).collect();
    assert_eq!(kinds, vec![vec![2, 3], vec![2, 3], vec![1, 3]]);
    assert!(stats.iter().all(|s| s.collations == vec![0, 0]));
    assert_eq!(stats[0].distinct, -1.0);
    assert_eq!(stats[2].distinct, -0.5);

    let slot_warnings = report
        .all_warnings()
        .into_iter()
        .filter(|w| w.contains("Unsupported statistic kind"))
        .count();
    assert_eq!(slot_warnings, 3);
}

#[tokio::test]
async fn test_statistics_downgrade_truncates_slots() {
    let source = new_database("cbdb-2.1.0");
    source
        .run("CREATE TABLE public.flags (active bool)")
        .unwrap();
    source
        .insert(
            "public.flags",
            (0..100).map(|i| vec![if i % 3 == 0 { "f" } else { "t" }]),
        )
        .unwrap();
    source.analyze("public.flags").unwrap();
    assert_eq!(source.attribute_statistics("public.flags")[0].kinds.len(), 3);

    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    run_backup(&source, &storage, "flags").await;

    let target = new_database("gpdb-6.25.3");
    let report = restore_engine(
        &storage,
        &target,
        "flags",
        RestoreOptions::default(),
        ObjectSelection::default(),
    )
    .run()
    .await
    .expect("Restore failed");

    assert!(report.is_success(), "{}", report);
    let restored = target.attribute_statistics("public.flags");
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].kinds, vec![1, 3]);

    let slot_warnings: Vec<String> = report
        .all_warnings()
        .into_iter()
        .filter(|w| w.contains("Unsupported statistic kind"))
        .collect();
    assert_eq!(slot_warnings.len(), 1, "{:?}", slot_warnings);
}

#[tokio::test]
async fn test_filtered_restore_into_existing_schema() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    run_backup(&foreign_key_database(), &storage, "subset").await;

    let target = new_database("gpdb-7.1.0");
    target.run("CREATE SCHEMA sales").unwrap();

    let selection = ObjectSelection {
        include_relations: vec!["sales.customers".to_string()],
        ..Default::default()
    };
    let report = restore_engine(&storage, &target, "subset", RestoreOptions::default(), selection)
        .run()
        .await
        .expect("Restore failed");

    assert!(report.is_success(), "{}", report);
    assert_eq!(target.row_count("sales.customers"), Some(2));
    assert_eq!(target.row_count("sales.orders"), None);
    assert!(target.has_object(ObjectKind::Constraint, "sales", "customers_pk"));
}

#[tokio::test]
async fn test_restore_conflicting_table_reports_failure() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    run_backup(&wide_table_database(), &storage, "clash").await;

    let target = new_database("gpdb-7.1.0");
    target
        .run("CREATE TABLE public.metrics (id int, doubled int, bucket int)")
        .unwrap();

    let report = restore_engine(
        &storage,
        &target,
        "clash",
        RestoreOptions::default(),
        ObjectSelection::default(),
    )
    .run()
    .await
    .expect("Restore failed");

    // The CREATE TABLE fails and its data and statistics are skipped.
    assert!(!report.is_success());
    assert_eq!(report.failed(), 1);
    assert!(report.skipped() >= 1);
    assert_eq!(target.row_count("public.metrics"), Some(0));
}

// ============================================================================
// Executor phase barrier
// ============================================================================

#[derive(Default)]
struct PhaseRecorder {
    events: Mutex<Vec<(Phase, bool)>>,
}

#[async_trait]
impl EntryHandler for PhaseRecorder {
    async fn apply(&self, entry: &TocEntry, _session: &mut dyn Session) -> Result<EntryOutput> {
        self.events.lock().push((entry.phase, true));
        // Later ordinals finish first to shake out ordering assumptions.
        let delay = 20u64.saturating_sub(entry.ordinal as u64);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.events.lock().push((entry.phase, false));
        Ok(EntryOutput::rows(1))
    }
}

#[tokio::test]
async fn test_no_entry_starts_before_previous_phase_finishes() {
    let entries: Vec<TocEntry> = (0..16u32)
        .map(|ordinal| TocEntry {
            ordinal,
            phase: match ordinal {
                0..=3 => Phase::PreData,
                4..=9 => Phase::Data,
                10..=13 => Phase::PostData,
                _ => Phase::Statistics,
            },
            oid: 20_000 + ordinal,
            kind: ObjectKind::Table,
            schema: "public".to_string(),
            name: format!("t{}", ordinal),
            owner: None,
            parent: None,
            depends_on: Vec::new(),
            metadata: None,
            data: None,
        })
        .collect();

    let db = new_database("gpdb-7.1.0");
    let pool = SessionPool::connect(&db, 4).await.expect("Failed to open sessions");
    let mut executor = ParallelExecutor::new(pool, PhaseConcurrency { metadata_jobs: 2, jobs: 4 });
    let handler = Arc::new(PhaseRecorder::default());
    let report = executor
        .run("barrier", &entries, &HashSet::new(), handler.clone())
        .await
        .expect("Executor failed");
    assert_eq!(report.succeeded(), 16);

    let events = handler.events.lock().clone();
    for (i, (phase, started)) in events.iter().enumerate() {
        if !*started {
            continue;
        }
        // Every earlier-phase entry has already finished.
        let unfinished_earlier = events[i..].iter().any(|(p, s)| !*s && p < phase);
        assert!(!unfinished_earlier, "{} entry started while an earlier phase was running", phase);
    }
}
