//! Restore engine orchestration.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::artifact::read_chunk;
use crate::catalog::{ObjectKind, ObjectRef};
use crate::config::{Config, DatabaseConfig, Mode, RestoreOptions};
use crate::database::{existing_objects, Database, PostgresDatabase, Session};
use crate::error::DatabaseError;
use crate::executor::{EntryHandler, EntryOutput, ParallelExecutor, PhaseConcurrency, SessionPool};
use crate::manifest::{BackupManifest, EntryOutcome, EntryReport, RestoreCheckpoint, RunReport};
use crate::metrics::PerformanceMetrics;
use crate::resolver::validate_subset;
use crate::snapshot::SnapshotManager;
use crate::statistics::{install_attribute, StatisticsFile};
use crate::storage::{create_backend, metadata_key, statistics_key, StorageBackend};
use crate::toc::{metadata_statement, Phase, Toc, TocEntry};
use crate::version::StatisticsFeatures;
use crate::{Error, Result};

/// Restore engine for replaying a backup set into a target database
pub struct RestoreEngine {
    config: Config,
    options: RestoreOptions,
    database: Arc<dyn Database>,
    storage: Arc<dyn StorageBackend>,
    metrics: Arc<PerformanceMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Entries to run plus the ones left out, with reasons
struct RestorePlan {
    manifest: BackupManifest,
    entries: Toc,
    skipped: Vec<(TocEntry, String)>,
    target_features: StatisticsFeatures,
}

impl RestoreEngine {
    /// Create a restore engine connecting to the configured target.
    pub fn new(config: Config) -> Result<Self> {
        let target = target_config(&config)?;
        let database = Arc::new(PostgresDatabase::new(
            &target.url,
            Duration::from_secs(target.connect_timeout_secs),
        )?);
        let storage = create_backend(&config.storage)?;
        Self::with_collaborators(config, database, storage)
    }

    /// Create a restore engine over explicit database and storage collaborators.
    pub fn with_collaborators(
        config: Config,
        database: Arc<dyn Database>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;

        if config.mode != Mode::Restore {
            return Err(Error::Config(
                "Configuration mode must be 'restore'".to_string(),
            ));
        }

        let options = config.restore.clone().unwrap_or_default();
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            options,
            database,
            storage,
            metrics: Arc::new(PerformanceMetrics::new()),
            shutdown_tx,
        })
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get a shutdown handle that can be used from other tasks
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn metrics(&self) -> &PerformanceMetrics {
        &self.metrics
    }

    /// Run the restore process
    pub async fn run(&self) -> Result<RunReport> {
        let result = if self.options.dry_run {
            self.dry_run().await
        } else {
            self.run_internal().await
        };

        match result {
            Ok(report) => {
                info!("{}", self.metrics.report());
                Ok(report)
            }
            Err(e) => {
                warn!("Restore of {} failed: {}", self.config.backup_id, e);
                self.metrics.record_error();
                Err(e)
            }
        }
    }

    /// Plan the restore without touching the target.
    pub async fn dry_run(&self) -> Result<RunReport> {
        info!("Running dry-run validation for backup: {}", self.config.backup_id);
        let plan = self.plan().await?;

        let mut report = RunReport::new(self.config.backup_id.clone());
        report.dry_run = true;
        push_skipped(&mut report, &plan.skipped);

        for entry in plan.entries.iter() {
            let mut line = EntryReport::new(
                entry,
                EntryOutcome::Skipped {
                    reason: "dry run".to_string(),
                },
            );
            if let Some(range) = &entry.data {
                line.rows = range.rows;
                if !self.storage.exists(&range.artifact).await? {
                    line.outcome = EntryOutcome::Failed {
                        reason: format!("artifact {} is missing", range.artifact),
                    };
                }
            } else if entry.phase == Phase::Data {
                line.outcome = EntryOutcome::Failed {
                    reason: "no data recorded for this entry".to_string(),
                };
            }
            report.entries.push(line);
        }
        if !plan.manifest.is_complete() {
            report
                .warnings
                .push(format!("Backup {} is incomplete", plan.manifest.backup_id));
        }

        report.finish();
        info!(
            "Dry run: {} entries would be applied, {} left out",
            plan.entries.len(),
            plan.skipped.len()
        );
        Ok(report)
    }

    async fn run_internal(&self) -> Result<RunReport> {
        let backup_id = &self.config.backup_id;
        let plan = self.plan().await?;
        info!(
            "Restoring {} of {} entries from backup {} into {}",
            plan.entries.len(),
            plan.manifest.toc.len(),
            backup_id,
            self.database.target()
        );

        let metadata = self.storage.get(&metadata_key(backup_id)).await?;
        let statistics = self.load_statistics(&plan).await?;

        let checkpoint = self.load_checkpoint(&plan.manifest).await?;
        let already_applied: HashSet<u32> = checkpoint
            .as_ref()
            .map(|(_, cp)| cp.completed.iter().copied().collect())
            .unwrap_or_default();
        if !already_applied.is_empty() {
            info!("Resuming: {} entries already applied", already_applied.len());
        }

        let handler = Arc::new(RestoreHandler {
            storage: Arc::clone(&self.storage),
            metadata,
            statistics,
            target_features: plan.target_features,
            snapshots: SnapshotManager::new(self.options.lock_timeout()),
            checkpoint: checkpoint.map(|(path, cp)| (path, Mutex::new(cp))),
            metrics: Arc::clone(&self.metrics),
        });

        let concurrency = PhaseConcurrency {
            metadata_jobs: self.options.metadata_jobs,
            jobs: self.options.jobs,
        };
        let pool = SessionPool::connect(self.database.as_ref(), concurrency.max()).await?;
        let mut executor = ParallelExecutor::new(pool, concurrency)
            .strict(self.options.strict)
            .with_shutdown(self.shutdown_receiver());

        let run_handler: Arc<dyn EntryHandler> = handler.clone();
        let mut report = executor
            .run(backup_id, &plan.entries.entries, &already_applied, run_handler)
            .await?;

        push_skipped(&mut report, &plan.skipped);
        if !plan.manifest.is_complete() {
            report
                .warnings
                .push(format!("Backup {} is incomplete", plan.manifest.backup_id));
        }
        report.finish();

        if report.cancelled {
            handler.save_checkpoint().await?;
            return Err(Error::Cancelled);
        }
        if report.is_success() {
            handler.clear_checkpoint().await?;
        }

        info!(
            "Restore of {} finished: {} succeeded, {} failed, {} skipped, {} rows",
            backup_id,
            report.succeeded(),
            report.failed(),
            report.skipped(),
            report.rows()
        );
        Ok(report)
    }

    /// Filter the TOC and re-validate it against the target.
    async fn plan(&self) -> Result<RestorePlan> {
        let target = target_config(&self.config)?;
        let manifest = BackupManifest::load(self.storage.as_ref(), &self.config.backup_id).await?;
        if !manifest.is_complete() {
            warn!("Backup {} did not complete; restoring what it captured", manifest.backup_id);
        }

        let mut control = self.database.connect().await?;
        let version = control.server_version().await?;
        let mut target_features = version.statistics_features();
        if let Some(slots) = self.options.statistic_slots {
            target_features = target_features.with_slot_count(slots);
        }
        if target_features.slot_count < manifest.statistics_features.slot_count {
            info!(
                "Target {} holds {} statistic slots, backup has {}; extra slots will be dropped",
                version, target_features.slot_count, manifest.statistics_features.slot_count
            );
        }

        let selected = manifest
            .toc
            .lookup(&target.selection)
            .retain_phases(&self.phases(&manifest));
        let existing = existing_objects(control.as_mut()).await?;
        let validation = validate_subset(&selected, &manifest.toc, &existing);
        debug!(
            "Selected {} entries, {} kept, {} skipped",
            selected.len(),
            validation.kept.len(),
            validation.skipped.len()
        );

        Ok(RestorePlan {
            manifest,
            entries: validation.kept,
            skipped: validation.skipped,
            target_features,
        })
    }

    fn phases(&self, manifest: &BackupManifest) -> Vec<Phase> {
        let mut phases = if self.options.metadata_only {
            vec![Phase::PreData, Phase::PostData]
        } else if self.options.data_only {
            vec![Phase::Data]
        } else {
            vec![Phase::PreData, Phase::Data, Phase::PostData]
        };
        if self.options.with_stats && manifest.with_stats {
            phases.push(Phase::Statistics);
        }
        phases
    }

    async fn load_statistics(&self, plan: &RestorePlan) -> Result<Option<StatisticsFile>> {
        if plan.entries.count(Phase::Statistics) == 0 {
            return Ok(None);
        }
        let data = self.storage.get(&statistics_key(&self.config.backup_id)).await?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Hash of the settings that decide which entries a restore applies.
    fn config_hash(&self) -> Result<String> {
        let selection = serde_json::to_string(&target_config(&self.config)?.selection)?;
        let mut hasher = DefaultHasher::new();
        selection.hash(&mut hasher);
        self.options.metadata_only.hash(&mut hasher);
        self.options.data_only.hash(&mut hasher);
        self.options.with_stats.hash(&mut hasher);
        Ok(format!("{:016x}", hasher.finish()))
    }

    async fn load_checkpoint(
        &self,
        manifest: &BackupManifest,
    ) -> Result<Option<(PathBuf, RestoreCheckpoint)>> {
        let Some(path) = &self.options.checkpoint_state else {
            return Ok(None);
        };
        let config_hash = self.config_hash()?;

        let checkpoint = match RestoreCheckpoint::load(path).await? {
            Some(cp) if cp.backup_id == manifest.backup_id && cp.config_hash == config_hash => {
                info!(
                    "Loaded checkpoint: {} entries completed",
                    cp.completed.len()
                );
                cp
            }
            Some(cp) => {
                warn!(
                    "Ignoring checkpoint {:?} written for backup {} with different settings",
                    path, cp.backup_id
                );
                RestoreCheckpoint::new(manifest.backup_id.clone(), config_hash)
            }
            None => RestoreCheckpoint::new(manifest.backup_id.clone(), config_hash),
        };
        Ok(Some((path.clone(), checkpoint)))
    }
}

fn target_config(config: &Config) -> Result<&DatabaseConfig> {
    config
        .target
        .as_ref()
        .ok_or_else(|| Error::Config("Target configuration required".to_string()))
}

fn push_skipped(report: &mut RunReport, skipped: &[(TocEntry, String)]) {
    for (entry, reason) in skipped {
        report.entries.push(EntryReport::new(
            entry,
            EntryOutcome::Skipped {
                reason: reason.clone(),
            },
        ));
    }
}

/// Applies one TOC entry inside its own transaction
struct RestoreHandler {
    storage: Arc<dyn StorageBackend>,
    metadata: Bytes,
    statistics: Option<StatisticsFile>,
    target_features: StatisticsFeatures,
    snapshots: SnapshotManager,
    checkpoint: Option<(PathBuf, Mutex<RestoreCheckpoint>)>,
    metrics: Arc<PerformanceMetrics>,
}

impl RestoreHandler {
    async fn lock(&self, session: &mut dyn Session, relation: &ObjectRef) -> Result<()> {
        let started = Instant::now();
        self.snapshots.lock_for_restore(session, relation).await?;
        self.metrics.record_lock_wait(started.elapsed());
        Ok(())
    }

    async fn apply_in_transaction(
        &self,
        entry: &TocEntry,
        session: &mut dyn Session,
    ) -> Result<EntryOutput> {
        match entry.phase {
            Phase::PreData => self.create(entry, session).await,
            Phase::Data => self.load(entry, session).await,
            Phase::PostData => {
                if let Some(parent) = &entry.parent {
                    self.lock(session, parent).await?;
                }
                self.create(entry, session).await
            }
            Phase::Statistics => self.install_statistics(entry, session).await,
        }
    }

    async fn create(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput> {
        let statement = metadata_statement(&self.metadata, entry)?;
        match session.execute(&statement).await {
            Ok(()) => Ok(EntryOutput::default()),
            // Schemas such as `public` usually exist already.
            Err(Error::Database(DatabaseError::ObjectExists(_))) if entry.kind == ObjectKind::Schema => {
                debug!("Schema {} already exists", entry.name);
                Ok(EntryOutput::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn load(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput> {
        let relation = entry.object_ref();
        let range = entry.data.as_ref().ok_or_else(|| {
            Error::Manifest(format!("No data recorded for {}", relation.qualified_name()))
        })?;

        self.lock(session, &relation).await?;
        let rows = read_chunk(self.storage.as_ref(), range).await?;
        let uncompressed = rows.len() as u64;
        let loaded = session.copy_in(&relation, rows).await?;

        let mut output = EntryOutput::rows(loaded);
        if loaded != range.rows {
            output.warnings.push(format!(
                "{}: loaded {} rows, backup recorded {}",
                relation.qualified_name(),
                loaded,
                range.rows
            ));
        }
        self.metrics.record_rows(loaded);
        self.metrics.record_bytes(range.length, uncompressed);
        Ok(output)
    }

    async fn install_statistics(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput> {
        let relation = entry.object_ref();
        let statistics = self
            .statistics
            .as_ref()
            .ok_or_else(|| Error::Manifest("Backup has no statistics file".to_string()))?;
        let write_failure = |e: Error| Error::CatalogWriteFailure {
            relation: relation.qualified_name(),
            message: e.to_string(),
        };

        self.lock(session, &relation).await?;
        let mut output = EntryOutput::default();

        if let Some(tuple) = statistics.tuple_for(entry.oid) {
            session.write_tuple_statistic(tuple).await.map_err(write_failure)?;
        }
        for attribute in statistics.attributes_for(entry.oid) {
            let plan = install_attribute(attribute, &self.target_features);
            for warning in plan.warnings() {
                warn!("{}", warning);
                output.warnings.push(warning.to_string());
            }
            session
                .write_attribute_statistic(&plan.record, &self.target_features)
                .await
                .map_err(write_failure)?;
        }
        Ok(output)
    }

    async fn save_checkpoint(&self) -> Result<()> {
        if let Some((path, checkpoint)) = &self.checkpoint {
            let mut checkpoint = checkpoint.lock().await;
            checkpoint.touch();
            checkpoint.save(path).await?;
            debug!("Checkpoint saved to {:?}", path);
        }
        Ok(())
    }

    async fn clear_checkpoint(&self) -> Result<()> {
        if let Some((path, _)) = &self.checkpoint {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed checkpoint {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntryHandler for RestoreHandler {
    async fn apply(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput> {
        let started = Instant::now();
        session.begin().await?;
        match self.apply_in_transaction(entry, session).await {
            Ok(output) => {
                session.commit().await?;
                self.metrics.record_entry(started.elapsed());
                Ok(output)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    debug!("Rollback after failed entry {}: {}", entry.ordinal, rollback);
                }
                Err(e)
            }
        }
    }

    async fn completed(&self, entry: &TocEntry) -> Result<()> {
        if let Some((path, checkpoint)) = &self.checkpoint {
            let mut checkpoint = checkpoint.lock().await;
            checkpoint.mark_completed(entry.ordinal);
            checkpoint.touch();
            checkpoint.save(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupEngine;
    use crate::config::{BackupOptions, ObjectSelection};
    use crate::database::MemoryDatabase;
    use crate::storage::{MemoryBackend, StorageBackendConfig};

    fn database_config(selection: ObjectSelection) -> DatabaseConfig {
        DatabaseConfig {
            url: "postgres://gpadmin@localhost:5432/test".to_string(),
            connect_timeout_secs: 5,
            selection,
        }
    }

    fn restore_config(options: RestoreOptions, selection: ObjectSelection) -> Config {
        Config {
            mode: Mode::Restore,
            backup_id: "b1".to_string(),
            source: None,
            target: Some(database_config(selection)),
            storage: StorageBackendConfig::Memory,
            backup: None,
            restore: Some(options),
        }
    }

    async fn backed_up() -> Arc<dyn StorageBackend> {
        let db = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        db.run(
            "CREATE TABLE public.a (id int);
             CREATE TABLE public.b (id int, a_id int);
             ALTER TABLE public.a ADD CONSTRAINT a_pk PRIMARY KEY (id)",
        )
        .unwrap();
        db.insert("public.a", vec![vec!["1"], vec!["2"]]).unwrap();
        db.insert("public.b", vec![vec!["10", "1"]]).unwrap();
        db.analyze("public.a").unwrap();

        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let config = Config {
            mode: Mode::Backup,
            backup_id: "b1".to_string(),
            source: Some(database_config(ObjectSelection::default())),
            target: None,
            storage: StorageBackendConfig::Memory,
            backup: Some(BackupOptions::default()),
            restore: None,
        };
        BackupEngine::with_collaborators(config, Arc::new(db), storage.clone())
            .unwrap()
            .run()
            .await
            .unwrap();
        storage
    }

    fn engine(storage: &Arc<dyn StorageBackend>, target: &MemoryDatabase, options: RestoreOptions) -> RestoreEngine {
        RestoreEngine::with_collaborators(
            restore_config(options, ObjectSelection::default()),
            Arc::new(target.clone()),
            storage.clone(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_restore_into_empty_target() {
        let storage = backed_up().await;
        let target = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());

        let report = engine(&storage, &target, RestoreOptions::default()).run().await.unwrap();
        assert!(report.is_success(), "{}", report);
        assert_eq!(target.row_count("public.a"), Some(2));
        assert_eq!(target.row_count("public.b"), Some(1));
        assert!(target.has_object(ObjectKind::Constraint, "public", "a_pk"));
        assert_eq!(target.tuple_statistic("public.a"), Some((2.0, 1)));
        assert_eq!(target.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let storage = backed_up().await;
        let target = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        let options = RestoreOptions {
            dry_run: true,
            ..Default::default()
        };

        let before = target.object_count();

        let report = engine(&storage, &target, options).run().await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.rows(), 3);
        assert_eq!(target.object_count(), before);
    }

    #[tokio::test]
    async fn test_failed_load_is_resumed_from_checkpoint() {
        let storage = backed_up().await;
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("restore.json");
        let target = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        target
            .run("CREATE TABLE public.a (id int); CREATE TABLE public.b (id int, a_id int)")
            .unwrap();
        target.fail_copy_in("public.b").unwrap();

        let options = RestoreOptions {
            checkpoint_state: Some(checkpoint.clone()),
            data_only: true,
            with_stats: false,
            ..Default::default()
        };

        let first = engine(&storage, &target, options.clone()).run().await.unwrap();
        assert_eq!(first.failed(), 1);
        assert_eq!(target.row_count("public.a"), Some(2));
        let saved = RestoreCheckpoint::load(&checkpoint).await.unwrap().unwrap();
        assert_eq!(saved.completed.len(), 1);

        // a second target with the same tables finishes only what is left
        let retry_target = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        retry_target
            .run("CREATE TABLE public.a (id int); CREATE TABLE public.b (id int, a_id int)")
            .unwrap();
        let second = engine(&storage, &retry_target, options).run().await.unwrap();
        assert!(second.is_success());
        assert_eq!(second.already_applied(), 1);
        assert_eq!(retry_target.row_count("public.a"), Some(0));
        assert_eq!(retry_target.row_count("public.b"), Some(1));
        assert!(!checkpoint.exists());
    }

    #[tokio::test]
    async fn test_wrong_mode_is_rejected() {
        let mut config = restore_config(RestoreOptions::default(), ObjectSelection::default());
        config.mode = Mode::Backup;
        config.source = Some(database_config(ObjectSelection::default()));
        let target = MemoryDatabase::new("gpdb-7.1.0".parse().unwrap());
        let result = RestoreEngine::with_collaborators(
            config,
            Arc::new(target),
            Arc::new(MemoryBackend::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
