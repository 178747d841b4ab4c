//! Backup engine orchestration.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactWriter;
use crate::catalog::{CatalogLoader, ModificationState, Oid, Relation};
use crate::compression::Codec;
use crate::config::{BackupOptions, Config, DatabaseConfig, Mode};
use crate::database::{Database, PostgresDatabase, Session};
use crate::executor::{EntryHandler, EntryOutput, ParallelExecutor, PhaseConcurrency, SessionPool};
use crate::manifest::{ArtifactInfo, BackupManifest, EntryOutcome, EntryReport, RunReport};
use crate::metrics::PerformanceMetrics;
use crate::resolver::{resolve, ResolveOptions};
use crate::snapshot::{SnapshotHandle, SnapshotManager};
use crate::statistics::StatisticsFile;
use crate::storage::{create_backend, statistics_key, statistics_sql_key, metadata_key, StorageBackend};
use crate::toc::{DataRange, Phase, Toc, TocBuilder, TocEntry};
use crate::version::{EngineVersion, StatisticsFeatures};
use crate::{Error, Result};

/// Backup engine for capturing a database into a backup set
pub struct BackupEngine {
    config: Config,
    options: BackupOptions,
    database: Arc<dyn Database>,
    storage: Arc<dyn StorageBackend>,
    metrics: Arc<PerformanceMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Everything captured while the consistent view was held
struct Capture {
    toc: Toc,
    metadata: Bytes,
    artifacts: Vec<ArtifactInfo>,
    statistics: Option<StatisticsFile>,
    report: RunReport,
}

impl BackupEngine {
    /// Create a backup engine connecting to the configured source.
    pub fn new(config: Config) -> Result<Self> {
        let source = source_config(&config)?;
        let database = Arc::new(PostgresDatabase::new(
            &source.url,
            Duration::from_secs(source.connect_timeout_secs),
        )?);
        let storage = create_backend(&config.storage)?;
        Self::with_collaborators(config, database, storage)
    }

    /// Create a backup engine over explicit database and storage collaborators.
    pub fn with_collaborators(
        config: Config,
        database: Arc<dyn Database>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;

        if config.mode != Mode::Backup {
            return Err(Error::Config(
                "Configuration mode must be 'backup'".to_string(),
            ));
        }

        let options = config.backup.clone().unwrap_or_default();
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

    /// Run the backup process
    pub async fn run(&self) -> Result<RunReport> {
        let result = self.run_internal().await;
        if let Err(e) = &result {
            warn!("Backup {} failed: {}", self.config.backup_id, e);
            self.metrics.record_error();
        }
        result
    }

    async fn run_internal(&self) -> Result<RunReport> {
        let backup_id = &self.config.backup_id;
        let source = source_config(&self.config)?;
        info!("Starting backup {} of {}", backup_id, self.database.target());

        let mut control = self.database.connect().await?;
        let version = control.server_version().await?;
        let mut features = version.statistics_features();
        if let Some(slots) = self.options.statistic_slots {
            features = features.with_slot_count(slots);
        }
        debug!("Source is {} with {} statistic slots", version, features.slot_count);

        let base = self.load_base().await?;

        let relations = CatalogLoader::new(control.as_mut())
            .load_relations(&source.selection)
            .await?;
        if relations.is_empty() {
            warn!("No relations matched the selection");
        }

        let snapshots = SnapshotManager::new(self.options.lock_timeout());
        let lock_started = Instant::now();
        let handle = snapshots.acquire_consistent_view(control.as_mut(), &relations).await?;
        self.metrics.record_lock_wait(lock_started.elapsed());

        let captured = self
            .capture(control.as_mut(), &snapshots, &handle, &relations, version, features, base)
            .await;
        let capture = match captured {
            Ok(capture) => {
                snapshots.release(control.as_mut()).await?;
                capture
            }
            Err(e) => {
                if let Err(rollback) = control.rollback().await {
                    debug!("Rollback of control session failed: {}", rollback);
                }
                return Err(e);
            }
        };

        self.persist(capture, version, features).await
    }

    async fn load_base(&self) -> Result<Option<BackupManifest>> {
        let Some(incremental) = &self.options.incremental else {
            return Ok(None);
        };
        let base = BackupManifest::load(self.storage.as_ref(), &incremental.from_backup_id).await?;
        if !base.is_complete() {
            return Err(Error::Manifest(format!(
                "Base backup {} did not complete",
                incremental.from_backup_id
            )));
        }
        info!(
            "Incremental backup against {} ({} data entries)",
            base.backup_id,
            base.toc.count(Phase::Data)
        );
        Ok(Some(base))
    }

    #[allow(clippy::too_many_arguments)]
    async fn capture(
        &self,
        control: &mut dyn Session,
        snapshots: &SnapshotManager,
        handle: &SnapshotHandle,
        relations: &[Relation],
        version: EngineVersion,
        features: StatisticsFeatures,
        base: Option<BackupManifest>,
    ) -> Result<Capture> {
        let backup_id = &self.config.backup_id;
        let selection = &source_config(&self.config)?.selection;

        let mut loader = CatalogLoader::new(control);
        let objects = loader.load_objects(relations, selection).await?;

        let statistics = if self.options.with_stats {
            let mut file = StatisticsFile::new(version, features);
            file.attributes = loader
                .load_attribute_statistics(relations, &features)
                .await?
                .into_values()
                .flatten()
                .collect();
            file.tuples = loader.load_tuple_statistics(relations).await?.into_values().collect();
            Some(file)
        } else {
            None
        };
        let analyzed: BTreeSet<Oid> = statistics
            .as_ref()
            .map(|s| s.relations().into_iter().collect())
            .unwrap_or_default();

        let resolution = resolve(
            &objects,
            &analyzed,
            ResolveOptions {
                metadata: !self.options.data_only,
                data: !self.options.metadata_only,
                statistics: self.options.with_stats,
            },
        )?;
        if !resolution.deferred.is_empty() {
            info!(
                "Deferred {} constraints to break dependency cycles",
                resolution.deferred.len()
            );
        }

        let builder = TocBuilder::build(&resolution.steps);
        let metadata = builder.metadata_artifact();
        let data_entries = builder.data_entries();

        let codec = Codec::new(self.options.compression, self.options.compression_level);
        let handler = Arc::new(DumpHandler {
            writer: Mutex::new(Some(ArtifactWriter::new(
                Arc::clone(&self.storage),
                backup_id.clone(),
                codec,
                self.options.artifact_max_bytes,
            ))),
            builder: Mutex::new(builder),
            modifications: relations.iter().map(|r| (r.oid, r.modification.clone())).collect(),
            base,
            metrics: Arc::clone(&self.metrics),
        });

        let mut report = if data_entries.is_empty() {
            RunReport::new(backup_id.clone())
        } else {
            self.dump_data(snapshots, handle, &data_entries, Arc::clone(&handler))
                .await?
        };

        let artifacts = handler.finish_artifacts().await?;
        let handler = Arc::try_unwrap(handler)
            .map_err(|_| Error::Manifest("Data handler is still shared".to_string()))?;
        let toc = handler.builder.into_inner().finish();

        // Metadata and statistics entries are captured as soon as the
        // TOC is built.
        let dumped: HashSet<u32> = report.entries.iter().map(|e| e.ordinal).collect();
        for entry in toc.iter().filter(|e| !dumped.contains(&e.ordinal)) {
            report.entries.push(EntryReport::new(entry, EntryOutcome::Succeeded));
        }
        report.finish();

        Ok(Capture {
            toc,
            metadata,
            artifacts,
            statistics,
            report,
        })
    }

    async fn dump_data(
        &self,
        snapshots: &SnapshotManager,
        handle: &SnapshotHandle,
        entries: &[TocEntry],
        handler: Arc<DumpHandler>,
    ) -> Result<RunReport> {
        let workers = self.options.jobs.min(entries.len()).max(1);
        let mut pool = SessionPool::connect(self.database.as_ref(), workers).await?;
        for session in pool.sessions_mut() {
            snapshots.attach_worker(session.as_mut(), handle).await?;
        }
        info!("Dumping {} relations with {} workers", entries.len(), pool.size());

        let mut executor = ParallelExecutor::new(
            pool,
            PhaseConcurrency {
                metadata_jobs: workers,
                jobs: workers,
            },
        )
        .strict(self.options.strict)
        .with_shutdown(self.shutdown_receiver());

        let handler: Arc<dyn EntryHandler> = handler;
        let result = executor
            .run(&self.config.backup_id, entries, &HashSet::new(), handler)
            .await;

        for mut session in executor.into_pool().into_sessions() {
            if let Err(e) = session.commit().await {
                debug!("Closing worker transaction failed: {}", e);
            }
        }
        result
    }

    async fn persist(
        &self,
        capture: Capture,
        version: EngineVersion,
        features: StatisticsFeatures,
    ) -> Result<RunReport> {
        let backup_id = &self.config.backup_id;
        let Capture {
            toc,
            metadata,
            artifacts,
            statistics,
            mut report,
        } = capture;

        self.storage.put(&metadata_key(backup_id), metadata).await?;

        if let Some(statistics) = &statistics {
            let json = serde_json::to_string_pretty(statistics)?;
            self.storage
                .put(&statistics_key(backup_id), Bytes::from(json))
                .await?;
            self.storage
                .put(&statistics_sql_key(backup_id), Bytes::from(statistics.render_sql()))
                .await?;
        }

        let mut manifest = BackupManifest::new(backup_id.clone(), version, features);
        manifest.source = self.database.target();
        manifest.compression = self.options.compression;
        manifest.metadata_only = self.options.metadata_only;
        manifest.data_only = self.options.data_only;
        manifest.with_stats = self.options.with_stats;
        manifest.base_backup = self.options.incremental.as_ref().map(|i| i.from_backup_id.clone());
        manifest.selection = source_config(&self.config)?.selection.clone();
        manifest.artifacts = artifacts;
        manifest.toc = toc;

        if report.is_success() {
            manifest.completed_at = Some(chrono::Utc::now().timestamp_millis());
        } else {
            report
                .warnings
                .push(format!("Backup {} is incomplete", backup_id));
        }
        manifest.save(self.storage.as_ref()).await?;

        info!(
            "Backup {} finished: {} entries, {} rows, {} artifact bytes, {} reused chunks",
            backup_id,
            manifest.toc.len(),
            manifest.total_rows(),
            manifest.total_artifact_bytes(),
            manifest.reused_chunks()
        );

        if report.cancelled {
            return Err(Error::Cancelled);
        }
        Ok(report)
    }
}

fn source_config(config: &Config) -> Result<&DatabaseConfig> {
    config
        .source
        .as_ref()
        .ok_or_else(|| Error::Config("Source configuration required".to_string()))
}

/// Copies one relation's rows into the current artifact
struct DumpHandler {
    writer: Mutex<Option<ArtifactWriter>>,
    builder: Mutex<TocBuilder>,
    modifications: HashMap<Oid, Option<ModificationState>>,
    base: Option<BackupManifest>,
    metrics: Arc<PerformanceMetrics>,
}

impl DumpHandler {
    fn modification(&self, oid: Oid) -> Option<ModificationState> {
        self.modifications.get(&oid).cloned().flatten()
    }

    /// Data range of an unchanged relation in the base backup. Only
    /// append-optimized tables whose modcount and last DDL both match
    /// qualify; heap tables are always dumped again.
    fn reusable(&self, entry: &TocEntry) -> Option<DataRange> {
        let previous = self.base.as_ref()?.data_entry(entry.oid)?;
        if previous.schema != entry.schema || previous.name != entry.name {
            return None;
        }
        let range = previous.data.as_ref()?;
        let current = self.modification(entry.oid)?;
        (range.modification.as_ref() == Some(&current)).then(|| range.clone())
    }

    fn finished() -> Error {
        Error::Manifest("Artifact writer already finished".to_string())
    }

    async fn finish_artifacts(&self) -> Result<Vec<ArtifactInfo>> {
        match self.writer.lock().await.take() {
            Some(writer) => writer.finish().await,
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl EntryHandler for DumpHandler {
    async fn apply(&self, entry: &TocEntry, session: &mut dyn Session) -> Result<EntryOutput> {
        let started = Instant::now();

        if let Some(range) = self.reusable(entry) {
            debug!("Reusing unchanged data of {} from {}", entry.label(), range.artifact);
            let rows = range.rows;
            self.builder.lock().await.record_data_offset(entry.ordinal, range)?;
            self.metrics.record_reused_chunk();
            return Ok(EntryOutput::rows(rows));
        }

        let codec = self
            .writer
            .lock()
            .await
            .as_ref()
            .map(ArtifactWriter::codec)
            .ok_or_else(Self::finished)?;

        // Rows are compressed as they arrive; only the compressed chunk is held
        let mut encoder = codec.encoder()?;
        let mut rows = 0u64;
        {
            let mut stream = session.copy_out(&entry.object_ref()).await?;
            while let Some(piece) = stream.next().await {
                let piece = piece?;
                rows += piece.iter().filter(|b| **b == b'\n').count() as u64;
                encoder.write(&piece)?;
            }
        }
        let raw_bytes = encoder.input_bytes();
        let chunk = encoder.finish()?;

        let range = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or_else(Self::finished)?;
            writer
                .append_compressed(chunk, rows, self.modification(entry.oid))
                .await?
        };

        self.metrics.record_bytes(range.length, raw_bytes);
        self.metrics.record_rows(rows);
        self.builder.lock().await.record_data_offset(entry.ordinal, range)?;
        self.metrics.record_entry(started.elapsed());
        debug!("Dumped {} rows of {}", rows, entry.label());

        Ok(EntryOutput::rows(rows))
    }
}
