//! Backup manifest, restore checkpoint and run report structures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use crate::catalog::{ObjectKind, Oid};
use crate::config::{CompressionType, ObjectSelection};
use crate::storage::{manifest_key, StorageBackend};
use crate::toc::{DataRange, Phase, Toc, TocEntry};
use crate::version::{EngineVersion, StatisticsFeatures};
use crate::{Error, Result};

/// Current `manifest.json` format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Top-level backup manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,

    /// Unique backup identifier
    pub backup_id: String,

    /// Creation timestamp (epoch milliseconds)
    pub created_at: i64,

    /// Completion timestamp (epoch milliseconds), unset while running
    #[serde(default)]
    pub completed_at: Option<i64>,

    /// Source database, without credentials
    #[serde(default)]
    pub source: String,

    /// Engine the backup was taken from
    pub source_version: EngineVersion,

    /// Statistics layout of the source
    pub statistics_features: StatisticsFeatures,

    /// Compression applied to data chunks
    #[serde(default)]
    pub compression: CompressionType,

    #[serde(default)]
    pub metadata_only: bool,

    #[serde(default)]
    pub data_only: bool,

    #[serde(default)]
    pub with_stats: bool,

    /// Backup whose unchanged data chunks this one reuses
    #[serde(default)]
    pub base_backup: Option<String>,

    /// Filter the backup was taken with
    #[serde(default)]
    pub selection: ObjectSelection,

    /// Data artifacts written by this backup
    #[serde(default)]
    pub artifacts: Vec<ArtifactInfo>,

    /// Table of contents
    pub toc: Toc,
}

impl BackupManifest {
    /// Create a new manifest with an empty TOC
    pub fn new(backup_id: String, source_version: EngineVersion, features: StatisticsFeatures) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id,
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
            source: String::new(),
            source_version,
            statistics_features: features,
            compression: CompressionType::default(),
            metadata_only: false,
            data_only: false,
            with_stats: true,
            base_backup: None,
            selection: ObjectSelection::default(),
            artifacts: Vec::new(),
            toc: Toc::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Data entry of a relation, by source OID
    pub fn data_entry(&self, relation: Oid) -> Option<&TocEntry> {
        self.toc.phase(Phase::Data).find(|e| e.oid == relation)
    }

    /// Data chunk location of a relation
    pub fn data_range(&self, relation: Oid) -> Option<&DataRange> {
        self.data_entry(relation).and_then(|e| e.data.as_ref())
    }

    /// Total rows across all data chunks
    pub fn total_rows(&self) -> u64 {
        self.toc
            .phase(Phase::Data)
            .filter_map(|e| e.data.as_ref())
            .map(|d| d.rows)
            .sum()
    }

    /// Bytes written to this backup's own artifacts
    pub fn total_artifact_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size).sum()
    }

    /// Number of relations whose data lives in the base backup
    pub fn reused_chunks(&self) -> usize {
        let own: BTreeSet<&str> = self.artifacts.iter().map(|a| a.key.as_str()).collect();
        self.toc
            .phase(Phase::Data)
            .filter_map(|e| e.data.as_ref())
            .filter(|d| !own.contains(d.artifact.as_str()))
            .count()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_str(json)?;
        if manifest.format_version > MANIFEST_FORMAT_VERSION {
            return Err(Error::Manifest(format!(
                "Manifest format {} is newer than supported format {}",
                manifest.format_version, MANIFEST_FORMAT_VERSION
            )));
        }
        manifest.toc.validate()?;
        Ok(manifest)
    }

    /// Load a backup's manifest from storage.
    pub async fn load(storage: &dyn StorageBackend, backup_id: &str) -> Result<Self> {
        let key = manifest_key(backup_id);
        if !storage.exists(&key).await? {
            return Err(Error::BackupNotFound(backup_id.to_string()));
        }
        let data = storage.get(&key).await?;
        let json = std::str::from_utf8(&data)
            .map_err(|e| Error::Manifest(format!("Manifest is not UTF-8: {}", e)))?;
        Self::from_json(json)
    }

    pub async fn save(&self, storage: &dyn StorageBackend) -> Result<()> {
        let json = self.to_json()?;
        storage
            .put(&manifest_key(&self.backup_id), bytes::Bytes::from(json))
            .await
    }
}

/// One data artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    /// Storage key
    pub key: String,

    /// Size in bytes
    pub size: u64,

    /// Relation chunks stored in the artifact
    pub chunks: u32,
}

/// Restore checkpoint for resumable restores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCheckpoint {
    /// Backup ID being restored
    pub backup_id: String,

    /// Restore start time (epoch milliseconds)
    pub start_time: i64,

    /// Last checkpoint time (epoch milliseconds)
    pub last_checkpoint_time: i64,

    /// Ordinals applied successfully
    pub completed: BTreeSet<u32>,

    /// Restore configuration hash (to detect config changes)
    pub config_hash: String,
}

impl RestoreCheckpoint {
    /// Create a new checkpoint
    pub fn new(backup_id: String, config_hash: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            backup_id,
            start_time: now,
            last_checkpoint_time: now,
            completed: BTreeSet::new(),
            config_hash,
        }
    }

    pub fn mark_completed(&mut self, ordinal: u32) {
        self.completed.insert(ordinal);
    }

    pub fn is_completed(&self, ordinal: u32) -> bool {
        self.completed.contains(&ordinal)
    }

    /// Update checkpoint timestamp
    pub fn touch(&mut self) {
        self.last_checkpoint_time = chrono::Utc::now().timestamp_millis();
    }

    /// Read a checkpoint file, `None` if it does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the checkpoint through a temporary file.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Final state of one TOC entry in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Succeeded,
    /// Applied by an earlier run of a resumed restore
    AlreadyApplied,
    Skipped { reason: String },
    Failed { reason: String },
}

impl EntryOutcome {
    /// Whether dependents of this entry may run.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, EntryOutcome::Succeeded | EntryOutcome::AlreadyApplied)
    }
}

/// Per-entry line of a run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryReport {
    pub ordinal: u32,
    pub phase: Phase,
    pub kind: ObjectKind,
    pub name: String,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl EntryReport {
    pub fn new(entry: &TocEntry, outcome: EntryOutcome) -> Self {
        Self {
            ordinal: entry.ordinal,
            phase: entry.phase,
            kind: entry.kind,
            name: entry.object_ref().qualified_name(),
            outcome,
            rows: 0,
            duration_ms: 0,
            warnings: Vec::new(),
        }
    }
}

/// Structured report of a backup or restore run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub backup_id: String,

    /// Whether this was a dry-run
    #[serde(default)]
    pub dry_run: bool,

    /// Start time (epoch milliseconds)
    pub start_time: i64,

    /// End time (epoch milliseconds)
    pub end_time: i64,

    /// Duration in milliseconds
    pub duration_ms: u64,

    /// Entries in ordinal order
    pub entries: Vec<EntryReport>,

    /// Run-level warnings
    #[serde(default)]
    pub warnings: Vec<String>,

    /// Whether dispatch stopped on a shutdown signal
    #[serde(default)]
    pub cancelled: bool,
}

impl RunReport {
    pub fn new(backup_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            backup_id: backup_id.into(),
            dry_run: false,
            start_time: now,
            end_time: now,
            duration_ms: 0,
            entries: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
        }
    }

    /// Stamp the end time.
    pub fn finish(&mut self) {
        self.end_time = chrono::Utc::now().timestamp_millis();
        self.duration_ms = (self.end_time - self.start_time).max(0) as u64;
        self.entries.sort_by_key(|e| e.ordinal);
    }

    pub fn entry(&self, ordinal: u32) -> Option<&EntryReport> {
        self.entries.iter().find(|e| e.ordinal == ordinal)
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::Skipped { .. }))
    }

    pub fn already_applied(&self) -> usize {
        self.count(|o| matches!(o, EntryOutcome::AlreadyApplied))
    }

    /// Rows moved by data entries
    pub fn rows(&self) -> u64 {
        self.entries.iter().filter(|e| e.phase == Phase::Data).map(|e| e.rows).sum()
    }

    /// Every entry and run-level warning, in order
    pub fn all_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .cloned()
            .chain(self.entries.iter().flat_map(|e| e.warnings.iter().cloned()))
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0 && !self.cancelled
    }

    fn count(&self, pred: impl Fn(&EntryOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Run Report: {} ===", self.backup_id)?;
        if self.dry_run {
            writeln!(f, "Dry run: nothing was applied")?;
        }
        writeln!(f, "Duration: {:.2}s", self.duration_ms as f64 / 1000.0)?;
        writeln!(
            f,
            "Entries: {} succeeded, {} failed, {} skipped, {} already applied",
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.already_applied()
        )?;
        writeln!(f, "Rows: {}", self.rows())?;
        for entry in &self.entries {
            match &entry.outcome {
                EntryOutcome::Failed { reason } => {
                    writeln!(f, "  FAILED  [{}] {} {}: {}", entry.ordinal, entry.kind, entry.name, reason)?
                }
                EntryOutcome::Skipped { reason } => {
                    writeln!(f, "  SKIPPED [{}] {} {}: {}", entry.ordinal, entry.kind, entry.name, reason)?
                }
                _ => {}
            }
        }
        let warnings = self.all_warnings();
        if !warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in warnings {
                writeln!(f, "  {}", warning)?;
            }
        }
        if self.cancelled {
            writeln!(f, "Run was cancelled before completion")?;
        }
        Ok(())
    }
}
