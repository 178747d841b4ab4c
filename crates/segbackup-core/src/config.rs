//! Configuration structures for backup and restore operations.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operation mode
    pub mode: Mode,

    /// Unique identifier for this backup
    pub backup_id: String,

    /// Source database configuration (for backup mode)
    #[serde(default)]
    pub source: Option<DatabaseConfig>,

    /// Target database configuration (for restore mode)
    #[serde(default)]
    pub target: Option<DatabaseConfig>,

    /// Storage configuration (Filesystem or Memory)
    pub storage: crate::storage::StorageBackendConfig,

    /// Backup-specific options
    #[serde(default)]
    pub backup: Option<BackupOptions>,

    /// Restore-specific options
    #[serde(default)]
    pub restore: Option<RestoreOptions>,
}

/// Operation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backup,
    Restore,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`postgres://user@coordinator:5432/dbname`)
    pub url: String,

    /// Connection timeout in seconds (default: 30)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Schemas and relations to include or exclude
    #[serde(default)]
    pub selection: ObjectSelection,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Schema and relation selection.
///
/// Patterns are globs (`*`, `?`) unless prefixed with `~`, in which case
/// the remainder is a regular expression. Relation patterns match against
/// `schema.name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSelection {
    /// Schemas to include (empty means all)
    #[serde(default)]
    pub include_schemas: Vec<String>,

    /// Schemas to exclude
    #[serde(default)]
    pub exclude_schemas: Vec<String>,

    /// Relations to include (empty means all)
    #[serde(default)]
    pub include_relations: Vec<String>,

    /// Relations to exclude
    #[serde(default)]
    pub exclude_relations: Vec<String>,
}

/// Backup-specific options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOptions {
    /// Number of parallel worker sessions (default: 4)
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Capture metadata only, no table data
    #[serde(default)]
    pub metadata_only: bool,

    /// Capture table data only, no DDL
    #[serde(default)]
    pub data_only: bool,

    /// Capture planner statistics (default: true)
    #[serde(default = "default_true")]
    pub with_stats: bool,

    /// Compression algorithm for data artifacts
    #[serde(default)]
    pub compression: CompressionType,

    /// Compression level (zstd: 1-22, default: 3)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Data artifact size after which a new artifact is started (default: 128MB)
    #[serde(default = "default_artifact_max_bytes")]
    pub artifact_max_bytes: u64,

    /// Bounded wait for each share lock in seconds (default: 60)
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Abort on the first data-phase failure
    #[serde(default)]
    pub strict: bool,

    /// Incremental backup against an earlier backup
    #[serde(default)]
    pub incremental: Option<IncrementalOptions>,

    /// Override the number of statistic slots captured per column
    #[serde(default)]
    pub statistic_slots: Option<usize>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            metadata_only: false,
            data_only: false,
            with_stats: true,
            compression: CompressionType::default(),
            compression_level: default_compression_level(),
            artifact_max_bytes: default_artifact_max_bytes(),
            lock_timeout_secs: default_lock_timeout_secs(),
            strict: false,
            incremental: None,
            statistic_slots: None,
        }
    }
}

impl BackupOptions {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Validate backup options
    pub fn validate(&self) -> crate::Result<()> {
        if self.jobs == 0 {
            return Err(crate::Error::Config("jobs must be > 0".to_string()));
        }

        if self.metadata_only && self.data_only {
            return Err(crate::Error::Config(
                "metadata_only and data_only are mutually exclusive".to_string(),
            ));
        }

        if self.compression == CompressionType::Zstd && !(1..=22).contains(&self.compression_level)
        {
            return Err(crate::Error::Config(format!(
                "zstd compression_level must be 1-22, got {}",
                self.compression_level
            )));
        }

        if self.artifact_max_bytes == 0 {
            return Err(crate::Error::Config(
                "artifact_max_bytes must be > 0".to_string(),
            ));
        }

        if self.lock_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "lock_timeout_secs must be > 0".to_string(),
            ));
        }

        if let Some(inc) = &self.incremental {
            if inc.from_backup_id.is_empty() {
                return Err(crate::Error::Config(
                    "incremental.from_backup_id must not be empty".to_string(),
                ));
            }
            if self.metadata_only {
                return Err(crate::Error::Config(
                    "incremental backup requires table data".to_string(),
                ));
            }
        }

        validate_slot_override(self.statistic_slots)
    }
}

/// Incremental backup options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalOptions {
    /// Backup whose unchanged table data is reused
    pub from_backup_id: String,
}

fn default_jobs() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3 // zstd default
}

fn default_artifact_max_bytes() -> u64 {
    128 * 1024 * 1024 // 128MB
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn validate_slot_override(slots: Option<usize>) -> crate::Result<()> {
    match slots {
        Some(n) if n == 0 || n > crate::statistics::MAX_STATISTIC_SLOTS => {
            Err(crate::Error::Config(format!(
                "statistic_slots must be 1-{}, got {}",
                crate::statistics::MAX_STATISTIC_SLOTS,
                n
            )))
        }
        _ => Ok(()),
    }
}

/// Compression type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
    Lz4,
}

/// Restore-specific options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    /// Parallel sessions for data, postdata and statistics (default: 4)
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Parallel sessions for predata DDL (default: 1)
    #[serde(default = "default_metadata_jobs")]
    pub metadata_jobs: usize,

    /// Reinstall planner statistics (default: true)
    #[serde(default = "default_true")]
    pub with_stats: bool,

    /// Replay DDL only
    #[serde(default)]
    pub metadata_only: bool,

    /// Load table data only (tables must already exist)
    #[serde(default)]
    pub data_only: bool,

    /// Abort on the first data-phase failure
    #[serde(default)]
    pub strict: bool,

    /// Bounded wait for each exclusive lock in seconds (default: 60)
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Dry-run mode - plan the restore without touching the target
    #[serde(default)]
    pub dry_run: bool,

    /// Checkpoint state file path for resumable restores
    #[serde(default)]
    pub checkpoint_state: Option<PathBuf>,

    /// Override the number of statistic slots the target accepts
    #[serde(default)]
    pub statistic_slots: Option<usize>,
}

fn default_metadata_jobs() -> usize {
    1
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            metadata_jobs: default_metadata_jobs(),
            with_stats: true,
            metadata_only: false,
            data_only: false,
            strict: false,
            lock_timeout_secs: default_lock_timeout_secs(),
            dry_run: false,
            checkpoint_state: None,
            statistic_slots: None,
        }
    }
}

impl RestoreOptions {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Validate restore options
    pub fn validate(&self) -> crate::Result<()> {
        if self.jobs == 0 {
            return Err(crate::Error::Config("jobs must be > 0".to_string()));
        }

        if self.metadata_jobs == 0 {
            return Err(crate::Error::Config(
                "metadata_jobs must be > 0".to_string(),
            ));
        }

        if self.metadata_only && self.data_only {
            return Err(crate::Error::Config(
                "metadata_only and data_only are mutually exclusive".to_string(),
            ));
        }

        if self.lock_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "lock_timeout_secs must be > 0".to_string(),
            ));
        }

        validate_slot_override(self.statistic_slots)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.backup_id.is_empty() || self.backup_id.contains('/') {
            return Err(crate::Error::Config(format!(
                "Invalid backup_id: '{}'",
                self.backup_id
            )));
        }

        match self.mode {
            Mode::Backup => {
                let source = self.source.as_ref().ok_or_else(|| {
                    crate::Error::Config(
                        "Source configuration is required for backup mode".to_string(),
                    )
                })?;
                source.selection.validate()?;

                if let Some(backup) = &self.backup {
                    backup.validate()?;
                }
            }
            Mode::Restore => {
                let target = self.target.as_ref().ok_or_else(|| {
                    crate::Error::Config(
                        "Target configuration is required for restore mode".to_string(),
                    )
                })?;
                target.selection.validate()?;

                if let Some(restore) = &self.restore {
                    restore.validate()?;
                }
            }
        }

        Ok(())
    }

    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(contents: &str) -> crate::Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }
}
