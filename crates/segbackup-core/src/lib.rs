//! segbackup core library
//!
//! Parallel backup and restore of segment-based MPP databases. A backup
//! captures catalog metadata, table data and planner statistics under one
//! exported snapshot and orders everything into a table of contents; a
//! restore replays that table of contents, phase by phase, into a target
//! database.

pub mod artifact;
pub mod backup;
pub mod catalog;
pub mod compression;
pub mod config;
pub mod database;
pub mod error;
pub mod executor;
pub mod filter;
pub mod manifest;
pub mod metrics;
pub mod resolver;
pub mod restore;
pub mod snapshot;
pub mod statistics;
pub mod storage;
pub mod toc;
pub mod version;

pub use backup::BackupEngine;
pub use catalog::{CatalogEntity, CatalogLoader, CatalogObject, ObjectKind, ObjectRef, Oid, Relation};
pub use config::{BackupOptions, CompressionType, Config, Mode, ObjectSelection, RestoreOptions};
pub use database::{Database, MemoryDatabase, PostgresDatabase, Session};
pub use error::{Error, Result};
pub use executor::{EntryHandler, EntryOutput, ParallelExecutor, PhaseConcurrency, SessionPool};
pub use manifest::{BackupManifest, EntryOutcome, EntryReport, RestoreCheckpoint, RunReport};
pub use metrics::{MetricsReport, PerformanceMetrics};
pub use restore::RestoreEngine;
pub use snapshot::{LockMode, SnapshotHandle, SnapshotManager};
pub use statistics::{AttributeStatistic, StatisticsFile, TupleStatistic};
pub use storage::StorageBackend;
pub use toc::{Phase, Toc, TocBuilder, TocEntry};
pub use version::{EngineVersion, StatisticsFeatures};
