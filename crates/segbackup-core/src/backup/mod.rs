//! Backup engine module.

pub mod engine;

pub use engine::BackupEngine;
