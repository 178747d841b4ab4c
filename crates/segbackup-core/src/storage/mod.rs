//! Storage backend abstraction and implementations.
//!
//! A backup set is a flat key space under `{backup_id}/`:
//!
//! - `manifest.json`: header and table of contents
//! - `metadata.sql`: DDL addressed by TOC metadata ranges
//! - `data/artifact-NNNNNN.dat[.zst|.lz4]`: compressed table data chunks
//! - `statistics.json` / `statistics.sql`: planner statistics

mod backend;
mod config;
mod filesystem;
mod memory;

pub use backend::StorageBackend;
pub use config::StorageBackendConfig;
pub use filesystem::FilesystemBackend;
pub use memory::MemoryBackend;

use crate::Result;
use std::sync::Arc;

/// Create a storage backend from configuration.
pub fn create_backend(config: &StorageBackendConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageBackendConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemBackend::new(path.clone())))
        }
        StorageBackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

/// Storage key of a backup's manifest
pub fn manifest_key(backup_id: &str) -> String {
    format!("{}/manifest.json", backup_id)
}

/// Storage key of a backup's DDL artifact
pub fn metadata_key(backup_id: &str) -> String {
    format!("{}/metadata.sql", backup_id)
}

/// Storage key of a backup's statistics record file
pub fn statistics_key(backup_id: &str) -> String {
    format!("{}/statistics.json", backup_id)
}

/// Storage key of the human-readable statistics rendering
pub fn statistics_sql_key(backup_id: &str) -> String {
    format!("{}/statistics.sql", backup_id)
}

/// Storage key of the `index`-th data artifact
pub fn artifact_key(backup_id: &str, index: u32, extension: &str) -> String {
    format!("{}/data/artifact-{:06}.dat{}", backup_id, index, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_create_memory_backend() {
        let backend = create_backend(&StorageBackendConfig::Memory).unwrap();

        let key = manifest_key("b1");
        let data = Bytes::from("{}");
        backend.put(&key, data.clone()).await.unwrap();
        assert_eq!(backend.get(&key).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_create_filesystem_backend() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageBackendConfig::Filesystem {
            path: temp_dir.path().to_path_buf(),
        };
        let backend = create_backend(&config).unwrap();

        let key = metadata_key("b1");
        backend.put(&key, Bytes::from("CREATE SCHEMA s;")).await.unwrap();
        assert!(temp_dir.path().join("b1/metadata.sql").exists());
    }

    #[test]
    fn test_storage_config_from_url() {
        assert!(matches!(
            StorageBackendConfig::from_url("memory://").unwrap(),
            StorageBackendConfig::Memory
        ));
        match StorageBackendConfig::from_url("file:///var/backups").unwrap() {
            StorageBackendConfig::Filesystem { path } => {
                assert_eq!(path, std::path::PathBuf::from("/var/backups"));
            }
            _ => panic!("Expected Filesystem config"),
        }
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(artifact_key("b1", 7, ".zst"), "b1/data/artifact-000007.dat.zst");
        assert_eq!(statistics_key("b1"), "b1/statistics.json");
        assert_eq!(statistics_sql_key("b1"), "b1/statistics.sql");
    }
}
