//! Filesystem storage backend implementation.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::StorageBackend;
use crate::error::StorageError;
use crate::Result;

/// Filesystem-based storage backend
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    base_path: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend with the given base path
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Convert a storage key to a filesystem path, rejecting keys that
    /// would escape the base path.
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let normalized = Path::new(key.trim_start_matches('/'));
        if normalized
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(StorageError::InvalidPath(key.to_string()).into());
        }
        Ok(self.base_path.join(normalized))
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.base_path)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    async fn open(&self, key: &str) -> Result<(fs::File, PathBuf)> {
        let path = self.key_to_path(key)?;
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Backend(format!("Failed to open file {}: {}", path.display(), e))
            }
        })?;
        Ok((file, path))
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.key_to_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::Backend(format!("Failed to create directories: {}", e))
            })?;
        }

        // Write to a sibling temp file and rename so readers never see a
        // partially written manifest.
        let tmp = path.with_extension("partial");
        let mut file = fs::File::create(&tmp).await.map_err(|e| {
            StorageError::Backend(format!("Failed to create file {}: {}", tmp.display(), e))
        })?;

        file.write_all(&data).await.map_err(|e| {
            StorageError::Backend(format!("Failed to write to file {}: {}", tmp.display(), e))
        })?;

        file.flush().await.map_err(|e| {
            StorageError::Backend(format!("Failed to flush file {}: {}", tmp.display(), e))
        })?;
        drop(file);

        fs::rename(&tmp, &path).await.map_err(|e| {
            StorageError::Backend(format!("Failed to rename into {}: {}", path.display(), e))
        })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let (mut file, path) = self.open(key).await?;

        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(|e| {
            StorageError::Backend(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        Ok(Bytes::from(data))
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        let (mut file, path) = self.open(key).await?;
        let len = range.end.saturating_sub(range.start) as usize;

        file.seek(SeekFrom::Start(range.start)).await.map_err(|e| {
            StorageError::Backend(format!("Failed to seek in {}: {}", path.display(), e))
        })?;

        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await.map_err(|e| {
            StorageError::Backend(format!(
                "Failed to read {} bytes at {} from {}: {}",
                len,
                range.start,
                path.display(),
                e
            ))
        })?;

        Ok(Bytes::from(data))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.key_to_path(prefix)?;
        let mut results = Vec::new();

        if !base.exists() {
            return Ok(results);
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            if dir.is_file() {
                if let Some(key) = self.path_to_key(&dir) {
                    results.push(key);
                }
                continue;
            }

            let mut entries = fs::read_dir(&dir).await.map_err(|e| {
                StorageError::Backend(format!("Failed to read directory {}: {}", dir.display(), e))
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                StorageError::Backend(format!("Failed to read directory entry: {}", e))
            })? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "partial") {
                    continue;
                } else if let Some(key) = self.path_to_key(&path) {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_to_path(key)?.is_file())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;

        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Backend(format!("Failed to delete file {}: {}", path.display(), e))
            }
        })?;

        Ok(())
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let path = self.key_to_path(key)?;

        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Backend(format!(
                    "Failed to get metadata for {}: {}",
                    path.display(),
                    e
                ))
            }
        })?;

        Ok(metadata.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path().to_path_buf());

        let key = "b1/manifest.json";
        let data = Bytes::from("{\"backup_id\":\"b1\"}");

        backend.put(key, data.clone()).await.unwrap();
        assert_eq!(backend.get(key).await.unwrap(), data);
        assert!(backend.exists(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_range() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path().to_path_buf());

        backend
            .put("b1/data/artifact-000000.dat", Bytes::from("abcdefghij"))
            .await
            .unwrap();
        let slice = backend
            .get_range("b1/data/artifact-000000.dat", 2..5)
            .await
            .unwrap();
        assert_eq!(slice, Bytes::from("cde"));

        assert!(backend
            .get_range("b1/data/artifact-000000.dat", 8..20)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path().to_path_buf());

        let err = backend
            .put("../escape.txt", Bytes::from("x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Storage(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FilesystemBackend::new(temp_dir.path().to_path_buf());

        backend.put("b1/manifest.json", Bytes::from("{}")).await.unwrap();
        backend
            .put("b1/data/artifact-000000.dat.zst", Bytes::from("data"))
            .await
            .unwrap();
        backend.put("b2/manifest.json", Bytes::from("{}")).await.unwrap();

        assert_eq!(backend.list("").await.unwrap().len(), 3);
        assert_eq!(
            backend.list("b1").await.unwrap(),
            vec![
                "b1/data/artifact-000000.dat.zst".to_string(),
                "b1/manifest.json".to_string()
            ]
        );

        backend.delete("b2/manifest.json").await.unwrap();
        assert!(!backend.exists("b2/manifest.json").await.unwrap());
        assert_eq!(backend.size("b1/manifest.json").await.unwrap(), 2);
    }
}
