//! In-memory storage backend for testing.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::ops::Range;
use std::sync::Arc;

use super::StorageBackend;
use crate::error::StorageError;
use crate::{Error, Result};

/// In-memory storage backend using object_store
///
/// Nothing persists between runs. Clones share the same store, so a
/// backup written through one handle is visible to a restore through
/// another.
#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<InMemory>,
}

impl MemoryBackend {
    /// Create a new in-memory storage backend
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn map_err(op: &str, key: &str, e: object_store::Error) -> Error {
    match e {
        object_store::Error::NotFound { .. } => Error::Storage(StorageError::NotFound(key.to_string())),
        _ => Error::Storage(StorageError::Backend(format!("Memory {} failed: {}", op, e))),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), PutPayload::from_bytes(data))
            .await
            .map_err(|e| map_err("PUT", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self
            .store
            .get(&Path::from(key))
            .await
            .map_err(|e| map_err("GET", key, e))?;

        result
            .bytes()
            .await
            .map_err(|e| map_err("GET", key, e))
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        let range = range.start as usize..range.end as usize;
        self.store
            .get_range(&Path::from(key), range)
            .await
            .map_err(|e| map_err("GET range", key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix_path = Path::from(prefix);
        let mut keys = Vec::new();
        let mut stream = self.store.list(Some(&prefix_path));

        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| map_err("LIST", prefix, e))?;
            keys.push(meta.location.to_string());
        }

        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_err("HEAD", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store
            .delete(&Path::from(key))
            .await
            .map_err(|e| map_err("DELETE", key, e))
    }

    async fn size(&self, key: &str) -> Result<u64> {
        let meta = self
            .store
            .head(&Path::from(key))
            .await
            .map_err(|e| map_err("HEAD", key, e))?;
        Ok(meta.size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let backend = MemoryBackend::new();

        let key = "b1/metadata.sql";
        let data = Bytes::from("CREATE SCHEMA sales;");

        backend.put(key, data.clone()).await.unwrap();
        assert_eq!(backend.get(key).await.unwrap(), data);
        assert_eq!(backend.size(key).await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_get_range() {
        let backend = MemoryBackend::new();
        backend
            .put("b1/data/artifact-000000.dat", Bytes::from("0123456789"))
            .await
            .unwrap();

        let slice = backend
            .get_range("b1/data/artifact-000000.dat", 3..7)
            .await
            .unwrap();
        assert_eq!(slice, Bytes::from("3456"));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let backend = MemoryBackend::new();
        assert!(!backend.exists("nope").await.unwrap());
        let err = backend.get("nope").await.unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_and_shared_clone() {
        let backend = MemoryBackend::new();
        let other = backend.clone();

        backend.put("b1/manifest.json", Bytes::from("{}")).await.unwrap();
        backend
            .put("b1/data/artifact-000000.dat", Bytes::from("x"))
            .await
            .unwrap();
        backend.put("b2/manifest.json", Bytes::from("{}")).await.unwrap();

        assert_eq!(other.list("").await.unwrap().len(), 3);
        assert_eq!(other.list("b1").await.unwrap().len(), 2);

        other.delete("b2/manifest.json").await.unwrap();
        assert!(!backend.exists("b2/manifest.json").await.unwrap());
    }
}
