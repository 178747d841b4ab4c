//! Storage backend trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;

use crate::Result;

/// Trait for storage backends holding backup sets
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write data to a key, replacing any previous object
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read data from a key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Read a byte range of an object
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes>;

    /// List keys with a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Get the size of an object
    async fn size(&self, key: &str) -> Result<u64>;
}
