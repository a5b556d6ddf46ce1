use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Blob byte storage, addressed by content hash
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Store data under the given key, replacing any previous content
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Read data stored under the key
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Delete data stored under the key; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if data exists under the key
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
