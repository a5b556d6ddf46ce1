use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use crate::storage::StorageProvider;

/// Local file system storage provider
///
/// Blobs are laid out as `{base}/{hash[0..2]}/{hash}`.
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            base_path: PathBuf::from(&config.local_path),
        }
    }

    fn get_full_path(&self, key: &str) -> Result<PathBuf> {
        if key.len() < 3 || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AppError::Storage(format!("Invalid blob key: {}", key)));
        }
        Ok(self.base_path.join(&key[..2]).join(key))
    }
}

#[async_trait]
impl StorageProvider for LocalStorage {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file, then rename into place
        let temp_path = full_path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(AppError::Storage(format!("Failed to store blob {}: {}", key, e)));
        }

        tracing::debug!("Saved blob to {:?}", full_path);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full_path = self.get_full_path(key)?;

        let data = fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Blob not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to read blob: {}", e))
            }
        })?;

        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                tracing::debug!("Deleted blob {:?}", full_path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Remove the fan-out directory once it is empty
        if let Some(dir) = full_path.parent() {
            if dir != self.base_path {
                if let Ok(mut entries) = fs::read_dir(dir).await {
                    if entries.next_entry().await?.is_none() {
                        let _ = fs::remove_dir(dir).await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.get_full_path(key)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_in(dir: &std::path::Path) -> LocalStorage {
        LocalStorage::new(&StorageConfig {
            local_path: dir.to_string_lossy().to_string(),
        })
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        let key = "ab12cd";

        storage.put(key, Bytes::from_static(b"hello")).await.unwrap();
        assert!(storage.exists(key).await.unwrap());
        assert!(dir.path().join("ab").join(key).exists());
        assert_eq!(storage.get(key).await.unwrap(), Bytes::from_static(b"hello"));

        storage.delete(key).await.unwrap();
        assert!(!storage.exists(key).await.unwrap());
        assert!(!dir.path().join("ab").exists());

        // Deleting again is fine
        storage.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        let err = storage.get("ffffff").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        assert!(storage.get("../etc/passwd").await.is_err());
        assert!(storage.put("a", Bytes::new()).await.is_err());
    }
}
