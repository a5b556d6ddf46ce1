use bytes::Bytes;
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::config::GcMode;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{AttachmentMetadata, CompositeKey, NewAttachment, PageQuery, PageResponse};
use crate::services::hash::{content_hash_blocking, parse_content_hash};
use crate::services::BlobService;
use crate::storage::StorageProvider;

/// Composite-key attachment metadata store
pub struct AttachmentService;

impl AttachmentService {
    /// Get the metadata record addressed by a composite key
    pub async fn get(db: &Database, key: &CompositeKey) -> Result<AttachmentMetadata> {
        let meta: AttachmentMetadata = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE package_id = ? AND sub_container_id = ? AND local_element_id = ?",
        )
        .bind(&key.package_id)
        .bind(&key.sub_container_id)
        .bind(&key.local_element_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Attachment not found: {}", key)))?;

        Ok(meta)
    }

    /// List the records of one package in insertion order
    pub async fn list_by_package(
        db: &Database,
        package_id: &str,
        page: PageQuery,
    ) -> Result<PageResponse<AttachmentMetadata>> {
        // Count and page come from the same read snapshot
        let mut tx = db.pool().begin().await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM attachment_meta WHERE package_id = ?")
                .bind(package_id)
                .fetch_one(&mut *tx)
                .await?;

        let items: Vec<AttachmentMetadata> = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE package_id = ? ORDER BY seq ASC LIMIT ? OFFSET ?",
        )
        .bind(package_id)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PageResponse::new(items, total.0))
    }

    /// List every record in insertion order
    pub async fn list_all(db: &Database, page: PageQuery) -> Result<PageResponse<AttachmentMetadata>> {
        let mut tx = db.pool().begin().await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM attachment_meta")
            .fetch_one(&mut *tx)
            .await?;

        let items: Vec<AttachmentMetadata> =
            sqlx::query_as("SELECT * FROM attachment_meta ORDER BY seq ASC LIMIT ? OFFSET ?")
                .bind(page.limit())
                .bind(page.offset())
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(PageResponse::new(items, total.0))
    }

    /// Records created by the ingestion of one package file
    pub async fn list_by_package_file(
        db: &Database,
        file_name: &str,
    ) -> Result<Vec<AttachmentMetadata>> {
        let items: Vec<AttachmentMetadata> = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE package_file = ? ORDER BY seq ASC",
        )
        .bind(file_name)
        .fetch_all(db.pool())
        .await?;

        Ok(items)
    }

    /// Oldest record pointing at a hash, used to name downloads
    pub async fn first_by_hash(db: &Database, hash: &str) -> Result<Option<AttachmentMetadata>> {
        let mut conn = db.pool().acquire().await?;
        Self::first_by_hash_in(&mut conn, hash).await
    }

    /// Index an attachment together with its bytes
    ///
    /// Fails with `Conflict` when the key is already indexed; the blob store
    /// is left untouched in that case.
    pub async fn create(
        db: &Database,
        storage: &dyn StorageProvider,
        new: NewAttachment,
        data: Bytes,
    ) -> Result<AttachmentMetadata> {
        let hash = content_hash_blocking(data.clone()).await?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        Self::ensure_absent_in(&mut tx, &new.key).await?;
        BlobService::store_in(&mut tx, storage, &hash, data).await?;
        let meta = Self::insert_in(&mut tx, &new, &hash).await?;
        tx.commit().await?;

        tracing::info!("Attachment {} indexed -> {}", new.key, hash);
        Ok(meta)
    }

    /// Index an attachment pointing at content that is already stored
    pub async fn create_for_existing(
        db: &Database,
        new: NewAttachment,
        hash: &str,
    ) -> Result<AttachmentMetadata> {
        let hash = parse_content_hash(hash)?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        Self::ensure_absent_in(&mut tx, &new.key).await?;
        BlobService::retain_in(&mut tx, &hash).await?;
        let meta = Self::insert_in(&mut tx, &new, &hash).await?;
        tx.commit().await?;

        tracing::info!("Attachment {} indexed -> existing {}", new.key, hash);
        Ok(meta)
    }

    /// Delete a record and release its blob reference as one unit
    pub async fn delete(
        db: &Database,
        storage: &dyn StorageProvider,
        gc_mode: GcMode,
        key: &CompositeKey,
    ) -> Result<()> {
        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;

        let (hash, remaining) = Self::remove_in(&mut tx, key).await?;
        let erase = remaining == 0 && gc_mode == GcMode::Eager;
        if erase {
            BlobService::erase_row_in(&mut tx, &hash).await?;
        }
        tx.commit().await?;

        if erase {
            BlobService::erase_bytes(storage, std::slice::from_ref(&hash)).await;
        }

        tracing::info!(
            "Attachment {} deleted, blob {} ref_count={}",
            key,
            hash,
            remaining
        );
        Ok(())
    }

    // ==================== Unit-of-work steps ====================

    pub(crate) async fn find_in(
        conn: &mut SqliteConnection,
        key: &CompositeKey,
    ) -> Result<Option<AttachmentMetadata>> {
        let meta: Option<AttachmentMetadata> = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE package_id = ? AND sub_container_id = ? AND local_element_id = ?",
        )
        .bind(&key.package_id)
        .bind(&key.sub_container_id)
        .bind(&key.local_element_id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(meta)
    }

    pub(crate) async fn first_by_hash_in(
        conn: &mut SqliteConnection,
        hash: &str,
    ) -> Result<Option<AttachmentMetadata>> {
        let meta: Option<AttachmentMetadata> = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE hash = ? ORDER BY seq ASC LIMIT 1",
        )
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(meta)
    }

    async fn ensure_absent_in(conn: &mut SqliteConnection, key: &CompositeKey) -> Result<()> {
        if Self::find_in(conn, key).await?.is_some() {
            return Err(AppError::Conflict(format!(
                "Attachment already exists: {}",
                key
            )));
        }
        Ok(())
    }

    /// Insert a metadata row; the caller has already taken the blob reference
    pub(crate) async fn insert_in(
        conn: &mut SqliteConnection,
        new: &NewAttachment,
        hash: &str,
    ) -> Result<AttachmentMetadata> {
        let now = Utc::now().to_rfc3339();

        let meta: AttachmentMetadata = sqlx::query_as(
            r#"
            INSERT INTO attachment_meta
                (package_id, sub_container_id, local_element_id, name, extension, content_type, hash, package_file, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&new.key.package_id)
        .bind(&new.key.sub_container_id)
        .bind(&new.key.local_element_id)
        .bind(&new.name)
        .bind(&new.extension)
        .bind(&new.content_type)
        .bind(hash)
        .bind(&new.package_file)
        .bind(&now)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(format!("Attachment already exists: {}", new.key))
            }
            other => AppError::Database(other),
        })?;

        Ok(meta)
    }

    /// Remove a metadata row and release its blob; returns (hash, remaining)
    pub(crate) async fn remove_in(
        conn: &mut SqliteConnection,
        key: &CompositeKey,
    ) -> Result<(String, i64)> {
        let removed: Option<(String,)> = sqlx::query_as(
            "DELETE FROM attachment_meta WHERE package_id = ? AND sub_container_id = ? AND local_element_id = ? RETURNING hash",
        )
        .bind(&key.package_id)
        .bind(&key.sub_container_id)
        .bind(&key.local_element_id)
        .fetch_optional(&mut *conn)
        .await?;

        let (hash,) =
            removed.ok_or_else(|| AppError::NotFound(format!("Attachment not found: {}", key)))?;

        let remaining = BlobService::release_in(conn, &hash).await.map_err(|e| match e {
            AppError::NotFound(_) => AppError::ConsistencyViolation(format!(
                "Attachment {} points to missing blob {}",
                key, hash
            )),
            other => other,
        })?;

        Ok((hash, remaining))
    }
}
