use bytes::Bytes;
use chrono::Utc;
use sqlx::SqliteConnection;

use crate::config::GcMode;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Blob, PageQuery, PageResponse, RefCountMismatch};
use crate::services::hash::{content_hash_blocking, parse_content_hash};
use crate::storage::StorageProvider;

/// Content-addressed blob store with reference counting
pub struct BlobService;

impl BlobService {
    /// Store content and take one reference on it
    ///
    /// Identical content collapses onto the existing blob, whose count is
    /// incremented instead. Returns the content hash either way.
    pub async fn put(db: &Database, storage: &dyn StorageProvider, data: Bytes) -> Result<String> {
        let hash = content_hash_blocking(data.clone()).await?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        let count = Self::store_in(&mut tx, storage, &hash, data).await?;
        tx.commit().await?;

        tracing::debug!("Blob {} stored, ref_count={}", hash, count);
        Ok(hash)
    }

    /// Read the bytes of a live blob
    pub async fn get(db: &Database, storage: &dyn StorageProvider, hash: &str) -> Result<Bytes> {
        let hash = parse_content_hash(hash)?;
        let blob = Self::stat(db, &hash).await?;
        if !blob.is_live() {
            return Err(AppError::NotFound(format!("Blob not found: {}", hash)));
        }

        match storage.get(&hash).await {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => {
                // Erased between the row read and the byte read
                match Self::find(db, &hash).await? {
                    Some(blob) if blob.is_live() => Err(AppError::ConsistencyViolation(format!(
                        "Blob {} is referenced but its bytes are missing",
                        hash
                    ))),
                    _ => Err(AppError::NotFound(format!("Blob not found: {}", hash))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Get the blob row, live or not
    pub async fn stat(db: &Database, hash: &str) -> Result<Blob> {
        Self::find(db, hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Blob not found: {}", hash)))
    }

    async fn find(db: &Database, hash: &str) -> Result<Option<Blob>> {
        let blob: Option<Blob> = sqlx::query_as("SELECT * FROM blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(db.pool())
            .await?;
        Ok(blob)
    }

    /// Take one more reference on an existing live blob
    pub async fn increment_ref(db: &Database, hash: &str) -> Result<i64> {
        let hash = parse_content_hash(hash)?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        let count = Self::retain_in(&mut tx, &hash).await?;
        tx.commit().await?;

        Ok(count)
    }

    /// Drop one reference, erasing the blob at zero when collection is eager
    pub async fn decrement_ref(
        db: &Database,
        storage: &dyn StorageProvider,
        gc_mode: GcMode,
        hash: &str,
    ) -> Result<i64> {
        let hash = parse_content_hash(hash)?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        let count = Self::release_in(&mut tx, &hash).await?;
        let erase = count == 0 && gc_mode == GcMode::Eager;
        if erase {
            Self::erase_row_in(&mut tx, &hash).await?;
        }
        tx.commit().await?;

        if erase {
            Self::erase_bytes(storage, std::slice::from_ref(&hash)).await;
        }
        Ok(count)
    }

    /// List blobs in creation order
    pub async fn list(db: &Database, page: PageQuery) -> Result<PageResponse<Blob>> {
        let mut tx = db.pool().begin().await?;

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(&mut *tx)
            .await?;

        let items: Vec<Blob> = sqlx::query_as(
            "SELECT * FROM blobs ORDER BY created_at ASC, hash ASC LIMIT ? OFFSET ?",
        )
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PageResponse::new(items, total.0))
    }

    /// Erase every zero-reference blob; returns how many were erased
    pub async fn sweep(db: &Database, storage: &dyn StorageProvider) -> Result<usize> {
        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;

        let erased: Vec<(String,)> =
            sqlx::query_as("DELETE FROM blobs WHERE ref_count = 0 RETURNING hash")
                .fetch_all(&mut *tx)
                .await?;
        tx.commit().await?;

        let hashes: Vec<String> = erased.into_iter().map(|(h,)| h).collect();
        Self::erase_bytes(storage, &hashes).await;

        if !hashes.is_empty() {
            tracing::info!("GC sweep erased {} blob(s)", hashes.len());
        }
        Ok(hashes.len())
    }

    /// Blobs whose stored count disagrees with their metadata records,
    /// including hashes referenced by metadata but missing from the store
    pub async fn verify(db: &Database) -> Result<Vec<RefCountMismatch>> {
        let mismatches: Vec<RefCountMismatch> = sqlx::query_as(
            r#"
            SELECT b.hash AS content_hash, b.ref_count AS stored_count, COUNT(m.seq) AS actual_count
            FROM blobs b
            LEFT JOIN attachment_meta m ON m.hash = b.hash
            GROUP BY b.hash, b.ref_count
            HAVING b.ref_count != COUNT(m.seq)
            UNION ALL
            SELECT m.hash AS content_hash, 0 AS stored_count, COUNT(*) AS actual_count
            FROM attachment_meta m
            LEFT JOIN blobs b ON b.hash = m.hash
            WHERE b.hash IS NULL
            GROUP BY m.hash
            ORDER BY content_hash
            "#,
        )
        .fetch_all(db.pool())
        .await?;

        for m in &mismatches {
            tracing::error!(
                "Reference count mismatch for {}: stored={}, actual={}",
                m.content_hash,
                m.stored_count,
                m.actual_count
            );
        }
        Ok(mismatches)
    }

    // ==================== Unit-of-work steps ====================
    // Callers hold the write gate and an open transaction.

    /// Write bytes if absent and take one reference; returns the new count
    pub(crate) async fn store_in(
        conn: &mut SqliteConnection,
        storage: &dyn StorageProvider,
        hash: &str,
        data: Bytes,
    ) -> Result<i64> {
        let size = data.len() as i64;
        if !storage.exists(hash).await? {
            storage.put(hash, data).await?;
        }

        let now = Utc::now().to_rfc3339();
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO blobs (hash, size, ref_count, created_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(hash) DO UPDATE SET ref_count = ref_count + 1
            RETURNING ref_count
            "#,
        )
        .bind(hash)
        .bind(size)
        .bind(&now)
        .fetch_one(&mut *conn)
        .await?;

        Ok(count)
    }

    /// Take one reference on a live blob without touching its bytes
    pub(crate) async fn retain_in(conn: &mut SqliteConnection, hash: &str) -> Result<i64> {
        let count: Option<(i64,)> = sqlx::query_as(
            "UPDATE blobs SET ref_count = ref_count + 1 WHERE hash = ? AND ref_count > 0 RETURNING ref_count",
        )
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        count
            .map(|(c,)| c)
            .ok_or_else(|| AppError::NotFound(format!("Blob not found: {}", hash)))
    }

    /// Drop one reference; returns the remaining count
    ///
    /// A count already at zero is a consistency violation and is left as is.
    pub(crate) async fn release_in(conn: &mut SqliteConnection, hash: &str) -> Result<i64> {
        let count: Option<(i64,)> = sqlx::query_as(
            "UPDATE blobs SET ref_count = ref_count - 1 WHERE hash = ? AND ref_count > 0 RETURNING ref_count",
        )
        .bind(hash)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((c,)) = count {
            return Ok(c);
        }

        let exists: Option<(i64,)> = sqlx::query_as("SELECT ref_count FROM blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&mut *conn)
            .await?;

        match exists {
            Some(_) => Err(AppError::ConsistencyViolation(format!(
                "Reference count of blob {} is already zero",
                hash
            ))),
            None => Err(AppError::NotFound(format!("Blob not found: {}", hash))),
        }
    }

    /// Remove a zero-reference blob row; returns whether a row was removed
    pub(crate) async fn erase_row_in(conn: &mut SqliteConnection, hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE hash = ? AND ref_count = 0")
            .bind(hash)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove bytes whose rows are already gone
    ///
    /// Runs after commit; a failure leaves an unreferenced file that the next
    /// put of the same content overwrites.
    pub(crate) async fn erase_bytes(storage: &dyn StorageProvider, hashes: &[String]) {
        for hash in hashes {
            if let Err(e) = storage.delete(hash).await {
                tracing::warn!("Failed to erase bytes of blob {}: {}", hash, e);
            }
        }
    }
}
