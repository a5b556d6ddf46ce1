use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;

use crate::config::GcMode;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    AttachmentMetadata, IngestReport, NewAttachment, PackageFile, PackageKind, PageQuery,
    PageResponse,
};
use crate::services::aasx;
use crate::services::environment::{
    collect_file_references, download_url, is_external, normalize_path, parse_download_url,
    rewrite_file_paths, FileReference,
};
use crate::services::{AttachmentService, BlobService};
use crate::storage::StorageProvider;

/// Uploaded package files and their ingestion
pub struct PackageService;

impl PackageService {
    /// Ingest an AASX archive: store every referenced attachment and index it
    /// under its composite key, all in one unit of work
    pub async fn ingest_aasx(
        db: &Database,
        storage: &dyn StorageProvider,
        base_url: &str,
        file_name: &str,
        data: Bytes,
        max_unpacked_bytes: u64,
    ) -> Result<IngestReport> {
        Self::check_file_name(PackageKind::Aasx, file_name)?;
        let size = data.len() as i64;
        let package = aasx::extract_blocking(data, max_unpacked_bytes).await?;
        let mut environment = package.environment;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        Self::ensure_absent_in(&mut tx, file_name).await?;

        let mut attachments = Vec::new();
        let mut skipped = Vec::new();
        let mut urls = HashMap::new();

        for item in package.attachments {
            let reference = item.reference;
            if let Some(existing) = AttachmentService::find_in(&mut tx, &reference.key).await? {
                tracing::debug!("Attachment {} already indexed, skipping", reference.key);
                urls.insert(
                    normalize_path(&reference.path),
                    download_url(base_url, &existing.content_hash, &existing.extension),
                );
                skipped.push(reference.key.to_string());
                continue;
            }

            let new = new_attachment(&reference, file_name);
            BlobService::store_in(&mut tx, storage, &item.hash, item.data).await?;
            let meta = AttachmentService::insert_in(&mut tx, &new, &item.hash).await?;
            urls.insert(
                normalize_path(&reference.path),
                download_url(base_url, &meta.content_hash, &meta.extension),
            );
            attachments.push(meta);
        }

        let rewritten = rewrite_file_paths(&mut environment, &urls);
        Self::insert_in(&mut tx, file_name, PackageKind::Aasx, size, &environment).await?;
        tx.commit().await?;

        tracing::info!(
            "Package {} ingested: {} attachment(s) indexed, {} skipped, {} path(s) rewritten",
            file_name,
            attachments.len(),
            skipped.len(),
            rewritten
        );

        Ok(IngestReport {
            file_name: file_name.to_string(),
            kind: PackageKind::Aasx,
            attachments,
            skipped,
            unresolved: package.unresolved.into_iter().map(|r| r.path).collect(),
            environment,
        })
    }

    /// Ingest a JSON environment document
    ///
    /// A JSON document carries no bytes, so only `File` values that are
    /// download URLs of this service pointing at live content get indexed.
    pub async fn ingest_json(
        db: &Database,
        base_url: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<IngestReport> {
        Self::check_file_name(PackageKind::Json, file_name)?;
        let size = data.len() as i64;
        let environment: Value = serde_json::from_slice(&data)?;
        let references = collect_file_references(&environment)?;

        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;
        Self::ensure_absent_in(&mut tx, file_name).await?;

        let mut attachments = Vec::new();
        let mut skipped = Vec::new();
        let mut unresolved = Vec::new();

        for reference in references {
            let Some((hash, _)) = parse_download_url(base_url, &reference.path) else {
                if !is_external(&reference.path) {
                    unresolved.push(reference.path);
                }
                continue;
            };
            if AttachmentService::find_in(&mut tx, &reference.key).await?.is_some() {
                skipped.push(reference.key.to_string());
                continue;
            }

            match BlobService::retain_in(&mut tx, &hash).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    tracing::warn!("Attachment {} points at unknown content {}", reference.key, hash);
                    unresolved.push(reference.path);
                    continue;
                }
                Err(e) => return Err(e),
            }
            // A URL names only the hash; reuse the descriptive fields of a
            // record that already points at it
            let mut new = new_attachment(&reference, file_name);
            if let Some(known) = AttachmentService::first_by_hash_in(&mut tx, &hash).await? {
                new.name = known.name;
                new.extension = known.extension;
                if reference.content_type.is_none() {
                    new.content_type = known.content_type;
                }
            }
            attachments.push(AttachmentService::insert_in(&mut tx, &new, &hash).await?);
        }

        Self::insert_in(&mut tx, file_name, PackageKind::Json, size, &environment).await?;
        tx.commit().await?;

        tracing::info!(
            "Environment {} ingested: {} attachment(s) indexed, {} skipped",
            file_name,
            attachments.len(),
            skipped.len()
        );

        Ok(IngestReport {
            file_name: file_name.to_string(),
            kind: PackageKind::Json,
            attachments,
            skipped,
            unresolved,
            environment,
        })
    }

    /// Uploaded file names in upload order, optionally of one kind only
    pub async fn list_file_names(
        db: &Database,
        kind: Option<PackageKind>,
        page: PageQuery,
    ) -> Result<PageResponse<String>> {
        let kind = kind.map(|k| k.as_str());
        let mut tx = db.pool().begin().await?;

        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM package_files WHERE ? IS NULL OR kind = ?")
                .bind(kind)
                .bind(kind)
                .fetch_one(&mut *tx)
                .await?;

        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT file_name FROM package_files WHERE ? IS NULL OR kind = ? ORDER BY seq ASC LIMIT ? OFFSET ?",
        )
        .bind(kind)
        .bind(kind)
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PageResponse::new(
            names.into_iter().map(|(n,)| n).collect(),
            total.0,
        ))
    }

    pub async fn get(db: &Database, file_name: &str) -> Result<PackageFile> {
        sqlx::query_as("SELECT * FROM package_files WHERE file_name = ?")
            .bind(file_name)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Package file not found: {}", file_name)))
    }

    /// Derived environment with attachment paths rewritten to download URLs
    pub async fn environment(db: &Database, file_name: &str) -> Result<Value> {
        let package = Self::get(db, file_name).await?;
        Ok(serde_json::from_str(&package.environment)?)
    }

    /// Attachment records created by a package file
    pub async fn attachments(db: &Database, file_name: &str) -> Result<Vec<AttachmentMetadata>> {
        Self::get(db, file_name).await?;
        AttachmentService::list_by_package_file(db, file_name).await
    }

    /// Delete a package file and every attachment record it owns, releasing
    /// their blob references in the same unit; returns the records removed
    pub async fn delete(
        db: &Database,
        storage: &dyn StorageProvider,
        gc_mode: GcMode,
        file_name: &str,
    ) -> Result<usize> {
        let _gate = db.write_gate().await;
        let mut tx = db.pool().begin().await?;

        let removed = sqlx::query("DELETE FROM package_files WHERE file_name = ?")
            .bind(file_name)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Package file not found: {}",
                file_name
            )));
        }

        let owned: Vec<AttachmentMetadata> = sqlx::query_as(
            "SELECT * FROM attachment_meta WHERE package_file = ? ORDER BY seq ASC",
        )
        .bind(file_name)
        .fetch_all(&mut *tx)
        .await?;

        let mut released = BTreeSet::new();
        for meta in &owned {
            let (hash, remaining) = AttachmentService::remove_in(&mut tx, &meta.key()).await?;
            if remaining == 0 {
                released.insert(hash);
            }
        }

        let mut erased = Vec::new();
        if gc_mode == GcMode::Eager {
            for hash in released {
                if BlobService::erase_row_in(&mut tx, &hash).await? {
                    erased.push(hash);
                }
            }
        }
        tx.commit().await?;

        BlobService::erase_bytes(storage, &erased).await;

        tracing::info!(
            "Package {} deleted with {} attachment(s), {} blob(s) erased",
            file_name,
            owned.len(),
            erased.len()
        );
        Ok(owned.len())
    }

    // ==================== Helpers ====================

    fn check_file_name(kind: PackageKind, file_name: &str) -> Result<()> {
        if file_name.is_empty() || file_name.contains('/') || file_name.contains('\\') {
            return Err(AppError::BadRequest(format!(
                "Invalid package file name: {}",
                file_name
            )));
        }
        if !kind.accepts(file_name) {
            return Err(AppError::BadRequest(format!(
                "Expected a {} file: {}",
                kind.extension(),
                file_name
            )));
        }
        Ok(())
    }

    async fn ensure_absent_in(conn: &mut SqliteConnection, file_name: &str) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM package_files WHERE file_name = ?")
            .bind(file_name)
            .fetch_one(&mut *conn)
            .await?;

        if count.0 > 0 {
            return Err(AppError::Conflict(format!(
                "Package file already uploaded: {}",
                file_name
            )));
        }
        Ok(())
    }

    async fn insert_in(
        conn: &mut SqliteConnection,
        file_name: &str,
        kind: PackageKind,
        size: i64,
        environment: &Value,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO package_files (file_name, kind, size, environment, uploaded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(file_name)
        .bind(kind.as_str())
        .bind(size)
        .bind(serde_json::to_string(environment)?)
        .bind(&now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

/// Descriptive fields for a reference: name and extension from the last
/// path segment, content type from the element or the extension
fn new_attachment(reference: &FileReference, package_file: &str) -> NewAttachment {
    let base_name = reference
        .path
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let (name, extension) = NewAttachment::split_file_name(&base_name);
    let content_type = reference.content_type.clone().unwrap_or_else(|| {
        mime_guess::from_path(&base_name)
            .first_or_octet_stream()
            .to_string()
    });

    NewAttachment {
        key: reference.key.clone(),
        name,
        extension,
        content_type,
        package_file: Some(package_file.to_string()),
    }
}
