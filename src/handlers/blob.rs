use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};

use crate::error::{ApiResponse, Result};
use crate::handlers::attachment_response;
use crate::models::{Blob, PageQuery, PageResponse, RefCountMismatch};
use crate::services::{AttachmentService, BlobService};
use crate::AppState;

/// Download raw content by hash; the extension is optional and only used
/// when no metadata record names the content
/// GET /api/transformer/download/:hash_and_ext
pub async fn download(
    State(state): State<AppState>,
    Path(hash_and_ext): Path<String>,
) -> Result<Response> {
    let (hash, extension) = match hash_and_ext.split_once('.') {
        Some((hash, ext)) => (hash, Some(ext)),
        None => (hash_and_ext.as_str(), None),
    };

    let data = BlobService::get(&state.db, state.storage.as_ref(), hash).await?;
    let hash = hash.to_ascii_lowercase();

    let (file_name, content_type) = match AttachmentService::first_by_hash(&state.db, &hash).await? {
        Some(meta) => (meta.file_name(), meta.content_type),
        None => {
            let content_type = extension
                .and_then(|ext| mime_guess::from_ext(ext).first())
                .map(|m| m.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            (hash_and_ext.clone(), content_type)
        }
    };

    attachment_response(&file_name, &content_type, data)
}

/// List stored blobs with their reference counts
/// GET /api/transformer/files?offset=0&limit=20 (limit optional)
pub async fn list_blobs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<PageResponse<Blob>>>> {
    let blobs = BlobService::list(&state.db, page).await?;
    Ok(Json(ApiResponse::success(blobs)))
}

/// GET /api/transformer/consistency
pub async fn consistency(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<RefCountMismatch>>>> {
    let mismatches = BlobService::verify(&state.db).await?;
    Ok(Json(ApiResponse::success(mismatches)))
}
