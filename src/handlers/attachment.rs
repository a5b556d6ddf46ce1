use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::error::{ApiResponse, Result};
use crate::models::{
    AttachmentMetadata, AttachmentQuery, CompositeKey, CompositeKeyQuery, PageQuery, PageResponse,
};
use crate::services::AttachmentService;
use crate::AppState;

/// List attachment metadata, optionally for one package
/// GET /api/transformer/file-metas?packageId=xxx&offset=0&limit=20 (limit optional)
pub async fn list_file_metas(
    State(state): State<AppState>,
    Query(query): Query<AttachmentQuery>,
) -> Result<Json<ApiResponse<PageResponse<AttachmentMetadata>>>> {
    let page = PageQuery {
        offset: query.offset,
        limit: query.limit,
    };

    let metas = match query.package_id.as_deref() {
        Some(package_id) => AttachmentService::list_by_package(&state.db, package_id, page).await?,
        None => AttachmentService::list_all(&state.db, page).await?,
    };
    Ok(Json(ApiResponse::success(metas)))
}

/// GET /api/transformer/file-metas/:composite_key
pub async fn get_file_meta(
    State(state): State<AppState>,
    Path(composite_key): Path<String>,
) -> Result<Json<ApiResponse<AttachmentMetadata>>> {
    let key: CompositeKey = composite_key.parse()?;
    let meta = AttachmentService::get(&state.db, &key).await?;
    Ok(Json(ApiResponse::success(meta)))
}

/// Delete one attachment record and release its content
/// DELETE /api/transformer/delete/file?compositeKey=a::b::c
pub async fn delete_file_meta(
    State(state): State<AppState>,
    Query(query): Query<CompositeKeyQuery>,
) -> Result<Json<ApiResponse<()>>> {
    let key: CompositeKey = query.composite_key.parse()?;
    AttachmentService::delete(&state.db, state.storage.as_ref(), state.config.gc.mode, &key)
        .await?;
    Ok(Json(ApiResponse::<()>::success_message("Attachment deleted")))
}
