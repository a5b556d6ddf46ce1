use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::attachment_response;
use crate::models::{AttachmentMetadata, IngestReport, PackageKind, PageQuery, PageResponse};
use crate::services::PackageService;
use crate::AppState;

/// Upload AASX packages
/// POST /api/transformer/aasx
pub async fn upload_aasx(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<Vec<IngestReport>>>> {
    let files = read_files(multipart).await?;

    let mut reports = Vec::with_capacity(files.len());
    for (file_name, data) in files {
        let report = PackageService::ingest_aasx(
            &state.db,
            state.storage.as_ref(),
            &state.config.download.base_url,
            &file_name,
            data,
            state.config.upload.max_unpacked_bytes,
        )
        .await?;
        reports.push(report);
    }

    Ok(Json(ApiResponse::success(reports)))
}

/// Upload JSON environment documents
/// POST /api/transformer/json
pub async fn upload_json(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<Vec<IngestReport>>>> {
    let files = read_files(multipart).await?;

    let mut reports = Vec::with_capacity(files.len());
    for (file_name, data) in files {
        let report = PackageService::ingest_json(
            &state.db,
            &state.config.download.base_url,
            &file_name,
            data,
        )
        .await?;
        reports.push(report);
    }

    Ok(Json(ApiResponse::success(reports)))
}

/// List uploaded package file names
/// GET /api/transformer/uploadedFileNames?offset=0&limit=20 (limit optional)
pub async fn list_file_names(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<PageResponse<String>>>> {
    let names = PackageService::list_file_names(&state.db, None, page).await?;
    Ok(Json(ApiResponse::success(names)))
}

/// List uploaded JSON environment file names
/// GET /api/transformer/uploadedJsonFileNames?offset=0&limit=20 (limit optional)
pub async fn list_json_file_names(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<ApiResponse<PageResponse<String>>>> {
    let names = PackageService::list_file_names(&state.db, Some(PackageKind::Json), page).await?;
    Ok(Json(ApiResponse::success(names)))
}

/// Delete a package file with every attachment it owns
/// DELETE /api/transformer/uploaded/:file_name
pub async fn delete_package(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Json<ApiResponse<usize>>> {
    let removed = PackageService::delete(
        &state.db,
        state.storage.as_ref(),
        state.config.gc.mode,
        &file_name,
    )
    .await?;
    Ok(Json(ApiResponse::success(removed)))
}

/// Download the derived environment of a package file
/// GET /api/transformer/download/environment/:file_name
pub async fn download_environment(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Response> {
    let environment = PackageService::environment(&state.db, &file_name).await?;
    let body = serde_json::to_vec_pretty(&environment)?;

    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(&file_name);
    attachment_response(&format!("{}.json", stem), "application/json", body.into())
}

/// Attachment metadata created by one package file
/// GET /api/transformer/attachment/fileMetas/package/:file_name
pub async fn package_attachments(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<impl IntoResponse> {
    let metas: Vec<AttachmentMetadata> = PackageService::attachments(&state.db, &file_name).await?;
    Ok(Json(ApiResponse::success(metas)))
}

/// Collect the uploaded files of a multipart body
async fn read_files(mut multipart: Multipart) -> Result<Vec<(String, Bytes)>> {
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to process multipart: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name != "files" && name != "file" {
            continue;
        }

        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
        let data = field.bytes().await.map_err(|e| {
            AppError::BadRequest(format!("Failed to read file {}: {}", file_name, e))
        })?;

        tracing::debug!("Received {} ({} bytes)", file_name, data.len());
        files.push((file_name, data));
    }

    if files.is_empty() {
        return Err(AppError::BadRequest("No file provided".to_string()));
    }
    Ok(files)
}
