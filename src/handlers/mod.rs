pub mod attachment;
pub mod blob;
pub mod package;

use axum::{
    body::{Body, Bytes},
    http::{header, StatusCode},
    response::Response,
};

use crate::error::{AppError, Result};

/// Build a download response carrying the file name in both the plain and
/// the RFC 5987 form of `Content-Disposition`
pub(crate) fn attachment_response(file_name: &str, content_type: &str, data: Bytes) -> Result<Response> {
    let fallback_name: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded_name = urlencoding::encode(file_name);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        )
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
