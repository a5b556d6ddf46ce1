use serde::Serialize;
use sqlx::FromRow;

use crate::models::AttachmentMetadata;

/// Kind of uploaded container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Aasx,
    Json,
}

impl PackageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageKind::Aasx => "aasx",
            PackageKind::Json => "json",
        }
    }

    /// File extension accepted for this kind
    pub fn extension(&self) -> &'static str {
        match self {
            PackageKind::Aasx => ".aasx",
            PackageKind::Json => ".json",
        }
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        file_name.to_lowercase().ends_with(self.extension())
    }
}

/// Uploaded package file
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFile {
    pub file_name: String,
    pub kind: String,
    #[sqlx(rename = "size")]
    pub size_bytes: i64,
    #[serde(skip)]
    pub environment: String,
    pub uploaded_at: String,
}

/// Outcome of ingesting one package file
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub file_name: String,
    pub kind: PackageKind,
    /// Records created by this ingestion
    pub attachments: Vec<AttachmentMetadata>,
    /// Composite keys that were already indexed and left untouched
    pub skipped: Vec<String>,
    /// Attachment paths whose content could not be resolved
    pub unresolved: Vec<String>,
    /// Environment with attachment paths rewritten to download URLs
    pub environment: serde_json::Value,
}
