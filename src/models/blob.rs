use serde::Serialize;
use sqlx::FromRow;

/// Stored blob - one deduplicated byte sequence keyed by its content hash
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[sqlx(rename = "hash")]
    pub content_hash: String,
    #[sqlx(rename = "size")]
    pub size_bytes: i64,
    #[sqlx(rename = "ref_count")]
    pub reference_count: i64,
    pub created_at: String,
}

impl Blob {
    /// Whether the blob may still be served
    pub fn is_live(&self) -> bool {
        self.reference_count > 0
    }
}

/// Blob whose stored reference count disagrees with its metadata records
#[derive(Debug, Clone, FromRow, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefCountMismatch {
    pub content_hash: String,
    pub stored_count: i64,
    pub actual_count: i64,
}
