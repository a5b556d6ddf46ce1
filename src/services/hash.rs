use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

/// Length of a hex-encoded SHA-256 digest
pub const CONTENT_HASH_LEN: usize = 64;

/// Lower-case hex SHA-256 of the content
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash on the blocking pool so large payloads never stall the runtime
pub async fn content_hash_blocking(data: Bytes) -> Result<String> {
    tokio::task::spawn_blocking(move || content_hash(&data))
        .await
        .map_err(|e| AppError::Internal(format!("Hashing task failed: {}", e)))
}

pub fn is_content_hash(s: &str) -> bool {
    s.len() == CONTENT_HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validate a client-supplied hash, accepting upper-case hex
pub fn parse_content_hash(s: &str) -> Result<String> {
    let lower = s.to_ascii_lowercase();
    if is_content_hash(&lower) {
        Ok(lower)
    } else {
        Err(AppError::BadRequest(format!("Invalid content hash: {}", s)))
    }
}
