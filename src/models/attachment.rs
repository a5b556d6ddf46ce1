use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::AppError;

/// Separator between the three segments of a serialized composite key
pub const KEY_SEPARATOR: &str = "::";

/// Address of one attachment: package id, sub-container id, local element id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub package_id: String,
    pub sub_container_id: String,
    pub local_element_id: String,
}

impl CompositeKey {
    /// Build a key, rejecting segments that would not survive serialization
    pub fn new(
        package_id: impl Into<String>,
        sub_container_id: impl Into<String>,
        local_element_id: impl Into<String>,
    ) -> Result<Self, AppError> {
        let key = Self {
            package_id: package_id.into(),
            sub_container_id: sub_container_id.into(),
            local_element_id: local_element_id.into(),
        };
        for segment in key.segments() {
            validate_segment(segment)?;
        }
        Ok(key)
    }

    fn segments(&self) -> [&str; 3] {
        [
            &self.package_id,
            &self.sub_container_id,
            &self.local_element_id,
        ]
    }
}

fn validate_segment(segment: &str) -> Result<(), AppError> {
    if segment.is_empty() {
        return Err(AppError::BadRequest(
            "Composite key segments must not be empty".to_string(),
        ));
    }
    if segment.contains(KEY_SEPARATOR) {
        return Err(AppError::BadRequest(format!(
            "Composite key segment must not contain '{}': {}",
            KEY_SEPARATOR, segment
        )));
    }
    // A boundary ':' merges with the separator and shifts the split
    if segment.starts_with(':') || segment.ends_with(':') {
        return Err(AppError::BadRequest(format!(
            "Composite key segment must not start or end with ':': {}",
            segment
        )));
    }
    Ok(())
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.package_id,
            self.sub_container_id,
            self.local_element_id,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for CompositeKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        match parts.as_slice() {
            [package_id, sub_container_id, local_element_id] => {
                Self::new(*package_id, *sub_container_id, *local_element_id)
            }
            _ => Err(AppError::BadRequest(format!(
                "Composite key must have exactly three '{}'-separated segments: {}",
                KEY_SEPARATOR, s
            ))),
        }
    }
}

/// Attachment metadata record
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMetadata {
    pub package_id: String,
    pub sub_container_id: String,
    pub local_element_id: String,
    pub name: String,
    pub extension: String,
    pub content_type: String,
    #[sqlx(rename = "hash")]
    pub content_hash: String,
    pub package_file: Option<String>,
    pub created_at: String,
}

impl AttachmentMetadata {
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            package_id: self.package_id.clone(),
            sub_container_id: self.sub_container_id.clone(),
            local_element_id: self.local_element_id.clone(),
        }
    }

    /// File name the attachment is served under
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.extension)
    }
}

/// Descriptive fields of an attachment about to be indexed
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub key: CompositeKey,
    pub name: String,
    pub extension: String,
    pub content_type: String,
    pub package_file: Option<String>,
}

impl NewAttachment {
    /// Split a file name into display name and extension at the last dot
    pub fn split_file_name(file_name: &str) -> (String, String) {
        match file_name.rfind('.') {
            Some(dot) if dot > 0 => (
                file_name[..dot].to_string(),
                file_name[dot..].to_string(),
            ),
            _ => (file_name.to_string(), String::new()),
        }
    }
}

/// Attachment metadata list query
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentQuery {
    pub package_id: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

/// Delete-by-key query
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeKeyQuery {
    pub composite_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_display() {
        let key = CompositeKey::new(
            "https://example.com/ids/aas/1",
            "urn:submodel:docs",
            "Manual",
        )
        .unwrap();
        let text = key.to_string();
        assert_eq!(
            text,
            "https://example.com/ids/aas/1::urn:submodel:docs::Manual"
        );
        assert_eq!(text.parse::<CompositeKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_wrong_segment_count() {
        assert!("a::b".parse::<CompositeKey>().is_err());
        assert!("a::b::c::d".parse::<CompositeKey>().is_err());
        assert!("".parse::<CompositeKey>().is_err());
    }

    #[test]
    fn parse_rejects_empty_segment() {
        let err = "a::::c".parse::<CompositeKey>().unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn new_rejects_separator_inside_segment() {
        assert!(CompositeKey::new("a::x", "b", "c").is_err());
        assert!(CompositeKey::new("urn:a:b", "b", "c").is_ok());
    }

    #[test]
    fn new_rejects_colon_at_segment_boundary() {
        assert!(CompositeKey::new("urn:aas:", "urn:sm:1", "Doc").is_err());
        assert!(CompositeKey::new("urn:aas", ":urn:sm:1", "Doc").is_err());
        assert!(CompositeKey::new("urn:aas", "urn:sm:1", "Doc:").is_err());

        // What used to be produced from a trailing ':' now fails to parse
        assert!("urn:aas:::urn:sm:1::Doc".parse::<CompositeKey>().is_err());
    }

    #[test]
    fn accepted_keys_survive_display_and_parse() {
        let key = CompositeKey::new("urn:aas:1:0", "https://x.org/sm:1", "Doc").unwrap();
        assert_eq!(key.to_string().parse::<CompositeKey>().unwrap(), key);
    }

    #[test]
    fn split_file_name_at_last_dot() {
        assert_eq!(
            NewAttachment::split_file_name("manual.v2.pdf"),
            ("manual.v2".to_string(), ".pdf".to_string())
        );
        assert_eq!(
            NewAttachment::split_file_name("README"),
            ("README".to_string(), String::new())
        );
        assert_eq!(
            NewAttachment::split_file_name(".hidden"),
            (".hidden".to_string(), String::new())
        );
    }
}
