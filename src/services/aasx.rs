use std::collections::HashMap;
use std::io::{Cursor, Read};

use bytes::Bytes;
use serde_json::Value;
use zip::read::ZipFile;
use zip::ZipArchive;

use crate::error::{AppError, Result};
use crate::services::environment::{
    collect_file_references, is_external, normalize_path, FileReference,
};
use crate::services::hash::content_hash;

/// Attachment read out of a package together with its content hash
#[derive(Debug, Clone)]
pub struct ExtractedAttachment {
    pub reference: FileReference,
    pub data: Bytes,
    pub hash: String,
}

/// Parsed AASX package
#[derive(Debug)]
pub struct ExtractedPackage {
    pub environment: Value,
    pub attachments: Vec<ExtractedAttachment>,
    /// References whose path has no entry in the archive
    pub unresolved: Vec<FileReference>,
}

/// Extract on the blocking pool; unzipping and hashing are CPU bound
pub async fn extract_blocking(data: Bytes, max_unpacked_bytes: u64) -> Result<ExtractedPackage> {
    tokio::task::spawn_blocking(move || extract(data, max_unpacked_bytes))
        .await
        .map_err(|e| AppError::Internal(format!("Extraction task failed: {}", e)))?
}

/// Open an AASX archive, parse its JSON environment and read every
/// attachment the environment references
///
/// At most `max_unpacked_bytes` are decompressed over all parts read; the
/// sizes declared in the archive headers are not trusted.
pub fn extract(data: Bytes, max_unpacked_bytes: u64) -> Result<ExtractedPackage> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut budget = max_unpacked_bytes;

    // Normalized entry name -> archive index
    let mut entries = HashMap::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        entries.insert(normalize_path(entry.name()), i);
    }

    let env_index = find_environment(&entries)?;
    let environment: Value = {
        let entry = archive.by_index(env_index)?;
        let buf = read_entry(entry, &mut budget, max_unpacked_bytes)?;
        serde_json::from_slice(&buf)?
    };

    let references = collect_file_references(&environment)?;
    let mut cache: HashMap<usize, (Bytes, String)> = HashMap::new();
    let mut attachments = Vec::new();
    let mut unresolved = Vec::new();

    for reference in references {
        if is_external(&reference.path) {
            tracing::debug!("Skipping external attachment {}", reference.path);
            continue;
        }
        let Some(&index) = entries.get(&normalize_path(&reference.path)) else {
            tracing::warn!(
                "Attachment {} of {} is not in the archive",
                reference.path,
                reference.key
            );
            unresolved.push(reference);
            continue;
        };

        if !cache.contains_key(&index) {
            let entry = archive.by_index(index)?;
            let buf = read_entry(entry, &mut budget, max_unpacked_bytes)?;
            let hash = content_hash(&buf);
            cache.insert(index, (Bytes::from(buf), hash));
        }
        let (data, hash) = cache[&index].clone();
        attachments.push(ExtractedAttachment {
            reference,
            data,
            hash,
        });
    }

    Ok(ExtractedPackage {
        environment,
        attachments,
        unresolved,
    })
}

/// Read one part, charging its decompressed size against `budget`
fn read_entry(entry: ZipFile<'_>, budget: &mut u64, max_unpacked_bytes: u64) -> Result<Vec<u8>> {
    let name = entry.name().to_string();
    let mut buf = Vec::new();
    entry.take(budget.saturating_add(1)).read_to_end(&mut buf)?;

    let read = buf.len() as u64;
    if read > *budget {
        return Err(AppError::BadRequest(format!(
            "Package unpacks to more than {} bytes (at {})",
            max_unpacked_bytes, name
        )));
    }
    *budget -= read;
    Ok(buf)
}

/// First JSON part outside `_rels/`, preferring parts under `aasx/`
fn find_environment(entries: &HashMap<String, usize>) -> Result<usize> {
    let mut candidates: Vec<(&String, usize)> = entries
        .iter()
        .filter(|(name, _)| !is_relationship_part(name))
        .map(|(name, &i)| (name, i))
        .collect();
    candidates.sort_by_key(|&(name, i)| (!name.starts_with("aasx/"), i));

    if let Some(&(_, i)) = candidates.iter().find(|(name, _)| name.ends_with(".json")) {
        return Ok(i);
    }
    if candidates
        .iter()
        .any(|(name, _)| name.ends_with(".xml") && name.as_str() != "[Content_Types].xml")
    {
        return Err(AppError::BadRequest(
            "Package carries an XML environment; only JSON environments are supported"
                .to_string(),
        ));
    }
    Err(AppError::BadRequest(
        "Package carries no environment part".to_string(),
    ))
}

fn is_relationship_part(name: &str) -> bool {
    name.starts_with("_rels/") || name.contains("/_rels/") || name.ends_with(".rels")
}
