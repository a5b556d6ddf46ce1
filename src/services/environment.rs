//! Walks an AAS environment document for attachment references.
//!
//! Works on plain `serde_json::Value` trees so that both the current
//! (`"modelType": "File"`, `"id"`) and the older (`"modelType": {"name": ..}`,
//! `"identification": {"id": ..}`) serializations are understood.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::CompositeKey;
use crate::services::hash::{is_content_hash, CONTENT_HASH_LEN};

/// Path prefix of the raw download route
pub const DOWNLOAD_PATH: &str = "/api/transformer/download/";

/// Child arrays that may hold nested submodel elements
const CONTAINER_FIELDS: [&str; 3] = ["value", "statements", "annotations"];

/// One attachment referenced from an environment
#[derive(Debug, Clone, PartialEq)]
pub struct FileReference {
    pub key: CompositeKey,
    /// Path exactly as written in the environment
    pub path: String,
    pub content_type: Option<String>,
}

/// Collect every attachment reference: asset default thumbnails first, then
/// `File` elements of every submodel in document order
///
/// External (`http(s)://`) paths are returned as well; callers decide
/// whether they can resolve them.
pub fn collect_file_references(env: &Value) -> Result<Vec<FileReference>> {
    let shells = array_field(env, "assetAdministrationShells");
    let mut refs = Vec::new();

    for shell in shells {
        if let Some(r) = thumbnail_reference(shell) {
            refs.push(r);
        }
    }

    for submodel in array_field(env, "submodels") {
        let Some(submodel_id) = identifier(submodel) else {
            tracing::warn!("Skipping submodel without id");
            continue;
        };

        let mut files = Vec::new();
        collect_files(array_field(submodel, "submodelElements"), &mut files);
        if files.is_empty() {
            continue;
        }

        let shell_id = owning_shell(shells, &submodel_id).ok_or_else(|| {
            AppError::BadRequest(format!(
                "Submodel {} has attachments but the environment has no shell",
                submodel_id
            ))
        })?;

        for file in files {
            let Some(id_short) = file.get("idShort").and_then(Value::as_str) else {
                tracing::warn!("Skipping File element without idShort in {}", submodel_id);
                continue;
            };
            let Some(path) = file_path(file) else {
                continue;
            };

            match CompositeKey::new(shell_id.as_str(), submodel_id.as_str(), id_short) {
                Ok(key) => refs.push(FileReference {
                    key,
                    path: path.to_string(),
                    content_type: content_type(file),
                }),
                Err(e) => tracing::warn!("Skipping attachment {}: {}", path, e),
            }
        }
    }

    Ok(refs)
}

/// Replace attachment paths by the URLs mapped from their normalized form;
/// returns how many values were rewritten
pub fn rewrite_file_paths(env: &mut Value, urls: &HashMap<String, String>) -> usize {
    let mut rewritten = 0;
    let mut rewrite = |slot: &mut Value| {
        let Some(path) = slot.as_str() else { return };
        if let Some(url) = urls.get(&normalize_path(path)) {
            *slot = Value::String(url.clone());
            rewritten += 1;
        }
    };

    if let Some(shells) = env
        .get_mut("assetAdministrationShells")
        .and_then(Value::as_array_mut)
    {
        for shell in shells {
            if let Some(thumb) = shell
                .get_mut("assetInformation")
                .and_then(|a| a.get_mut("defaultThumbnail"))
                .and_then(Value::as_object_mut)
            {
                for field in ["path", "value"] {
                    if let Some(slot) = thumb.get_mut(field) {
                        rewrite(slot);
                    }
                }
            }
        }
    }

    if let Some(submodels) = env.get_mut("submodels").and_then(Value::as_array_mut) {
        for submodel in submodels {
            if let Some(elements) = submodel
                .get_mut("submodelElements")
                .and_then(Value::as_array_mut)
            {
                rewrite_files(elements, &mut rewrite);
            }
        }
    }

    rewritten
}

/// Canonical form used to match environment paths against archive entries
pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = path.strip_prefix("file://").unwrap_or(path);
    path.replace('\\', "/").trim_start_matches('/').to_lowercase()
}

pub fn is_external(path: &str) -> bool {
    let lower = path.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// `{base_url}/api/transformer/download/{hash}{extension}`
pub fn download_url(base_url: &str, hash: &str, extension: &str) -> String {
    format!("{}{}{}{}", base_url, DOWNLOAD_PATH, hash, extension)
}

/// Split a download URL of this service into (hash, extension)
pub fn parse_download_url(base_url: &str, value: &str) -> Option<(String, String)> {
    let rest = value.strip_prefix(base_url)?.strip_prefix(DOWNLOAD_PATH)?;
    if rest.len() < CONTENT_HASH_LEN || !rest.is_char_boundary(CONTENT_HASH_LEN) {
        return None;
    }
    let (hash, extension) = rest.split_at(CONTENT_HASH_LEN);
    if !is_content_hash(hash) {
        return None;
    }
    if !extension.is_empty() && (!extension.starts_with('.') || extension.contains('/')) {
        return None;
    }
    Some((hash.to_string(), extension.to_string()))
}

// ==================== Tree helpers ====================

fn array_field<'a>(value: &'a Value, field: &str) -> &'a [Value] {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// `id`, or the older `identification.id`
fn identifier(value: &Value) -> Option<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| {
            value
                .get("identification")
                .and_then(|i| i.get("id"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

fn model_type(element: &Value) -> Option<&str> {
    match element.get("modelType")? {
        Value::String(s) => Some(s.as_str()),
        Value::Object(o) => o.get("name").and_then(Value::as_str),
        _ => None,
    }
}

fn is_file_element(element: &Value) -> bool {
    model_type(element) == Some("File")
}

fn file_path(file: &Value) -> Option<&str> {
    file.get("value")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn content_type(element: &Value) -> Option<String> {
    element
        .get("contentType")
        .or_else(|| element.get("mimeType"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn collect_files<'a>(elements: &'a [Value], out: &mut Vec<&'a Value>) {
    for element in elements {
        if is_file_element(element) {
            out.push(element);
            continue;
        }
        for field in CONTAINER_FIELDS {
            if let Some(children) = element.get(field).and_then(Value::as_array) {
                collect_files(children, out);
            }
        }
    }
}

fn rewrite_files(elements: &mut [Value], rewrite: &mut impl FnMut(&mut Value)) {
    for element in elements {
        if is_file_element(element) {
            if let Some(slot) = element.get_mut("value") {
                rewrite(slot);
            }
            continue;
        }
        let Some(obj) = element.as_object_mut() else {
            continue;
        };
        for field in CONTAINER_FIELDS {
            if let Some(children) = obj.get_mut(field).and_then(Value::as_array_mut) {
                rewrite_files(children, rewrite);
            }
        }
    }
}

/// Shell that references the submodel through a `Submodel` key, else the first shell
fn owning_shell(shells: &[Value], submodel_id: &str) -> Option<String> {
    let references = |shell: &Value| {
        array_field(shell, "submodels").iter().any(|reference| {
            array_field(reference, "keys").iter().any(|key| {
                key.get("type").and_then(Value::as_str) == Some("Submodel")
                    && key.get("value").and_then(Value::as_str) == Some(submodel_id)
            })
        })
    };

    shells
        .iter()
        .find(|&shell| references(shell))
        .or_else(|| shells.first())
        .and_then(identifier)
}

fn global_asset_id(info: &Map<String, Value>) -> Option<String> {
    match info.get("globalAssetId")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        // Older serialization wraps the id in a reference
        reference @ Value::Object(_) => array_field(reference, "keys")
            .first()
            .and_then(|k| k.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn thumbnail_reference(shell: &Value) -> Option<FileReference> {
    let info = shell.get("assetInformation")?.as_object()?;
    let thumb = info.get("defaultThumbnail")?;
    let path = thumb
        .get("path")
        .or_else(|| thumb.get("value"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|p| !p.is_empty())?;

    let shell_id = identifier(shell)?;
    let Some(asset_id) = global_asset_id(info) else {
        tracing::warn!("Skipping thumbnail of {}: no globalAssetId", shell_id);
        return None;
    };
    let file_name = path
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();

    match CompositeKey::new(shell_id, asset_id, file_name) {
        Ok(key) => Some(FileReference {
            key,
            path: path.to_string(),
            content_type: content_type(thumb),
        }),
        Err(e) => {
            tracing::warn!("Skipping thumbnail {}: {}", path, e);
            None
        }
    }
}
