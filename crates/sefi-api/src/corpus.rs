use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sefi_core::{ClaimRecord, RelationshipRecord};
use serde_json::Value;

/// Load claim records. A missing file is an error; there is nothing to verify without it.
///
/// # Errors
/// Returns an error when the file is missing, is not a JSON array, or holds a malformed claim.
pub fn load_claims(path: &Path) -> Result<Vec<ClaimRecord>> {
    let items = read_array(path)?;
    let claims = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<ClaimRecord>(item)
                .with_context(|| format!("malformed claim at index {index} in {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(path = %path.display(), count = claims.len(), "loaded claims");
    Ok(claims)
}

/// Load relationship records. A missing file yields an empty corpus.
///
/// # Errors
/// Returns an error when the file exists but is not a JSON array of objects.
pub fn load_relationships(path: &Path) -> Result<Vec<RelationshipRecord>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "relationships file not found; no decision chain units");
        return Ok(Vec::new());
    }
    let items = read_array(path)?;
    let relationships = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            RelationshipRecord::from_value(item).with_context(|| {
                format!("malformed relationship at index {index} in {}", path.display())
            })
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(path = %path.display(), count = relationships.len(), "loaded relationships");
    Ok(relationships)
}

fn read_array(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse corpus file {}", path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(anyhow!("corpus file {} MUST contain a JSON array", path.display())),
    }
}

/// Document ids cited by a worker result, in order of appearance.
///
/// Reads `citations[*].efta_number` and `communication_graph[*].efta_reference`; only string
/// values starting with `EFTA` count.
#[must_use]
pub fn extract_cited_ids(result: &Value) -> Vec<String> {
    let sources = [("citations", "efta_number"), ("communication_graph", "efta_reference")];
    sources
        .into_iter()
        .filter_map(|(list, field)| {
            result.get(list).and_then(Value::as_array).map(|items| (items, field))
        })
        .flat_map(|(items, field)| {
            items.iter().filter_map(move |item| item.get(field).and_then(Value::as_str))
        })
        .filter(|id| id.starts_with("EFTA"))
        .map(str::to_string)
        .collect()
}
