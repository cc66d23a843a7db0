use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::efta::{has_media_suffix, parse_document_id, DEFAULT_DATASET, MEDIA_DATASET};
use crate::SefiError;

/// Relationship fields that may carry a document id, in priority order.
pub const DOCUMENT_ID_FIELDS: [&str; 5] =
    ["efta_number", "efta_source", "source_efta", "efta", "document_id"];

/// Relationship fields copied onto each document reference.
pub const PASSTHROUGH_FIELDS: [&str; 4] =
    ["date", "relationship_type", "source_entity", "target_entity"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRecord {
    pub claim_id: String,
    #[serde(rename = "claim", alias = "claim_text")]
    pub claim_text: String,
    #[serde(rename = "cited_eftas", alias = "cited_document_ids", default)]
    pub cited_document_ids: Vec<String>,
    #[serde(default)]
    pub primary_datasets: Vec<u8>,
    #[serde(default)]
    pub source_verified: bool,
}

/// An open relationship object from the knowledge graph export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct RelationshipRecord {
    pub fields: Map<String, Value>,
}

impl RelationshipRecord {
    /// # Errors
    /// Returns [`SefiError::Validation`] when `value` is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, SefiError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(SefiError::Validation(format!(
                "relationship record MUST be a JSON object, got {other}"
            ))),
        }
    }

    /// First candidate field holding a well-formed document id.
    #[must_use]
    pub fn document_id(&self) -> Option<(&str, u32)> {
        DOCUMENT_ID_FIELDS.iter().find_map(|field| {
            let candidate = self.fields.get(*field)?.as_str()?;
            parse_document_id(candidate).map(|number| (candidate, number))
        })
    }

    #[must_use]
    pub fn date(&self) -> Option<&str> {
        self.fields.get("date").and_then(Value::as_str)
    }

    /// Explicit dataset marker, from `dataset` then `primary_dataset`.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] when the marker is present but not a dataset number.
    pub fn dataset_marker(&self) -> Result<Option<u8>, SefiError> {
        let Some(raw) = self.fields.get("dataset").or_else(|| self.fields.get("primary_dataset"))
        else {
            return Ok(None);
        };
        let parsed = match raw {
            Value::Number(number) => number.as_u64().and_then(|value| u8::try_from(value).ok()),
            Value::String(text) => text.trim().parse::<u8>().ok(),
            Value::Null => return Ok(None),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| SefiError::Validation(format!("dataset marker {raw} is not a number")))
    }

    /// Dataset to resolve against, defaulting when the record names none.
    ///
    /// # Errors
    /// Propagates [`RelationshipRecord::dataset_marker`] failures.
    pub fn dataset(&self) -> Result<u8, SefiError> {
        Ok(self.dataset_marker()?.unwrap_or(DEFAULT_DATASET))
    }

    #[must_use]
    pub fn passthrough(&self) -> Map<String, Value> {
        PASSTHROUGH_FIELDS
            .iter()
            .filter_map(|field| {
                let value = self.fields.get(*field)?;
                (!value.is_null()).then(|| ((*field).to_string(), value.clone()))
            })
            .collect()
    }

    fn has_media_reference(&self) -> bool {
        DOCUMENT_ID_FIELDS
            .iter()
            .filter_map(|field| self.fields.get(*field).and_then(Value::as_str))
            .any(has_media_suffix)
    }
}

/// Drop claims touching the media dataset or citing media files.
#[must_use]
pub fn filter_claims(claims: Vec<ClaimRecord>) -> Vec<ClaimRecord> {
    let before = claims.len();
    let kept: Vec<ClaimRecord> = claims
        .into_iter()
        .filter(|claim| {
            !claim.primary_datasets.contains(&MEDIA_DATASET)
                && !claim.cited_document_ids.iter().any(|id| has_media_suffix(id))
        })
        .collect();
    tracing::debug!(before, kept = kept.len(), "filtered claim corpus");
    kept
}

/// Drop relationships in the media dataset or pointing at media files.
#[must_use]
pub fn filter_relationships(relationships: Vec<RelationshipRecord>) -> Vec<RelationshipRecord> {
    let before = relationships.len();
    let kept: Vec<RelationshipRecord> = relationships
        .into_iter()
        .filter(|record| {
            !matches!(record.dataset_marker(), Ok(Some(MEDIA_DATASET)))
                && !record.has_media_reference()
        })
        .collect();
    tracing::debug!(before, kept = kept.len(), "filtered relationship corpus");
    kept
}
