use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::efta::parse_document_id;
use crate::{SefiError, UnitKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Pending,
    Accepted,
    Disputed,
    Quarantined,
}

impl FindingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Disputed => "disputed",
            Self::Quarantined => "quarantined",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "disputed" => Some(Self::Disputed),
            "quarantined" => Some(Self::Quarantined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub finding_id: String,
    pub unit_id: String,
    pub unit_kind: Option<UnitKind>,
    pub worker_id: String,
    pub status: FindingStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub validated_at: OffsetDateTime,
    pub result: serde_json::Value,
    #[serde(default)]
    pub cited_document_ids: Vec<String>,
    pub quorum_count: u32,
}

/// Durable home of findings.
pub trait FindingsStore: Send {
    /// Persist `finding`. Storing an id that already exists writes nothing.
    ///
    /// # Errors
    /// Returns [`SefiError::Collaborator`] when the backing store fails.
    fn store(&mut self, finding: &Finding) -> Result<String, SefiError>;

    /// The accepted finding already recorded for `unit_id`, if any.
    ///
    /// # Errors
    /// Returns [`SefiError::Collaborator`] when the backing store fails.
    fn existing_accepted_finding_id(&self, unit_id: &str) -> Result<Option<String>, SefiError>;

    /// # Errors
    /// Returns [`SefiError::Collaborator`] when the backing store fails.
    fn count_by_status(&self, status: FindingStatus) -> Result<u64, SefiError>;
}

/// Knows which document ids exist in the ingested reference data.
pub trait ProvenanceLookup: Send + Sync {
    /// # Errors
    /// Returns [`SefiError::Collaborator`] when the lookup data cannot be queried.
    fn is_known(&self, document_id: &str) -> Result<bool, SefiError>;
}

/// Findings kept in process memory, insertion ordered.
#[derive(Debug, Clone, Default)]
pub struct MemoryFindingsStore {
    findings: BTreeMap<String, Finding>,
    order: Vec<String>,
}

impl MemoryFindingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn get(&self, finding_id: &str) -> Option<&Finding> {
        self.findings.get(finding_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.order.iter().filter_map(|finding_id| self.findings.get(finding_id))
    }
}

impl FindingsStore for MemoryFindingsStore {
    fn store(&mut self, finding: &Finding) -> Result<String, SefiError> {
        if !self.findings.contains_key(&finding.finding_id) {
            self.order.push(finding.finding_id.clone());
            self.findings.insert(finding.finding_id.clone(), finding.clone());
        }
        Ok(finding.finding_id.clone())
    }

    fn existing_accepted_finding_id(&self, unit_id: &str) -> Result<Option<String>, SefiError> {
        Ok(self
            .iter()
            .find(|finding| finding.unit_id == unit_id && finding.status == FindingStatus::Accepted)
            .map(|finding| finding.finding_id.clone()))
    }

    fn count_by_status(&self, status: FindingStatus) -> Result<u64, SefiError> {
        let count = self.findings.values().filter(|finding| finding.status == status).count();
        u64::try_from(count).map_err(|err| SefiError::Collaborator(err.to_string()))
    }
}

/// Reference data held in memory: inclusive numeric ranges plus exact entity ids.
#[derive(Debug, Clone, Default)]
pub struct StaticProvenance {
    ranges: Vec<(u32, u32)>,
    entities: BTreeSet<String>,
}

impl StaticProvenance {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_range(mut self, start: u32, end: u32) -> Self {
        self.ranges.push((start.min(end), start.max(end)));
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entities.insert(entity_id.into());
        self
    }
}

impl ProvenanceLookup for StaticProvenance {
    fn is_known(&self, document_id: &str) -> Result<bool, SefiError> {
        if let Some(number) = parse_document_id(document_id) {
            if self.ranges.iter().any(|(start, end)| (*start..=*end).contains(&number)) {
                return Ok(true);
            }
        }
        Ok(self.entities.contains(document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finding(finding_id: &str, unit_id: &str, status: FindingStatus) -> Finding {
        Finding {
            finding_id: finding_id.to_string(),
            unit_id: unit_id.to_string(),
            unit_kind: Some(UnitKind::VerifyFinding),
            worker_id: "worker-a".to_string(),
            status,
            submitted_at: OffsetDateTime::UNIX_EPOCH,
            validated_at: OffsetDateTime::UNIX_EPOCH,
            result: json!({"verdict": "verified"}),
            cited_document_ids: Vec::new(),
            quorum_count: 1,
        }
    }

    #[test]
    fn memory_store_is_idempotent_on_finding_id() -> Result<(), SefiError> {
        let mut store = MemoryFindingsStore::new();
        store.store(&finding("finding-1", "verify-a", FindingStatus::Accepted))?;
        store.store(&finding("finding-1", "verify-b", FindingStatus::Quarantined))?;
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("finding-1").map(|found| found.unit_id.as_str()), Some("verify-a"));
        Ok(())
    }

    #[test]
    fn memory_store_only_reports_accepted_findings_for_dedup() -> Result<(), SefiError> {
        let mut store = MemoryFindingsStore::new();
        store.store(&finding("finding-q", "verify-a", FindingStatus::Quarantined))?;
        assert_eq!(store.existing_accepted_finding_id("verify-a")?, None);
        store.store(&finding("finding-1", "verify-a", FindingStatus::Accepted))?;
        store.store(&finding("finding-2", "verify-a", FindingStatus::Accepted))?;
        assert_eq!(store.existing_accepted_finding_id("verify-a")?, Some("finding-1".to_string()));
        assert_eq!(store.count_by_status(FindingStatus::Accepted)?, 2);
        assert_eq!(store.count_by_status(FindingStatus::Quarantined)?, 1);
        Ok(())
    }

    #[test]
    fn static_provenance_checks_ranges_then_entities() -> Result<(), SefiError> {
        let lookup = StaticProvenance::new().with_range(100, 200).with_entity("EFTA00000999");
        assert!(lookup.is_known("EFTA00000100")?);
        assert!(lookup.is_known("EFTA00000200")?);
        assert!(lookup.is_known("EFTA00000999")?);
        assert!(!lookup.is_known("EFTA00000201")?);
        assert!(!lookup.is_known("garbage")?);
        Ok(())
    }

    #[test]
    fn finding_status_parse_round_trips() {
        for status in [
            FindingStatus::Pending,
            FindingStatus::Accepted,
            FindingStatus::Disputed,
            FindingStatus::Quarantined,
        ] {
            assert_eq!(FindingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(FindingStatus::parse("rejected"), None);
    }
}
