use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::efta::{is_document_id, is_document_url};
use crate::window::{parse_record_date, BATCH_MAX, BATCH_MIN, WINDOW_DAYS};
use crate::SefiError;

/// Appended verbatim to every unit's instructions.
pub const SAFETY_PROHIBITION: &str =
    "Do not attempt to infer or recover redacted content. Analyze patterns only.";

pub const VERIFY_UNIT_PREFIX: &str = "verify-";
pub const DECISION_CHAIN_UNIT_PREFIX: &str = "dc-";
pub const UNIT_ID_HEX_LEN: usize = 12;

time::serde::format_description!(iso_date, Date, "[year]-[month]-[day]");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    VerifyFinding,
    DecisionChain,
}

impl UnitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerifyFinding => "verify_finding",
            Self::DecisionChain => "decision_chain",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "verify_finding" => Some(Self::VerifyFinding),
            "decision_chain" => Some(Self::DecisionChain),
            _ => None,
        }
    }

    #[must_use]
    pub fn unit_prefix(self) -> &'static str {
        match self {
            Self::VerifyFinding => VERIFY_UNIT_PREFIX,
            Self::DecisionChain => DECISION_CHAIN_UNIT_PREFIX,
        }
    }
}

impl Display for UnitKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = SefiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| SefiError::UnknownKind(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Low,
    Medium,
    High,
}

impl Difficulty {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scaling {
    Linear,
    Multiplying,
    Plateau,
    Aggregation,
}

impl Scaling {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Multiplying => "multiplying",
            Self::Plateau => "plateau",
            Self::Aggregation => "aggregation",
        }
    }
}

/// Output limits handed to the worker. `Copy`, so every unit owns its own value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnitConstraints {
    pub max_output_tokens: u32,
    pub pii_filter: bool,
    pub requires_quorum: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyFindingInput {
    pub claim_text: String,
    pub cited_document_ids: Vec<String>,
    pub resolved_urls: Vec<String>,
}

/// One document handed out in a decision chain batch. Metadata the engine does not interpret
/// rides along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRef {
    pub document_id: String,
    pub url: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionChainInput {
    #[serde(with = "iso_date")]
    pub window_start: Date,
    #[serde(with = "iso_date")]
    pub window_end: Date,
    pub document_refs: Vec<DocumentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "input", rename_all = "snake_case")]
pub enum UnitPayload {
    VerifyFinding(VerifyFindingInput),
    DecisionChain(DecisionChainInput),
}

impl UnitPayload {
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::VerifyFinding(_) => UnitKind::VerifyFinding,
            Self::DecisionChain(_) => UnitKind::DecisionChain,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkUnit {
    pub unit_id: String,
    pub research_path: u8,
    pub difficulty: Difficulty,
    pub scaling: Scaling,
    pub optimal_batch_description: String,
    pub instructions: String,
    pub constraints: UnitConstraints,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub deadline: OffsetDateTime,
    pub source_verified: bool,
    pub payload: UnitPayload,
}

impl WorkUnit {
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        self.payload.kind()
    }

    /// Document ids this unit points the worker at, in payload order.
    #[must_use]
    pub fn document_ids(&self) -> Vec<&str> {
        match &self.payload {
            UnitPayload::VerifyFinding(input) => {
                input.cited_document_ids.iter().map(String::as_str).collect()
            }
            UnitPayload::DecisionChain(input) => {
                input.document_refs.iter().map(|doc| doc.document_id.as_str()).collect()
            }
        }
    }

    /// Validate the envelope and the kind-specific payload.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), SefiError> {
        let prefix = self.kind().unit_prefix();
        let suffix_ok = self.unit_id.strip_prefix(prefix).is_some_and(|suffix| {
            suffix.len() == UNIT_ID_HEX_LEN
                && suffix.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'))
        });
        if !suffix_ok {
            return Err(SefiError::Validation(format!(
                "unit_id MUST be `{prefix}` plus {UNIT_ID_HEX_LEN} lowercase hex digits for {} units, got `{}`",
                self.kind(),
                self.unit_id
            )));
        }

        if self.deadline <= self.created_at {
            return Err(SefiError::Validation(format!(
                "deadline ({}) MUST be after created_at ({})",
                self.deadline, self.created_at
            )));
        }

        if !(1..=5).contains(&self.research_path) {
            return Err(SefiError::Validation(format!(
                "research_path MUST be in [1, 5], got {}",
                self.research_path
            )));
        }

        if self.optimal_batch_description.trim().is_empty() {
            return Err(SefiError::Validation(
                "optimal_batch_description MUST be provided".to_string(),
            ));
        }

        if !self.instructions.contains(SAFETY_PROHIBITION) {
            return Err(SefiError::Validation(
                "instructions MUST contain the verbatim safety prohibition".to_string(),
            ));
        }

        if self.constraints.max_output_tokens == 0 {
            return Err(SefiError::Validation("max_output_tokens MUST be > 0".to_string()));
        }

        match &self.payload {
            UnitPayload::VerifyFinding(input) => validate_verify_input(input),
            UnitPayload::DecisionChain(input) => validate_decision_chain_input(input),
        }
    }
}

fn validate_verify_input(input: &VerifyFindingInput) -> Result<(), SefiError> {
    if input.claim_text.trim().is_empty() {
        return Err(SefiError::Validation("claim_text MUST be non-empty".to_string()));
    }

    if input.cited_document_ids.is_empty() {
        return Err(SefiError::Validation(
            "cited_document_ids MUST contain at least one document".to_string(),
        ));
    }

    if input.cited_document_ids.len() != input.resolved_urls.len() {
        return Err(SefiError::Validation(format!(
            "resolved_urls length ({}) MUST match cited_document_ids length ({})",
            input.resolved_urls.len(),
            input.cited_document_ids.len()
        )));
    }

    if let Some(bad) = input.cited_document_ids.iter().find(|id| !is_document_id(id)) {
        return Err(SefiError::Validation(format!(
            "cited document id `{bad}` MUST match EFTA followed by 8 digits"
        )));
    }

    if let Some(bad) = input.resolved_urls.iter().find(|url| !is_document_url(url)) {
        return Err(SefiError::Validation(format!(
            "resolved url `{bad}` is not a canonical document URL"
        )));
    }

    Ok(())
}

fn validate_decision_chain_input(input: &DecisionChainInput) -> Result<(), SefiError> {
    if input.window_end < input.window_start {
        return Err(SefiError::Validation(format!(
            "window_end ({}) MUST NOT precede window_start ({})",
            input.window_end, input.window_start
        )));
    }

    let span = (input.window_end - input.window_start).whole_days();
    if span > WINDOW_DAYS {
        return Err(SefiError::Validation(format!(
            "window MUST span at most {WINDOW_DAYS} days, got {span}"
        )));
    }

    let count = input.document_refs.len();
    if !(BATCH_MIN..=BATCH_MAX).contains(&count) {
        return Err(SefiError::Validation(format!(
            "document_refs MUST contain between {BATCH_MIN} and {BATCH_MAX} entries, got {count}"
        )));
    }

    let mut seen = BTreeSet::new();
    for (index, doc) in input.document_refs.iter().enumerate() {
        if !is_document_id(&doc.document_id) {
            return Err(SefiError::Validation(format!(
                "document_refs[{index}].document_id `{}` MUST match EFTA followed by 8 digits",
                doc.document_id
            )));
        }
        if !seen.insert(doc.document_id.as_str()) {
            return Err(SefiError::Validation(format!(
                "document_refs[{index}] repeats document `{}`",
                doc.document_id
            )));
        }
        if !is_document_url(&doc.url) {
            return Err(SefiError::Validation(format!(
                "document_refs[{index}].url `{}` is not a canonical document URL",
                doc.url
            )));
        }
        let date = doc.extra.get("date").and_then(serde_json::Value::as_str);
        if let Some(date) = date.and_then(parse_record_date) {
            if date < input.window_start || date > input.window_end {
                return Err(SefiError::Validation(format!(
                    "document_refs[{index}] dated {date} falls outside the window"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn verify_unit() -> WorkUnit {
        WorkUnit {
            unit_id: "verify-0123456789ab".to_string(),
            research_path: 5,
            difficulty: Difficulty::Low,
            scaling: Scaling::Linear,
            optimal_batch_description: "1 claim".to_string(),
            instructions: format!("Review the documents. {SAFETY_PROHIBITION}"),
            constraints: UnitConstraints {
                max_output_tokens: 2000,
                pii_filter: true,
                requires_quorum: false,
            },
            created_at: datetime!(2024-01-01 00:00 UTC),
            deadline: datetime!(2024-01-02 00:00 UTC),
            source_verified: true,
            payload: UnitPayload::VerifyFinding(VerifyFindingInput {
                claim_text: "The memo references a meeting.".to_string(),
                cited_document_ids: vec!["EFTA00039186".to_string()],
                resolved_urls: vec![
                    "https://www.justice.gov/epstein/files/DataSet%209/EFTA00039186.pdf"
                        .to_string(),
                ],
            }),
        }
    }

    fn doc_ref(number: u32, date: &str) -> DocumentRef {
        let mut extra = serde_json::Map::new();
        extra.insert("date".to_string(), serde_json::Value::String(date.to_string()));
        DocumentRef {
            document_id: format!("EFTA{number:08}"),
            url: format!("https://www.justice.gov/epstein/files/DataSet%209/EFTA{number:08}.pdf"),
            extra,
        }
    }

    fn chain_unit(count: u32) -> WorkUnit {
        WorkUnit {
            unit_id: "dc-0123456789ab".to_string(),
            research_path: 3,
            difficulty: Difficulty::High,
            scaling: Scaling::Multiplying,
            optimal_batch_description: "20-50 docs (same 30-day period)".to_string(),
            instructions: SAFETY_PROHIBITION.to_string(),
            constraints: UnitConstraints {
                max_output_tokens: 8000,
                pii_filter: true,
                requires_quorum: true,
            },
            created_at: datetime!(2024-01-01 00:00 UTC),
            deadline: datetime!(2024-01-02 00:00 UTC),
            source_verified: false,
            payload: UnitPayload::DecisionChain(DecisionChainInput {
                window_start: date!(2020 - 01 - 01),
                window_end: date!(2020 - 01 - 31),
                document_refs: (1..=count).map(|n| doc_ref(n, "2020-01-10")).collect(),
            }),
        }
    }

    #[test]
    fn unit_kind_parse_round_trips_and_rejects_unknown() {
        for kind in [UnitKind::VerifyFinding, UnitKind::DecisionChain] {
            assert_eq!(UnitKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(
            "summarize".parse::<UnitKind>(),
            Err(SefiError::UnknownKind("summarize".to_string()))
        );
    }

    #[test]
    fn well_formed_units_validate() -> Result<(), SefiError> {
        verify_unit().validate()?;
        chain_unit(20).validate()?;
        chain_unit(50).validate()
    }

    #[test]
    fn instructions_without_prohibition_are_rejected() {
        let mut unit = verify_unit();
        unit.instructions = "Review the documents.".to_string();
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn verify_unit_rejects_mismatched_urls() {
        let mut unit = verify_unit();
        if let UnitPayload::VerifyFinding(input) = &mut unit.payload {
            input.resolved_urls.clear();
        }
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn verify_unit_rejects_prefix_of_other_kind() {
        let mut unit = verify_unit();
        unit.unit_id = "dc-0123456789ab".to_string();
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn unit_id_suffix_must_be_twelve_lowercase_hex() {
        for bad in [
            "verify-NOT_HEX!",
            "verify-0123456789AB",
            "verify-0123456789a",
            "verify-0123456789abc",
            "verify-",
            "verify",
        ] {
            let mut unit = verify_unit();
            unit.unit_id = bad.to_string();
            assert!(matches!(unit.validate(), Err(SefiError::Validation(_))), "{bad} validated");
        }
    }

    #[test]
    fn deadline_must_follow_creation() {
        let mut unit = verify_unit();
        unit.deadline = unit.created_at;
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));

        unit.deadline = datetime!(2023-12-31 00:00 UTC);
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn chain_unit_enforces_batch_bounds() {
        assert!(matches!(chain_unit(19).validate(), Err(SefiError::Validation(_))));
        assert!(matches!(chain_unit(51).validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn chain_unit_rejects_wide_or_inverted_window() {
        let mut unit = chain_unit(20);
        if let UnitPayload::DecisionChain(input) = &mut unit.payload {
            input.window_end = date!(2020 - 02 - 01);
        }
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));

        let mut unit = chain_unit(20);
        if let UnitPayload::DecisionChain(input) = &mut unit.payload {
            input.window_end = date!(2019 - 12 - 31);
        }
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn chain_unit_rejects_ref_dated_outside_window() {
        let mut unit = chain_unit(20);
        if let UnitPayload::DecisionChain(input) = &mut unit.payload {
            input.document_refs[3] = doc_ref(4, "2020-03-01");
        }
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn chain_unit_rejects_repeated_document() {
        let mut unit = chain_unit(20);
        if let UnitPayload::DecisionChain(input) = &mut unit.payload {
            input.document_refs[1] = doc_ref(1, "2020-01-10");
        }
        assert!(matches!(unit.validate(), Err(SefiError::Validation(_))));
    }

    #[test]
    fn serialized_unit_uses_kind_tag_and_iso_dates() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(chain_unit(20))?;
        assert_eq!(value["payload"]["kind"], "decision_chain");
        assert_eq!(value["payload"]["input"]["window_start"], "2020-01-01");
        assert_eq!(value["payload"]["input"]["document_refs"][0]["date"], "2020-01-10");
        assert_eq!(value["created_at"], "2024-01-01T00:00:00Z");
        assert_eq!(value["deadline"], "2024-01-02T00:00:00Z");

        let decoded: WorkUnit = serde_json::from_value(value)?;
        assert_eq!(decoded, chain_unit(20));
        Ok(())
    }
}
