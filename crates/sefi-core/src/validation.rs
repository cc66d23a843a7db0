use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::builder::random_hex12;
use crate::findings::{Finding, FindingStatus, FindingsStore, ProvenanceLookup};
use crate::{SefiError, UnitKind};

/// Quorum is not computed; the first accepted finding settles a unit.
pub const QUORUM_ACHIEVED: &str = "achieved";

const PII_PATTERN_SOURCES: [(&str, &str); 3] = [
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("phone", r"\b(\+1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"),
    (
        "postal_address",
        r"\b\d{1,5}\s+[A-Za-z0-9\s,.]+(?:Street|St|Avenue|Ave|Boulevard|Blvd|Road|Rd|Drive|Dr|Lane|Ln|Way|Court|Ct)\b",
    ),
];

static PII_PATTERNS: Lazy<Result<Vec<(&'static str, Regex)>, regex_lite::Error>> = Lazy::new(|| {
    PII_PATTERN_SOURCES
        .iter()
        .map(|(name, source)| Regex::new(source).map(|regex| (*name, regex)))
        .collect()
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    pub unit_id: String,
    pub worker_id: String,
    pub result: serde_json::Value,
    #[serde(default)]
    pub cited_document_ids: Vec<String>,
    #[serde(default)]
    pub unit_kind: Option<UnitKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub quorum_status: String,
    pub pii_detected: bool,
    pub errors: Vec<String>,
    pub finding_id: Option<String>,
}

impl ValidationOutcome {
    fn rejected(errors: Vec<String>) -> Self {
        Self {
            accepted: false,
            quorum_status: QUORUM_ACHIEVED.to_string(),
            pii_detected: false,
            errors,
            finding_id: None,
        }
    }

    fn accepted(finding_id: String) -> Self {
        Self {
            accepted: true,
            quorum_status: QUORUM_ACHIEVED.to_string(),
            pii_detected: false,
            errors: Vec::new(),
            finding_id: Some(finding_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiMatch {
    pub pattern_name: &'static str,
    pub matched_text: String,
}

impl PiiMatch {
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "PII detected: pattern '{}' matched text '{}'",
            self.pattern_name, self.matched_text
        )
    }
}

/// Every match of every PII pattern in `text`.
///
/// # Errors
/// Returns [`SefiError::Validation`] if the built-in patterns failed to compile.
pub fn scan_for_pii(text: &str) -> Result<Vec<PiiMatch>, SefiError> {
    let patterns = PII_PATTERNS
        .as_ref()
        .map_err(|err| SefiError::Validation(format!("PII patterns failed to compile: {err}")))?;
    Ok(patterns
        .iter()
        .flat_map(|(name, regex)| {
            let name: &'static str = *name;
            regex.find_iter(text).map(move |found| PiiMatch {
                pattern_name: name,
                matched_text: found.as_str().to_string(),
            })
        })
        .collect())
}

/// Screens submissions before they become findings: PII scan, then provenance, then dedup.
///
/// The store sits behind the pipeline mutex and the lock is held for a whole validation, so two
/// submissions for one unit cannot both be accepted.
pub struct ValidationPipeline<S, P> {
    store: Mutex<S>,
    provenance: P,
}

impl<S, P> std::fmt::Debug for ValidationPipeline<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationPipeline").finish_non_exhaustive()
    }
}

impl<S: FindingsStore, P: ProvenanceLookup> ValidationPipeline<S, P> {
    #[must_use]
    pub fn new(store: S, provenance: P) -> Self {
        Self { store: Mutex::new(store), provenance }
    }

    /// Run the checks in their fixed order.
    ///
    /// A PII match quarantines the submission and skips the remaining checks. A provenance
    /// failure stores nothing. An already accepted unit returns the existing finding id.
    ///
    /// # Errors
    /// Only collaborator failures are errors; rejections are reported in the outcome.
    pub fn validate(&self, submission: &Submission) -> Result<ValidationOutcome, SefiError> {
        let submitted_at = OffsetDateTime::now_utc();
        let serialized = serde_json::to_string(submission)
            .map_err(|err| SefiError::Validation(format!("submission is not serializable: {err}")))?;

        let mut store = self.store.lock();

        let pii = scan_for_pii(&serialized)?;
        if !pii.is_empty() {
            let finding = new_finding(submission, FindingStatus::Quarantined, submitted_at);
            let finding_id = store.store(&finding)?;
            let patterns: Vec<&str> = pii.iter().map(|found| found.pattern_name).collect();
            tracing::warn!(
                unit_id = %submission.unit_id,
                finding_id = %finding_id,
                patterns = ?patterns,
                "quarantined submission containing PII"
            );
            return Ok(ValidationOutcome {
                accepted: false,
                quorum_status: QUORUM_ACHIEVED.to_string(),
                pii_detected: true,
                errors: pii.iter().map(PiiMatch::message).collect(),
                finding_id: Some(finding_id),
            });
        }

        let provenance_errors = self.verify_provenance(&submission.cited_document_ids)?;
        if !provenance_errors.is_empty() {
            tracing::warn!(
                unit_id = %submission.unit_id,
                unknown = provenance_errors.len(),
                "rejected submission with unknown citations"
            );
            return Ok(ValidationOutcome::rejected(provenance_errors));
        }

        if let Some(existing) = store.existing_accepted_finding_id(&submission.unit_id)? {
            tracing::warn!(
                unit_id = %submission.unit_id,
                finding_id = %existing,
                "unit already has an accepted finding"
            );
            return Ok(ValidationOutcome::accepted(existing));
        }

        let finding = new_finding(submission, FindingStatus::Accepted, submitted_at);
        let finding_id = store.store(&finding)?;
        tracing::info!(
            unit_id = %submission.unit_id,
            finding_id = %finding_id,
            "accepted finding"
        );
        Ok(ValidationOutcome::accepted(finding_id))
    }

    /// One message per cited id the lookup does not know.
    ///
    /// # Errors
    /// Propagates lookup failures.
    pub fn verify_provenance(&self, cited: &[String]) -> Result<Vec<String>, SefiError> {
        let mut errors = Vec::new();
        for document_id in cited {
            if !self.provenance.is_known(document_id)? {
                errors.push(format!(
                    "Provenance error: cited document '{document_id}' not found in ingested \
                     reference data; only cite documents present in the corpus"
                ));
            }
        }
        Ok(errors)
    }

    /// Run `read` against the store while holding the pipeline lock.
    pub fn with_store<R>(&self, read: impl FnOnce(&S) -> R) -> R {
        let store = self.store.lock();
        read(&*store)
    }

    /// # Errors
    /// Propagates store failures.
    pub fn count_by_status(&self, status: FindingStatus) -> Result<u64, SefiError> {
        self.store.lock().count_by_status(status)
    }
}

fn new_finding(
    submission: &Submission,
    status: FindingStatus,
    submitted_at: OffsetDateTime,
) -> Finding {
    Finding {
        finding_id: format!("finding-{}", random_hex12()),
        unit_id: submission.unit_id.clone(),
        unit_kind: submission.unit_kind,
        worker_id: submission.worker_id.clone(),
        status,
        submitted_at,
        validated_at: OffsetDateTime::now_utc(),
        result: submission.result.clone(),
        cited_document_ids: submission.cited_document_ids.clone(),
        quorum_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{MemoryFindingsStore, StaticProvenance};
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;

    fn pipeline() -> ValidationPipeline<MemoryFindingsStore, StaticProvenance> {
        ValidationPipeline::new(
            MemoryFindingsStore::new(),
            StaticProvenance::new().with_range(1, 50_000).with_entity("EFTA90000000"),
        )
    }

    fn submission(unit_id: &str, result: serde_json::Value, cited: &[&str]) -> Submission {
        Submission {
            unit_id: unit_id.to_string(),
            worker_id: "worker-a".to_string(),
            result,
            cited_document_ids: cited.iter().map(ToString::to_string).collect(),
            unit_kind: Some(UnitKind::VerifyFinding),
        }
    }

    fn clean_result() -> serde_json::Value {
        json!({
            "verdict": "verified",
            "reasoning": "The memo supports the claim.",
            "citations": [{"efta_number": "EFTA00039186"}],
        })
    }

    #[test]
    fn pii_patterns_compile() -> Result<(), SefiError> {
        assert!(scan_for_pii("nothing to see")?.is_empty());
        Ok(())
    }

    #[test]
    fn scan_finds_each_pattern_kind() -> Result<(), SefiError> {
        let names = |text: &str| -> Result<Vec<&'static str>, SefiError> {
            Ok(scan_for_pii(text)?.into_iter().map(|found| found.pattern_name).collect())
        };
        assert_eq!(names("ssn 123-45-6789 here")?, vec!["ssn"]);
        assert_eq!(names("call (555) 867-5309")?, vec!["phone"]);
        assert_eq!(names("lives at 12 Ocean View Drive today")?, vec!["postal_address"]);
        assert!(names("EFTA00039186 and verify-0123456789ab")?.is_empty());
        Ok(())
    }

    #[test]
    fn ssn_is_quarantined_before_provenance_runs() -> Result<(), SefiError> {
        let pipeline = pipeline();
        let outcome = pipeline.validate(&submission(
            "verify-a",
            json!({"reasoning": "Subject id 123-45-6789"}),
            &["EFTA99999999"],
        ))?;
        assert!(!outcome.accepted);
        assert!(outcome.pii_detected);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("'ssn'"));
        assert!(outcome.errors.iter().all(|error| !error.contains("Provenance")));

        let stored = pipeline.with_store(|store| store.iter().cloned().collect::<Vec<_>>());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, FindingStatus::Quarantined);
        assert_eq!(outcome.finding_id.as_deref(), Some(stored[0].finding_id.as_str()));
        Ok(())
    }

    #[test]
    fn pii_in_worker_id_is_caught() -> Result<(), SefiError> {
        let pipeline = pipeline();
        let mut dirty = submission("verify-a", clean_result(), &[]);
        dirty.worker_id = "555-867-5309".to_string();
        let outcome = pipeline.validate(&dirty)?;
        assert!(outcome.pii_detected);
        assert!(!outcome.accepted);
        Ok(())
    }

    #[test]
    fn unknown_citations_are_rejected_without_storing() -> Result<(), SefiError> {
        let pipeline = pipeline();
        let outcome = pipeline.validate(&submission(
            "verify-a",
            clean_result(),
            &["EFTA00039186", "EFTA99999999", "EFTA88888888"],
        ))?;
        assert!(!outcome.accepted);
        assert!(!outcome.pii_detected);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].contains("EFTA99999999"));
        assert_eq!(outcome.finding_id, None);
        assert!(pipeline.with_store(MemoryFindingsStore::is_empty));
        Ok(())
    }

    #[test]
    fn entity_match_satisfies_provenance() -> Result<(), SefiError> {
        let outcome =
            pipeline().validate(&submission("verify-a", clean_result(), &["EFTA90000000"]))?;
        assert!(outcome.accepted);
        Ok(())
    }

    #[test]
    fn empty_citation_list_skips_provenance() -> Result<(), SefiError> {
        let outcome = pipeline().validate(&submission("verify-a", clean_result(), &[]))?;
        assert!(outcome.accepted);
        assert_eq!(outcome.quorum_status, QUORUM_ACHIEVED);
        Ok(())
    }

    #[test]
    fn resubmission_returns_existing_finding() -> Result<(), SefiError> {
        let pipeline = pipeline();
        let first = pipeline.validate(&submission("verify-a", clean_result(), &["EFTA00039186"]))?;
        let mut again = submission("verify-a", clean_result(), &["EFTA00039186"]);
        again.worker_id = "worker-b".to_string();
        let second = pipeline.validate(&again)?;

        assert!(first.accepted);
        assert!(second.accepted);
        assert!(second.errors.is_empty());
        assert_eq!(first.finding_id, second.finding_id);
        assert_eq!(pipeline.count_by_status(FindingStatus::Accepted)?, 1);
        Ok(())
    }

    #[test]
    fn quarantined_finding_does_not_block_later_acceptance() -> Result<(), SefiError> {
        let pipeline = pipeline();
        pipeline.validate(&submission("verify-a", json!({"note": "123-45-6789"}), &[]))?;
        let outcome = pipeline.validate(&submission("verify-a", clean_result(), &[]))?;
        assert!(outcome.accepted);
        assert_eq!(pipeline.count_by_status(FindingStatus::Quarantined)?, 1);
        assert_eq!(pipeline.count_by_status(FindingStatus::Accepted)?, 1);
        Ok(())
    }

    #[test]
    fn racing_submissions_accept_once() -> Result<(), SefiError> {
        let pipeline = Arc::new(pipeline());
        let handles: Vec<_> = (0..8)
            .map(|index| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || {
                    let mut racing = submission("verify-a", clean_result(), &[]);
                    racing.worker_id = format!("worker-{index}");
                    pipeline.validate(&racing)
                })
            })
            .collect();

        let mut finding_ids = std::collections::BTreeSet::new();
        for handle in handles {
            let outcome =
                handle.join().unwrap_or_else(|_| panic!("validation thread panicked"))?;
            assert!(outcome.accepted);
            finding_ids.extend(outcome.finding_id);
        }
        assert_eq!(finding_ids.len(), 1);
        assert_eq!(pipeline.count_by_status(FindingStatus::Accepted)?, 1);
        Ok(())
    }
}
