use std::sync::Arc;

use time::{Date, Duration, OffsetDateTime};

use crate::corpus::ClaimRecord;
use crate::efta::{parse_document_id, UrlResolver};
use crate::unit::{
    DecisionChainInput, Difficulty, DocumentRef, Scaling, UnitConstraints, UnitPayload,
    VerifyFindingInput, WorkUnit, SAFETY_PROHIBITION,
};
use crate::window::{window_end, WindowRef};
use crate::{SefiError, UnitKind};

pub const DEADLINE_HOURS: i64 = 24;

const VERIFY_CONSTRAINTS: UnitConstraints =
    UnitConstraints { max_output_tokens: 2000, pii_filter: true, requires_quorum: false };

const DECISION_CHAIN_CONSTRAINTS: UnitConstraints =
    UnitConstraints { max_output_tokens: 8000, pii_filter: true, requires_quorum: true };

const VERIFY_INSTRUCTIONS: &str = "Review the cited documents at the URLs listed in \
`input.resolved_urls`. Decide whether they support, dispute, or give insufficient evidence for \
the claim in `input.claim_text`. Return JSON with `verdict` (verified, disputed or \
insufficient_evidence), `reasoning`, and `citations` (objects with `efta_number`, optional \
`page_number` and optional `quote`).";

const DECISION_CHAIN_INSTRUCTIONS: &str = "You have a batch of 20-50 document references from \
one 30-day window. Read each document at `input.document_refs[*].url` and map the \
communication graph: who communicated with whom, when, and about what. Return JSON with \
`communication_graph` (objects with `from`, `to`, `when` as an ISO 8601 date, `topic` and \
`efta_reference`) and `patterns_observed`.";

/// Builds validated units from corpus records. URLs come from the injected resolver.
#[derive(Clone)]
pub struct UnitBuilder {
    resolver: Arc<dyn UrlResolver>,
}

impl std::fmt::Debug for UnitBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitBuilder").finish_non_exhaustive()
    }
}

impl UnitBuilder {
    #[must_use]
    pub fn new(resolver: Arc<dyn UrlResolver>) -> Self {
        Self { resolver }
    }

    /// Build a `verify_finding` unit for one claim.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] when the claim cites nothing, its dataset list does not
    /// line up with its citations, an id is malformed, or the finished unit fails validation.
    /// Resolver failures propagate unchanged.
    pub fn build_verify_unit(&self, claim: &ClaimRecord) -> Result<WorkUnit, SefiError> {
        if claim.cited_document_ids.is_empty() {
            return Err(SefiError::Validation(format!(
                "claim `{}` cites no documents",
                claim.claim_id
            )));
        }
        if claim.cited_document_ids.len() != claim.primary_datasets.len() {
            return Err(SefiError::Validation(format!(
                "claim `{}`: cited documents ({}) MUST match primary datasets ({})",
                claim.claim_id,
                claim.cited_document_ids.len(),
                claim.primary_datasets.len()
            )));
        }

        let resolved_urls = claim
            .cited_document_ids
            .iter()
            .zip(&claim.primary_datasets)
            .map(|(document_id, dataset)| {
                let number = parse_document_id(document_id).ok_or_else(|| {
                    SefiError::Validation(format!(
                        "claim `{}`: document id `{document_id}` MUST match EFTA followed by 8 digits",
                        claim.claim_id
                    ))
                })?;
                self.resolver.resolve(number, *dataset)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let created_at = OffsetDateTime::now_utc();
        let unit = WorkUnit {
            unit_id: fresh_unit_id(UnitKind::VerifyFinding),
            research_path: 5,
            difficulty: Difficulty::Low,
            scaling: Scaling::Linear,
            optimal_batch_description: "1 claim".to_string(),
            instructions: with_prohibition(VERIFY_INSTRUCTIONS),
            constraints: VERIFY_CONSTRAINTS,
            created_at,
            deadline: deadline_after(created_at),
            source_verified: claim.source_verified,
            payload: UnitPayload::VerifyFinding(VerifyFindingInput {
                claim_text: claim.claim_text.trim().to_string(),
                cited_document_ids: claim.cited_document_ids.clone(),
                resolved_urls,
            }),
        };
        unit.validate()?;
        Ok(unit)
    }

    /// Build a `decision_chain` unit covering `[window_start, window_start + 30 days]`.
    ///
    /// The caller supplies between 20 and 50 refs; each keeps its metadata and gains a URL.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] when the finished unit fails validation. Resolver
    /// failures propagate unchanged.
    pub fn build_decision_chain_unit(
        &self,
        window_start: Date,
        refs: &[WindowRef],
    ) -> Result<WorkUnit, SefiError> {
        let document_refs = refs
            .iter()
            .map(|doc| {
                Ok(DocumentRef {
                    document_id: doc.document_id.clone(),
                    url: self.resolver.resolve(doc.document_number, doc.dataset)?,
                    extra: doc.extra.clone(),
                })
            })
            .collect::<Result<Vec<_>, SefiError>>()?;

        let created_at = OffsetDateTime::now_utc();
        let unit = WorkUnit {
            unit_id: fresh_unit_id(UnitKind::DecisionChain),
            research_path: 3,
            difficulty: Difficulty::High,
            scaling: Scaling::Multiplying,
            optimal_batch_description: "20-50 docs (same 30-day period)".to_string(),
            instructions: with_prohibition(DECISION_CHAIN_INSTRUCTIONS),
            constraints: DECISION_CHAIN_CONSTRAINTS,
            created_at,
            deadline: deadline_after(created_at),
            source_verified: false,
            payload: UnitPayload::DecisionChain(DecisionChainInput {
                window_start,
                window_end: window_end(window_start),
                document_refs,
            }),
        };
        unit.validate()?;
        Ok(unit)
    }
}

/// `verify-` or `dc-` followed by 12 random hex digits.
#[must_use]
pub fn fresh_unit_id(kind: UnitKind) -> String {
    format!("{}{}", kind.unit_prefix(), random_hex12())
}

#[must_use]
pub(crate) fn random_hex12() -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(12);
    hex
}

fn with_prohibition(template: &str) -> String {
    format!("{template} {SAFETY_PROHIBITION}")
}

fn deadline_after(created_at: OffsetDateTime) -> OffsetDateTime {
    created_at + Duration::hours(DEADLINE_HOURS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efta::CanonicalUrlResolver;
    use std::collections::BTreeSet;
    use time::macros::date;

    struct FixedResolver;

    impl UrlResolver for FixedResolver {
        fn resolve(&self, document_number: u32, _dataset: u8) -> Result<String, SefiError> {
            Ok(format!(
                "https://www.justice.gov/epstein/files/DataSet%201/EFTA{document_number:08}.pdf"
            ))
        }
    }

    fn builder() -> UnitBuilder {
        UnitBuilder::new(Arc::new(CanonicalUrlResolver))
    }

    fn claim(ids: &[&str], datasets: &[u8]) -> ClaimRecord {
        ClaimRecord {
            claim_id: "claim-a".to_string(),
            claim_text: "  The ledger records a wire transfer.  ".to_string(),
            cited_document_ids: ids.iter().map(ToString::to_string).collect(),
            primary_datasets: datasets.to_vec(),
            source_verified: true,
        }
    }

    fn window_refs(count: u32) -> Vec<WindowRef> {
        (1..=count)
            .map(|number| {
                let mut extra = serde_json::Map::new();
                extra.insert("date".to_string(), serde_json::json!("2020-01-05"));
                WindowRef {
                    document_id: format!("EFTA{number:08}"),
                    document_number: number,
                    dataset: 9,
                    date: date!(2020 - 01 - 05),
                    extra,
                }
            })
            .collect()
    }

    #[test]
    fn verify_unit_carries_template_and_resolved_urls() -> Result<(), SefiError> {
        let unit = builder().build_verify_unit(&claim(&["EFTA00039186", "EFTA00000007"], &[9, 2]))?;
        assert!(unit.unit_id.starts_with("verify-"));
        assert_eq!(unit.unit_id.len(), "verify-".len() + 12);
        assert_eq!(unit.deadline - unit.created_at, Duration::hours(DEADLINE_HOURS));
        assert_eq!(unit.research_path, 5);
        assert_eq!(unit.constraints, VERIFY_CONSTRAINTS);
        assert!(unit.source_verified);
        assert!(unit.instructions.ends_with(SAFETY_PROHIBITION));

        let UnitPayload::VerifyFinding(input) = &unit.payload else {
            panic!("expected verify_finding payload");
        };
        assert_eq!(input.claim_text, "The ledger records a wire transfer.");
        assert_eq!(
            input.resolved_urls,
            vec![
                "https://www.justice.gov/epstein/files/DataSet%209/EFTA00039186.pdf".to_string(),
                "https://www.justice.gov/epstein/files/DataSet%202/EFTA00000007.pdf".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn verify_unit_uses_injected_resolver() -> Result<(), SefiError> {
        let unit = UnitBuilder::new(Arc::new(FixedResolver))
            .build_verify_unit(&claim(&["EFTA00000003"], &[9]))?;
        let UnitPayload::VerifyFinding(input) = &unit.payload else {
            panic!("expected verify_finding payload");
        };
        assert!(input.resolved_urls[0].contains("DataSet%201/"));
        Ok(())
    }

    #[test]
    fn verify_unit_rejects_bad_claims() {
        let builder = builder();
        assert!(matches!(builder.build_verify_unit(&claim(&[], &[])), Err(SefiError::Validation(_))));
        assert!(matches!(
            builder.build_verify_unit(&claim(&["EFTA00000001"], &[9, 9])),
            Err(SefiError::Validation(_))
        ));
        assert!(matches!(
            builder.build_verify_unit(&claim(&["DOC1"], &[9])),
            Err(SefiError::Validation(_))
        ));
        assert!(matches!(
            builder.build_verify_unit(&claim(&["EFTA00000001"], &[13])),
            Err(SefiError::Validation(_))
        ));
    }

    #[test]
    fn decision_chain_unit_spans_thirty_days() -> Result<(), SefiError> {
        let unit = builder().build_decision_chain_unit(date!(2020 - 01 - 05), &window_refs(20))?;
        assert!(unit.unit_id.starts_with("dc-"));
        assert!(!unit.source_verified);
        assert_eq!(unit.constraints, DECISION_CHAIN_CONSTRAINTS);
        let UnitPayload::DecisionChain(input) = &unit.payload else {
            panic!("expected decision_chain payload");
        };
        assert_eq!(input.window_end, date!(2020 - 02 - 04));
        assert_eq!(input.document_refs.len(), 20);
        assert_eq!(input.document_refs[0].extra.get("date"), Some(&serde_json::json!("2020-01-05")));
        assert!(input.document_refs[0].url.ends_with("DataSet%209/EFTA00000001.pdf"));
        Ok(())
    }

    #[test]
    fn decision_chain_unit_refuses_undersized_batch() {
        let result = builder().build_decision_chain_unit(date!(2020 - 01 - 05), &window_refs(19));
        assert!(matches!(result, Err(SefiError::Validation(_))));
    }

    #[test]
    fn constraints_are_owned_per_unit() -> Result<(), SefiError> {
        let builder = builder();
        let mut first = builder.build_verify_unit(&claim(&["EFTA00000001"], &[9]))?;
        first.constraints.max_output_tokens = 1;
        let second = builder.build_verify_unit(&claim(&["EFTA00000001"], &[9]))?;
        assert_eq!(second.constraints.max_output_tokens, 2000);
        Ok(())
    }

    #[test]
    fn fresh_ids_do_not_repeat() {
        let ids: BTreeSet<String> =
            (0..1000).map(|_| fresh_unit_id(UnitKind::VerifyFinding)).collect();
        assert_eq!(ids.len(), 1000);
    }
}
