//! Work-unit lifecycle engine: builds verify-finding and decision-chain units from a filtered
//! corpus, tracks their assignment and completion, and screens worker results before they
//! become findings.

mod builder;
mod corpus;
mod efta;
mod error;
mod findings;
mod ledger;
mod unit;
mod validation;
mod window;

pub use builder::{fresh_unit_id, UnitBuilder, DEADLINE_HOURS};
pub use corpus::{
    filter_claims, filter_relationships, ClaimRecord, RelationshipRecord, DOCUMENT_ID_FIELDS,
    PASSTHROUGH_FIELDS,
};
pub use efta::{
    build_url, format_document_id, has_media_suffix, is_document_id, is_document_url,
    parse_document_id, parse_document_url, CanonicalUrlResolver, UrlResolver, DATASET_MAX,
    DATASET_MIN, DEFAULT_DATASET, MEDIA_DATASET, MEDIA_SUFFIXES,
};
pub use error::SefiError;
pub use findings::{
    Finding, FindingStatus, FindingsStore, MemoryFindingsStore, ProvenanceLookup,
    StaticProvenance,
};
pub use ledger::{
    AssignmentLedger, LedgerJournal, LedgerRecord, LedgerStatus, MemoryLedgerJournal, UnitSource,
};
pub use unit::{
    DecisionChainInput, Difficulty, DocumentRef, Scaling, UnitConstraints, UnitKind, UnitPayload,
    VerifyFindingInput, WorkUnit, DECISION_CHAIN_UNIT_PREFIX, SAFETY_PROHIBITION,
    UNIT_ID_HEX_LEN, VERIFY_UNIT_PREFIX,
};
pub use validation::{
    scan_for_pii, PiiMatch, Submission, ValidationOutcome, ValidationPipeline, QUORUM_ACHIEVED,
};
pub use window::{
    has_eligible_window, parse_record_date, select_window, window_end, SelectedWindow, WindowRef,
    BATCH_MAX, BATCH_MIN, WINDOW_DAYS,
};
