use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::builder::UnitBuilder;
use crate::corpus::{filter_claims, filter_relationships, ClaimRecord, RelationshipRecord};
use crate::efta::UrlResolver;
use crate::window::{has_eligible_window, select_window, usable_refs};
use crate::{SefiError, UnitKind, UnitPayload, WorkUnit};

/// What a registered unit consumes from the corpus while it is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    Claim(String),
    Refs(BTreeSet<String>),
}

impl UnitSource {
    fn kind(&self) -> UnitKind {
        match self {
            Self::Claim(_) => UnitKind::VerifyFinding,
            Self::Refs(_) => UnitKind::DecisionChain,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerStatus {
    pub total_claims: usize,
    pub total_relationships: usize,
    pub total_generated: usize,
    /// Units bound to a worker and not yet completed.
    pub total_assigned: usize,
    pub total_assigned_ever: usize,
    pub total_completed: usize,
}

/// Durable form of one ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    pub unit_id: String,
    pub kind: UnitKind,
    pub claim_id: Option<String>,
    #[serde(default)]
    pub document_ids: Vec<String>,
    pub worker_id: Option<String>,
    pub ever_assigned: bool,
    pub completed: bool,
}

impl LedgerRecord {
    fn generated(unit: &WorkUnit, source: &UnitSource) -> Self {
        let (claim_id, document_ids) = match source {
            UnitSource::Claim(claim_id) => (Some(claim_id.clone()), Vec::new()),
            UnitSource::Refs(refs) => (None, refs.iter().cloned().collect()),
        };
        Self {
            unit_id: unit.unit_id.clone(),
            kind: unit.kind(),
            claim_id,
            document_ids,
            worker_id: None,
            ever_assigned: false,
            completed: false,
        }
    }
}

/// Write-through home for ledger transitions, shared by every process that opens it.
///
/// Each `record_*` call is the authority for its transition: the ledger applies a change in
/// memory only after the journal accepted it.
pub trait LedgerJournal: Send + Sync {
    /// Every unit recorded so far, in generation order.
    ///
    /// # Errors
    /// Returns [`SefiError::Collaborator`] when the journal cannot be read.
    fn load(&self) -> Result<Vec<LedgerRecord>, SefiError>;

    /// # Errors
    /// Returns [`SefiError::DuplicateUnit`] for a known id, [`SefiError::SourceInFlight`] when
    /// another live unit holds the claim or a document, and [`SefiError::Collaborator`] on
    /// journal failure.
    fn record_generated(&self, record: &LedgerRecord) -> Result<(), SefiError>;

    /// # Errors
    /// Returns [`SefiError::UnknownUnit`], [`SefiError::AlreadyCompleted`] or
    /// [`SefiError::AlreadyAssigned`] as the journal sees the unit, and
    /// [`SefiError::Collaborator`] on journal failure.
    fn record_assigned(&self, unit_id: &str, worker_id: &str) -> Result<(), SefiError>;

    /// Completing a completed unit is a no-op.
    ///
    /// # Errors
    /// Returns [`SefiError::UnknownUnit`] for an unrecorded unit and
    /// [`SefiError::Collaborator`] on journal failure.
    fn record_completed(&self, unit_id: &str) -> Result<(), SefiError>;
}

/// Journal kept in process memory. Ledgers sharing one instance behave like separate
/// processes sharing one database.
#[derive(Debug, Default)]
pub struct MemoryLedgerJournal {
    records: Mutex<Vec<LedgerRecord>>,
}

impl MemoryLedgerJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerJournal for MemoryLedgerJournal {
    fn load(&self) -> Result<Vec<LedgerRecord>, SefiError> {
        Ok(self.records.lock().clone())
    }

    fn record_generated(&self, record: &LedgerRecord) -> Result<(), SefiError> {
        let mut records = self.records.lock();
        if records.iter().any(|known| known.unit_id == record.unit_id) {
            return Err(SefiError::DuplicateUnit(record.unit_id.clone()));
        }
        for live in records.iter().filter(|known| !known.completed) {
            if record.claim_id.is_some() && live.claim_id == record.claim_id {
                return Err(SefiError::SourceInFlight(format!(
                    "claim is held by live unit {}",
                    live.unit_id
                )));
            }
            if let Some(locked) = record.document_ids.iter().find(|id| live.document_ids.contains(id)) {
                return Err(SefiError::SourceInFlight(format!(
                    "document {locked} is held by live unit {}",
                    live.unit_id
                )));
            }
        }
        records.push(record.clone());
        Ok(())
    }

    fn record_assigned(&self, unit_id: &str, worker_id: &str) -> Result<(), SefiError> {
        let mut records = self.records.lock();
        let Some(record) = records.iter_mut().find(|known| known.unit_id == unit_id) else {
            return Err(SefiError::UnknownUnit(unit_id.to_string()));
        };
        if record.completed {
            return Err(SefiError::AlreadyCompleted(unit_id.to_string()));
        }
        if let Some(current) = &record.worker_id {
            return Err(SefiError::AlreadyAssigned {
                unit_id: unit_id.to_string(),
                worker_id: current.clone(),
            });
        }
        record.worker_id = Some(worker_id.to_string());
        record.ever_assigned = true;
        Ok(())
    }

    fn record_completed(&self, unit_id: &str) -> Result<(), SefiError> {
        let mut records = self.records.lock();
        let Some(record) = records.iter_mut().find(|known| known.unit_id == unit_id) else {
            return Err(SefiError::UnknownUnit(unit_id.to_string()));
        };
        record.completed = true;
        record.worker_id = None;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct UnitEntry {
    kind: UnitKind,
    worker_id: Option<String>,
    ever_assigned: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    units: BTreeMap<String, UnitEntry>,
    completed: BTreeSet<String>,
    claim_in_flight: BTreeMap<String, String>,
    unit_claim: BTreeMap<String, String>,
    consumed_refs: BTreeMap<String, BTreeSet<String>>,
    active_refs: BTreeSet<String>,
}

impl LedgerState {
    fn next_free_claim<'a>(&self, claims: &'a [ClaimRecord]) -> Option<&'a ClaimRecord> {
        claims.iter().find(|claim| !self.claim_in_flight.contains_key(&claim.claim_id))
    }

    fn register(&mut self, unit: &WorkUnit, source: UnitSource) -> Result<(), SefiError> {
        let unit_id = unit.unit_id.as_str();
        if self.units.contains_key(unit_id) {
            return Err(SefiError::DuplicateUnit(unit_id.to_string()));
        }
        if source.kind() != unit.kind() {
            return Err(SefiError::Validation(format!(
                "{} unit {unit_id} cannot consume a {} source",
                unit.kind(),
                source.kind()
            )));
        }

        match source {
            UnitSource::Claim(claim_id) => {
                if let Some(live) = self.claim_in_flight.get(&claim_id) {
                    return Err(SefiError::SourceInFlight(format!(
                        "claim {claim_id} is held by live unit {live}"
                    )));
                }
                self.claim_in_flight.insert(claim_id.clone(), unit_id.to_string());
                self.unit_claim.insert(unit_id.to_string(), claim_id);
            }
            UnitSource::Refs(refs) => {
                if refs.is_empty() {
                    return Err(SefiError::Validation(format!(
                        "decision_chain unit {unit_id} MUST consume at least one document"
                    )));
                }
                if let Some(locked) = refs.iter().find(|id| self.active_refs.contains(*id)) {
                    return Err(SefiError::SourceInFlight(format!(
                        "document {locked} is held by a live unit"
                    )));
                }
                self.active_refs.extend(refs.iter().cloned());
                self.consumed_refs.insert(unit_id.to_string(), refs);
            }
        }

        self.units.insert(
            unit_id.to_string(),
            UnitEntry { kind: unit.kind(), worker_id: None, ever_assigned: false },
        );
        Ok(())
    }

    /// Undo a [`LedgerState::register`] whose journal write failed.
    fn forget(&mut self, unit_id: &str) {
        self.units.remove(unit_id);
        if let Some(claim_id) = self.unit_claim.remove(unit_id) {
            self.claim_in_flight.remove(&claim_id);
        }
        for document_id in self.consumed_refs.remove(unit_id).unwrap_or_default() {
            self.active_refs.remove(&document_id);
        }
    }

    fn restore(&mut self, records: Vec<LedgerRecord>) -> Result<(), SefiError> {
        for record in records {
            if self.units.contains_key(&record.unit_id) {
                return Err(SefiError::DuplicateUnit(record.unit_id));
            }
            if record.completed {
                self.completed.insert(record.unit_id.clone());
            } else {
                if let Some(claim_id) = &record.claim_id {
                    let previous =
                        self.claim_in_flight.insert(claim_id.clone(), record.unit_id.clone());
                    if let Some(live) = previous {
                        return Err(SefiError::SourceInFlight(format!(
                            "journal holds claim {claim_id} for both {live} and {}",
                            record.unit_id
                        )));
                    }
                    self.unit_claim.insert(record.unit_id.clone(), claim_id.clone());
                }
                if !record.document_ids.is_empty() {
                    let refs: BTreeSet<String> = record.document_ids.iter().cloned().collect();
                    if let Some(locked) = refs.iter().find(|id| self.active_refs.contains(*id)) {
                        return Err(SefiError::SourceInFlight(format!(
                            "journal holds document {locked} for more than one live unit"
                        )));
                    }
                    self.active_refs.extend(refs.iter().cloned());
                    self.consumed_refs.insert(record.unit_id.clone(), refs);
                }
            }
            self.units.insert(
                record.unit_id,
                UnitEntry {
                    kind: record.kind,
                    worker_id: record.worker_id.filter(|_| !record.completed),
                    ever_assigned: record.ever_assigned,
                },
            );
        }
        Ok(())
    }
}

/// Tracks every unit from generation to completion and keeps live units from sharing sources.
///
/// All state sits behind one mutex, so selection, registration, assignment and release are
/// atomic with respect to each other.
pub struct AssignmentLedger {
    claims: Vec<ClaimRecord>,
    relationships: Vec<RelationshipRecord>,
    builder: UnitBuilder,
    journal: Option<Arc<dyn LedgerJournal>>,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for AssignmentLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentLedger")
            .field("claims", &self.claims.len())
            .field("relationships", &self.relationships.len())
            .field("journaled", &self.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl AssignmentLedger {
    /// Filter the corpus once and start with an empty ledger.
    #[must_use]
    pub fn new(
        claims: Vec<ClaimRecord>,
        relationships: Vec<RelationshipRecord>,
        resolver: Arc<dyn UrlResolver>,
    ) -> Self {
        Self {
            claims: filter_claims(claims),
            relationships: filter_relationships(relationships),
            builder: UnitBuilder::new(resolver),
            journal: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Like [`AssignmentLedger::new`], but resume from `journal` and write every later
    /// transition through it.
    ///
    /// # Errors
    /// Returns the journal's load error, or [`SefiError::DuplicateUnit`] /
    /// [`SefiError::SourceInFlight`] when the recorded state is inconsistent.
    pub fn with_journal(
        claims: Vec<ClaimRecord>,
        relationships: Vec<RelationshipRecord>,
        resolver: Arc<dyn UrlResolver>,
        journal: Arc<dyn LedgerJournal>,
    ) -> Result<Self, SefiError> {
        let mut ledger = Self::new(claims, relationships, resolver);
        let records = journal.load()?;
        let restored = records.len();
        ledger.state.get_mut().restore(records)?;
        ledger.journal = Some(journal);
        tracing::info!(restored, "resumed assignment ledger from journal");
        Ok(ledger)
    }

    fn admit(
        &self,
        state: &mut LedgerState,
        unit: &WorkUnit,
        source: UnitSource,
    ) -> Result<(), SefiError> {
        let record = LedgerRecord::generated(unit, &source);
        state.register(unit, source)?;
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_generated(&record) {
                state.forget(&unit.unit_id);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Select a source, build the unit and register it in one step.
    ///
    /// # Errors
    /// Returns [`SefiError::NoUnitsAvailable`] when nothing is eligible and
    /// [`SefiError::Validation`] when the selected source cannot be built into a valid unit.
    pub fn next_unit(&self, kind: UnitKind) -> Result<WorkUnit, SefiError> {
        let mut state = self.state.lock();
        let (unit, source) = match kind {
            UnitKind::VerifyFinding => {
                let claim = state.next_free_claim(&self.claims).ok_or_else(|| {
                    SefiError::NoUnitsAvailable(
                        "no available claims; all are assigned or in flight".to_string(),
                    )
                })?;
                let unit = self.builder.build_verify_unit(claim)?;
                (unit, UnitSource::Claim(claim.claim_id.clone()))
            }
            UnitKind::DecisionChain => {
                let window = select_window(&self.relationships, &state.active_refs)?;
                let unit = self.builder.build_decision_chain_unit(window.window_start, &window.refs)?;
                (unit, UnitSource::Refs(window.document_ids()))
            }
        };
        self.admit(&mut state, &unit, source)?;
        tracing::info!(unit_id = %unit.unit_id, kind = %kind, "generated work unit");
        Ok(unit)
    }

    /// # Errors
    /// See [`AssignmentLedger::next_unit`].
    pub fn next_claim(&self) -> Result<WorkUnit, SefiError> {
        self.next_unit(UnitKind::VerifyFinding)
    }

    /// # Errors
    /// See [`AssignmentLedger::next_unit`].
    pub fn next_window(&self) -> Result<WorkUnit, SefiError> {
        self.next_unit(UnitKind::DecisionChain)
    }

    /// Whether [`AssignmentLedger::next_unit`] has a source to draw from. Generates nothing.
    #[must_use]
    pub fn has_available(&self, kind: UnitKind) -> bool {
        let state = self.state.lock();
        match kind {
            UnitKind::VerifyFinding => state.next_free_claim(&self.claims).is_some(),
            UnitKind::DecisionChain => has_eligible_window(&self.relationships, &state.active_refs),
        }
    }

    /// Record a unit built elsewhere as generated and unassigned.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] for an invalid unit or a source of the wrong kind,
    /// [`SefiError::DuplicateUnit`] for a known id, and [`SefiError::SourceInFlight`] when the
    /// claim or any document is held by a live unit.
    pub fn register(&self, unit: &WorkUnit, source: UnitSource) -> Result<(), SefiError> {
        unit.validate()?;
        self.admit(&mut self.state.lock(), unit, source)?;
        tracing::info!(unit_id = %unit.unit_id, kind = %unit.kind(), "registered work unit");
        Ok(())
    }

    /// The corpus source a unit was built from, if it still matches the filtered corpus.
    ///
    /// A decision chain matches only when every ref is a usable relationship document dated
    /// inside the unit's window.
    #[must_use]
    pub fn source_of(&self, unit: &WorkUnit) -> Option<UnitSource> {
        match &unit.payload {
            UnitPayload::VerifyFinding(input) => self
                .claims
                .iter()
                .find(|claim| {
                    claim.claim_text.trim() == input.claim_text.trim()
                        && claim.cited_document_ids == input.cited_document_ids
                })
                .map(|claim| UnitSource::Claim(claim.claim_id.clone())),
            UnitPayload::DecisionChain(input) => {
                let mut dates: BTreeMap<String, Vec<_>> = BTreeMap::new();
                for doc in usable_refs(&self.relationships, &BTreeSet::new()) {
                    dates.entry(doc.document_id).or_default().push(doc.date);
                }
                let in_window = |document_id: &str| {
                    dates.get(document_id).is_some_and(|days| {
                        days.iter()
                            .any(|day| *day >= input.window_start && *day <= input.window_end)
                    })
                };
                let stray = input.document_refs.iter().find(|doc| !in_window(doc.document_id.as_str()));
                if let Some(stray) = stray {
                    tracing::debug!(
                        unit_id = %unit.unit_id,
                        document_id = %stray.document_id,
                        "decision chain ref is not a corpus document inside the window"
                    );
                    return None;
                }
                Some(UnitSource::Refs(
                    input.document_refs.iter().map(|doc| doc.document_id.clone()).collect(),
                ))
            }
        }
    }

    /// Register a unit generated by an earlier process against this ledger's corpus.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] when the loaded corpus did not produce the unit, otherwise
    /// the errors of [`AssignmentLedger::register`].
    pub fn adopt(&self, unit: &WorkUnit) -> Result<(), SefiError> {
        let source = self.source_of(unit).ok_or_else(|| {
            SefiError::Validation(format!(
                "unit {} does not derive from the loaded corpus",
                unit.unit_id
            ))
        })?;
        self.register(unit, source)
    }

    /// Bind `worker_id` to a generated unit.
    ///
    /// # Errors
    /// Returns [`SefiError::UnknownUnit`], [`SefiError::AlreadyCompleted`] or
    /// [`SefiError::AlreadyAssigned`], checked in that order, and [`SefiError::Validation`] for an
    /// empty worker id.
    pub fn assign(&self, unit_id: &str, worker_id: &str) -> Result<(), SefiError> {
        if worker_id.trim().is_empty() {
            return Err(SefiError::Validation("worker_id MUST be provided".to_string()));
        }

        let mut state = self.state.lock();
        if !state.units.contains_key(unit_id) {
            return Err(SefiError::UnknownUnit(unit_id.to_string()));
        }
        if state.completed.contains(unit_id) {
            return Err(SefiError::AlreadyCompleted(unit_id.to_string()));
        }
        let Some(entry) = state.units.get_mut(unit_id) else {
            return Err(SefiError::UnknownUnit(unit_id.to_string()));
        };
        if let Some(current) = &entry.worker_id {
            return Err(SefiError::AlreadyAssigned {
                unit_id: unit_id.to_string(),
                worker_id: current.clone(),
            });
        }
        if let Some(journal) = &self.journal {
            journal.record_assigned(unit_id, worker_id)?;
        }
        entry.worker_id = Some(worker_id.to_string());
        entry.ever_assigned = true;
        tracing::info!(unit_id, worker_id, "assigned work unit");
        Ok(())
    }

    /// Mark a unit complete and release its claim and documents. Completing twice is a no-op.
    ///
    /// # Errors
    /// Returns [`SefiError::UnknownUnit`] when the unit was never registered.
    pub fn complete(&self, unit_id: &str) -> Result<(), SefiError> {
        let mut state = self.state.lock();
        if !state.units.contains_key(unit_id) {
            return Err(SefiError::UnknownUnit(unit_id.to_string()));
        }
        if state.completed.contains(unit_id) {
            tracing::debug!(unit_id, "unit already completed");
            return Ok(());
        }
        if let Some(journal) = &self.journal {
            journal.record_completed(unit_id)?;
        }
        state.completed.insert(unit_id.to_string());
        if let Some(entry) = state.units.get_mut(unit_id) {
            entry.worker_id = None;
        }

        if let Some(claim_id) = state.unit_claim.remove(unit_id) {
            if state.claim_in_flight.get(&claim_id).map(String::as_str) == Some(unit_id) {
                state.claim_in_flight.remove(&claim_id);
            }
        }
        let released = state.consumed_refs.remove(unit_id).unwrap_or_default();
        for document_id in &released {
            state.active_refs.remove(document_id);
        }

        tracing::info!(unit_id, released_documents = released.len(), "completed work unit");
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> LedgerStatus {
        let state = self.state.lock();
        LedgerStatus {
            total_claims: self.claims.len(),
            total_relationships: self.relationships.len(),
            total_generated: state.units.len(),
            total_assigned: state.units.values().filter(|entry| entry.worker_id.is_some()).count(),
            total_assigned_ever: state.units.values().filter(|entry| entry.ever_assigned).count(),
            total_completed: state.completed.len(),
        }
    }

    #[must_use]
    pub fn unit_kind(&self, unit_id: &str) -> Option<UnitKind> {
        self.state.lock().units.get(unit_id).map(|entry| entry.kind)
    }

    #[must_use]
    pub fn is_completed(&self, unit_id: &str) -> bool {
        self.state.lock().completed.contains(unit_id)
    }
}
