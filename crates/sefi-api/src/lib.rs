//! Facade over the SEFI engine: loads configuration and corpus, then runs the
//! generate, assign, submit and complete flow against the findings and corpus databases.

mod config;
mod corpus;
mod logging;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sefi_core::{
    AssignmentLedger, CanonicalUrlResolver, Finding, FindingStatus, FindingsStore, LedgerStatus,
    ProvenanceLookup, SefiError, Submission, UnitKind, ValidationPipeline, WorkUnit,
};
use sefi_store_sqlite::{
    CoverageStats, SchemaStatus, SqliteFindingsStore, SqliteLedgerJournal, SqliteProvenanceLookup,
};
use serde::{Deserialize, Serialize};

pub use config::{normalize_log_level, ConfigError, SefiConfig, LOG_LEVELS};
pub use corpus::{extract_cited_ids, load_claims, load_relationships};
pub use logging::init_tracing;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRequest {
    pub unit_id: String,
    pub worker_id: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub accepted: bool,
    pub finding_id: Option<String>,
    pub quorum_status: String,
    pub pii_detected: bool,
    pub next_unit_available: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    #[serde(flatten)]
    pub ledger: LedgerStatus,
    pub total_findings_accepted: u64,
    pub total_findings_quarantined: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub findings_db_reachable: bool,
}

/// Create the findings database if needed and apply pending migrations.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated.
pub fn migrate_findings_db(path: &Path) -> Result<SchemaStatus> {
    ensure_parent_dir(path)?;
    let mut store = SqliteFindingsStore::open(path)?;
    store.migrate()?;
    store.schema_status()
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display())),
        _ => Ok(()),
    }
}

pub struct SefiApi<S = SqliteFindingsStore, P = SqliteProvenanceLookup> {
    ledger: AssignmentLedger,
    pipeline: ValidationPipeline<S, P>,
}

impl<S, P> std::fmt::Debug for SefiApi<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SefiApi").field("ledger", &self.ledger).finish_non_exhaustive()
    }
}

impl SefiApi {
    /// Load the corpus, open both databases named by `config` and resume the ledger recorded in
    /// the findings database.
    ///
    /// # Errors
    /// Returns an error when the claims file is unusable, either database cannot be opened, or
    /// the recorded ledger is inconsistent.
    pub fn open(config: &SefiConfig) -> Result<Self> {
        let claims = load_claims(&config.claims_path)?;
        let relationships = load_relationships(&config.relationships_path)?;

        ensure_parent_dir(&config.findings_db_path)?;
        let store = SqliteFindingsStore::open_migrated(&config.findings_db_path)?;

        ensure_parent_dir(&config.corpus_db_path)?;
        let provenance = SqliteProvenanceLookup::open(&config.corpus_db_path)?;
        provenance.ensure_schema()?;

        let journal = SqliteLedgerJournal::open(&config.findings_db_path)?;
        let ledger = AssignmentLedger::with_journal(
            claims,
            relationships,
            Arc::new(CanonicalUrlResolver),
            Arc::new(journal),
        )?;
        tracing::info!(
            findings_db = %config.findings_db_path.display(),
            corpus_db = %config.corpus_db_path.display(),
            "sefi api ready"
        );
        Ok(Self::from_parts(ledger, ValidationPipeline::new(store, provenance)))
    }

    /// # Errors
    /// Returns an error for a malformed document id or a failed lookup.
    pub fn findings_for_document(&self, document_id: &str) -> Result<Vec<Finding>> {
        self.pipeline.with_store(|store| store.findings_for_document(document_id))
    }

    /// # Errors
    /// Returns an error when the findings cannot be counted.
    pub fn coverage(&self, kind: UnitKind) -> Result<CoverageStats> {
        self.pipeline.with_store(|store| store.coverage(kind))
    }
}

impl<S: FindingsStore, P: ProvenanceLookup> SefiApi<S, P> {
    #[must_use]
    pub fn from_parts(ledger: AssignmentLedger, pipeline: ValidationPipeline<S, P>) -> Self {
        Self { ledger, pipeline }
    }

    #[must_use]
    pub fn ledger(&self) -> &AssignmentLedger {
        &self.ledger
    }

    #[must_use]
    pub fn pipeline(&self) -> &ValidationPipeline<S, P> {
        &self.pipeline
    }

    /// Generate the next unit of `kind`, or `None` when the corpus is exhausted.
    ///
    /// # Errors
    /// Returns an error when the selected source cannot be built into a valid unit.
    pub fn next_unit(&self, kind: UnitKind) -> Result<Option<WorkUnit>> {
        match self.ledger.next_unit(kind) {
            Ok(unit) => Ok(Some(unit)),
            Err(err) if err.is_exhausted() => {
                tracing::debug!(kind = %kind, "no work units available");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    #[must_use]
    pub fn has_available(&self, kind: UnitKind) -> bool {
        self.ledger.has_available(kind)
    }

    /// # Errors
    /// Returns the ledger's [`SefiError`] for unknown, completed or already assigned units.
    pub fn assign(&self, unit_id: &str, worker_id: &str) -> Result<()> {
        Ok(self.ledger.assign(unit_id, worker_id)?)
    }

    /// # Errors
    /// Returns [`SefiError::UnknownUnit`] for a unit this ledger never registered.
    pub fn complete(&self, unit_id: &str) -> Result<()> {
        Ok(self.ledger.complete(unit_id)?)
    }

    /// Make sure the ledger tracks a unit printed by an earlier process. A unit the ledger
    /// already holds is left as recorded; anything else is adopted from the corpus.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] when a tracked id carries a different kind, otherwise
    /// the ledger's [`SefiError`] when the unit is invalid, foreign or in conflict.
    pub fn adopt(&self, unit: &WorkUnit) -> Result<()> {
        match self.ledger.unit_kind(&unit.unit_id) {
            Some(kind) if kind == unit.kind() => Ok(()),
            Some(kind) => Err(SefiError::Validation(format!(
                "unit {} is tracked as {kind}, not {}",
                unit.unit_id,
                unit.kind()
            ))
            .into()),
            None => Ok(self.ledger.adopt(unit)?),
        }
    }

    /// Validate a worker result and complete the unit when it is accepted.
    ///
    /// # Errors
    /// Returns [`SefiError::UnknownUnit`] for an unregistered unit and
    /// [`SefiError::Collaborator`] when the findings store or provenance lookup fails.
    pub fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        let kind = self
            .ledger
            .unit_kind(&request.unit_id)
            .ok_or_else(|| SefiError::UnknownUnit(request.unit_id.clone()))?;

        let submission = Submission {
            unit_id: request.unit_id.clone(),
            worker_id: request.worker_id.clone(),
            result: request.result.clone(),
            cited_document_ids: extract_cited_ids(&request.result),
            unit_kind: Some(kind),
        };
        let outcome = self.pipeline.validate(&submission)?;

        if outcome.accepted {
            if let Err(err) = self.ledger.complete(&request.unit_id) {
                tracing::warn!(unit_id = %request.unit_id, error = %err, "accepted finding but could not complete unit");
            }
        }

        Ok(SubmitResponse {
            accepted: outcome.accepted,
            finding_id: outcome.finding_id,
            quorum_status: outcome.quorum_status,
            pii_detected: outcome.pii_detected,
            next_unit_available: self.ledger.has_available(kind),
            errors: outcome.errors,
        })
    }

    /// # Errors
    /// Returns an error when the findings store cannot be counted.
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            ledger: self.ledger.status(),
            total_findings_accepted: self.pipeline.count_by_status(FindingStatus::Accepted)?,
            total_findings_quarantined: self
                .pipeline
                .count_by_status(FindingStatus::Quarantined)?,
        })
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        let findings_db_reachable = self.pipeline.count_by_status(FindingStatus::Accepted).is_ok();
        HealthReport {
            status: if findings_db_reachable { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            findings_db_reachable,
        }
    }
}
