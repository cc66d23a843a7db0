use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sefi_core::{
    parse_document_id, Finding, FindingStatus, FindingsStore, LedgerJournal, LedgerRecord,
    ProvenanceLookup, SefiError, UnitKind,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS findings (
  finding_id TEXT PRIMARY KEY,
  unit_id TEXT NOT NULL,
  unit_type TEXT CHECK (unit_type IS NULL OR unit_type IN ('verify_finding','decision_chain')),
  worker_id TEXT NOT NULL,
  submitted_at TEXT NOT NULL,
  validated_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','accepted','disputed','quarantined')),
  result_json TEXT NOT NULL,
  result_sha256 TEXT NOT NULL,
  quorum_count INTEGER NOT NULL DEFAULT 1 CHECK (quorum_count >= 0)
);

CREATE INDEX IF NOT EXISTS idx_findings_unit_status ON findings(unit_id, status);

CREATE TABLE IF NOT EXISTS citations (
  finding_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  document_id TEXT NOT NULL,
  PRIMARY KEY (finding_id, position),
  FOREIGN KEY (finding_id) REFERENCES findings(finding_id)
);

CREATE INDEX IF NOT EXISTS idx_citations_document ON citations(document_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ledger_units (
  unit_id TEXT PRIMARY KEY,
  unit_type TEXT NOT NULL CHECK (unit_type IN ('verify_finding','decision_chain')),
  claim_id TEXT,
  worker_id TEXT,
  ever_assigned INTEGER NOT NULL DEFAULT 0 CHECK (ever_assigned IN (0, 1)),
  completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
  generated_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_units_live_claim
  ON ledger_units(claim_id) WHERE claim_id IS NOT NULL AND completed = 0;

CREATE TABLE IF NOT EXISTS ledger_refs (
  unit_id TEXT NOT NULL,
  document_id TEXT NOT NULL,
  live INTEGER NOT NULL DEFAULT 1 CHECK (live IN (0, 1)),
  PRIMARY KEY (unit_id, document_id),
  FOREIGN KEY (unit_id) REFERENCES ledger_units(unit_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_refs_live_document
  ON ledger_refs(document_id) WHERE live = 1;
";

const PROVENANCE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS efta_mapping (
  dataset_number INTEGER NOT NULL CHECK (dataset_number BETWEEN 1 AND 12),
  range_start INTEGER NOT NULL,
  range_end INTEGER NOT NULL,
  CHECK (range_start <= range_end)
);

CREATE TABLE IF NOT EXISTS entities (
  entity_id TEXT PRIMARY KEY,
  entity_type TEXT,
  name TEXT
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Accepted share of the findings recorded for one unit kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoverageStats {
    pub unit_type: UnitKind,
    pub units_completed: u64,
    pub units_total: u64,
    /// 0.0 to 100.0, two decimals.
    pub percent: f64,
}

#[derive(Debug)]
pub struct SqliteFindingsStore {
    conn: Connection,
}

impl SqliteFindingsStore {
    /// Open a SQLite findings database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        Ok(Self { conn })
    }

    /// Open and bring the schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied findings schema migration");
        }

        if version < 2 {
            let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
            tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
            record_schema_version(&tx, 2)?;
            tx.commit().context("failed to commit migration v2")?;
            tracing::info!(version = 2, "applied findings schema migration");
        }

        Ok(())
    }

    /// Insert a finding and its citations. An existing `finding_id` is left untouched.
    ///
    /// # Errors
    /// Returns an error when serialization or the write transaction fails.
    pub fn insert_finding(&mut self, finding: &Finding) -> Result<bool> {
        let result_json =
            serde_json::to_string(&finding.result).context("failed to serialize finding result")?;
        let result_sha256 = format!("sha256:{}", hex::encode(Sha256::digest(result_json.as_bytes())));

        let tx = self.conn.transaction().context("failed to start finding transaction")?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO findings(
                    finding_id, unit_id, unit_type, worker_id, submitted_at, validated_at,
                    status, result_json, result_sha256, quorum_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    finding.finding_id,
                    finding.unit_id,
                    finding.unit_kind.map(UnitKind::as_str),
                    finding.worker_id,
                    rfc3339(finding.submitted_at)?,
                    rfc3339(finding.validated_at)?,
                    finding.status.as_str(),
                    result_json,
                    result_sha256,
                    finding.quorum_count,
                ],
            )
            .with_context(|| format!("failed to insert finding {}", finding.finding_id))?;

        if inserted == 1 {
            for (position, document_id) in finding.cited_document_ids.iter().enumerate() {
                let position = i64::try_from(position).context("citation position overflow")?;
                tx.execute(
                    "INSERT INTO citations(finding_id, position, document_id) VALUES (?1, ?2, ?3)",
                    params![finding.finding_id, position, document_id],
                )
                .with_context(|| format!("failed to insert citation for {}", finding.finding_id))?;
            }
        }
        tx.commit().context("failed to commit finding transaction")?;

        Ok(inserted == 1)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn accepted_finding_for_unit(&self, unit_id: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT finding_id FROM findings
                 WHERE unit_id = ?1 AND status = 'accepted'
                 ORDER BY validated_at ASC, rowid ASC
                 LIMIT 1",
                params![unit_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up accepted finding for {unit_id}"))
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_status(&self, status: FindingStatus) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM findings WHERE status = ?1",
                params![status.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count {} findings", status.as_str()))?;
        u64::try_from(count).context("negative finding count")
    }

    /// Retrieve one finding with its citations in submission order.
    ///
    /// # Errors
    /// Returns an error when lookup or decoding of stored columns fails.
    pub fn get(&self, finding_id: &str) -> Result<Option<Finding>> {
        let row = self
            .conn
            .query_row(
                "SELECT unit_id, unit_type, worker_id, submitted_at, validated_at, status,
                        result_json, quorum_count
                 FROM findings WHERE finding_id = ?1",
                params![finding_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, u32>(7)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to read finding {finding_id}"))?;

        let Some((unit_id, unit_type, worker_id, submitted_at, validated_at, status, result, quorum)) =
            row
        else {
            return Ok(None);
        };

        let unit_kind = match unit_type {
            Some(raw) => Some(
                UnitKind::parse(&raw).ok_or_else(|| anyhow!("invalid unit_type in findings: {raw}"))?,
            ),
            None => None,
        };
        let status = FindingStatus::parse(&status)
            .ok_or_else(|| anyhow!("invalid finding status in findings: {status}"))?;

        let mut stmt = self
            .conn
            .prepare("SELECT document_id FROM citations WHERE finding_id = ?1 ORDER BY position")?;
        let cited_document_ids = stmt
            .query_map(params![finding_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read citations for {finding_id}"))?;

        Ok(Some(Finding {
            finding_id: finding_id.to_string(),
            unit_id,
            unit_kind,
            worker_id,
            status,
            submitted_at: parse_rfc3339(&submitted_at)?,
            validated_at: parse_rfc3339(&validated_at)?,
            result: serde_json::from_str(&result).context("failed to decode stored result_json")?,
            cited_document_ids,
            quorum_count: quorum,
        }))
    }

    /// Every finding citing `document_id`, oldest first.
    ///
    /// # Errors
    /// Returns [`SefiError::Validation`] in the chain for a malformed id, otherwise an error when
    /// lookup or decoding fails.
    pub fn findings_for_document(&self, document_id: &str) -> Result<Vec<Finding>> {
        if parse_document_id(document_id).is_none() {
            return Err(SefiError::Validation(format!(
                "document id `{document_id}` MUST match EFTA followed by 8 digits"
            ))
            .into());
        }

        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT f.finding_id FROM findings f
             JOIN citations c ON c.finding_id = f.finding_id
             WHERE c.document_id = ?1
             ORDER BY f.validated_at ASC, f.finding_id ASC",
        )?;
        let finding_ids = stmt
            .query_map(params![document_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to look up findings citing {document_id}"))?;

        let mut findings = Vec::with_capacity(finding_ids.len());
        for finding_id in finding_ids {
            if let Some(finding) = self.get(&finding_id)? {
                findings.push(finding);
            }
        }
        Ok(findings)
    }

    /// # Errors
    /// Returns an error when either count query fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn coverage(&self, kind: UnitKind) -> Result<CoverageStats> {
        let (total, completed) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'accepted'), 0)
                 FROM findings WHERE unit_type = ?1",
                params![kind.as_str()],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .with_context(|| format!("failed to compute {kind} coverage"))?;
        let units_total = u64::try_from(total).context("negative finding count")?;
        let units_completed = u64::try_from(completed).context("negative finding count")?;
        let percent = if units_total == 0 {
            0.0
        } else {
            (units_completed as f64 / units_total as f64 * 10_000.0).round() / 100.0
        };
        Ok(CoverageStats { unit_type: kind, units_completed, units_total, percent })
    }

    /// Run SQLite's quick integrity check.
    ///
    /// # Errors
    /// Returns an error when the pragma cannot run.
    pub fn quick_check(&self) -> Result<bool> {
        let message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;
        Ok(message == "ok")
    }
}

impl FindingsStore for SqliteFindingsStore {
    fn store(&mut self, finding: &Finding) -> Result<String, SefiError> {
        self.insert_finding(finding).map_err(collaborator)?;
        Ok(finding.finding_id.clone())
    }

    fn existing_accepted_finding_id(&self, unit_id: &str) -> Result<Option<String>, SefiError> {
        self.accepted_finding_for_unit(unit_id).map_err(collaborator)
    }

    fn count_by_status(&self, status: FindingStatus) -> Result<u64, SefiError> {
        self.count_status(status).map_err(collaborator)
    }
}

/// Assignment ledger persisted in the findings database, so every process opening the same
/// file sees one ledger. Live-source exclusivity is enforced by partial unique indexes.
#[derive(Debug)]
pub struct SqliteLedgerJournal {
    conn: Mutex<Connection>,
}

impl SqliteLedgerJournal {
    /// Open the journal over a findings database that is already migrated.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or predates the ledger tables.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let version = current_schema_version(&conn)?;
        if version < 2 {
            return Err(anyhow!(
                "findings database at schema version {version} has no ledger tables; run `db migrate`"
            ));
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// # Errors
    /// Returns an error when a row cannot be read or decoded.
    pub fn records(&self) -> Result<Vec<LedgerRecord>> {
        let conn = self.conn.lock();

        let mut refs: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut stmt = conn
            .prepare("SELECT unit_id, document_id FROM ledger_refs ORDER BY unit_id, document_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read ledger_refs")?;
        for (unit_id, document_id) in rows {
            refs.entry(unit_id).or_default().push(document_id);
        }

        let mut stmt = conn.prepare(
            "SELECT unit_id, unit_type, claim_id, worker_id, ever_assigned, completed
             FROM ledger_units ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read ledger_units")?;

        rows.into_iter()
            .map(|(unit_id, unit_type, claim_id, worker_id, ever_assigned, completed)| {
                let kind = UnitKind::parse(&unit_type)
                    .ok_or_else(|| anyhow!("invalid unit_type in ledger_units: {unit_type}"))?;
                let document_ids = refs.remove(&unit_id).unwrap_or_default();
                Ok(LedgerRecord {
                    unit_id,
                    kind,
                    claim_id,
                    document_ids,
                    worker_id,
                    ever_assigned,
                    completed,
                })
            })
            .collect()
    }

    /// # Errors
    /// Returns [`SefiError::DuplicateUnit`] or [`SefiError::SourceInFlight`] wrapped in the
    /// error chain on conflict, otherwise an error when the write fails.
    pub fn insert_generated(&self, record: &LedgerRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start ledger transaction")?;

        let known = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_units WHERE unit_id = ?1)",
                params![record.unit_id],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to query ledger_units")?;
        if known {
            return Err(SefiError::DuplicateUnit(record.unit_id.clone()).into());
        }

        tx.execute(
            "INSERT INTO ledger_units(unit_id, unit_type, claim_id, generated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.unit_id,
                record.kind.as_str(),
                record.claim_id,
                rfc3339(OffsetDateTime::now_utc())?
            ],
        )
        .map_err(|err| source_conflict(err, &record.unit_id))?;

        for document_id in &record.document_ids {
            tx.execute(
                "INSERT INTO ledger_refs(unit_id, document_id) VALUES (?1, ?2)",
                params![record.unit_id, document_id],
            )
            .map_err(|err| source_conflict(err, &record.unit_id))?;
        }

        tx.commit().context("failed to commit ledger transaction")?;
        Ok(())
    }

    /// Bind a worker only when the unit is live and unbound.
    ///
    /// # Errors
    /// Returns the matching [`SefiError`] state error in the chain when the guard fails.
    pub fn mark_assigned(&self, unit_id: &str, worker_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn
            .execute(
                "UPDATE ledger_units SET worker_id = ?2, ever_assigned = 1
                 WHERE unit_id = ?1 AND completed = 0 AND worker_id IS NULL",
                params![unit_id, worker_id],
            )
            .with_context(|| format!("failed to assign {unit_id}"))?;
        if updated == 1 {
            return Ok(());
        }

        let current = conn
            .query_row(
                "SELECT completed, worker_id FROM ledger_units WHERE unit_id = ?1",
                params![unit_id],
                |row| Ok((row.get::<_, bool>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read ledger state of {unit_id}"))?;
        let err = match current {
            None => SefiError::UnknownUnit(unit_id.to_string()),
            Some((true, _)) => SefiError::AlreadyCompleted(unit_id.to_string()),
            Some((false, holder)) => SefiError::AlreadyAssigned {
                unit_id: unit_id.to_string(),
                worker_id: holder.unwrap_or_default(),
            },
        };
        Err(err.into())
    }

    /// Mark a unit completed and release its documents. Already completed units are left alone.
    ///
    /// # Errors
    /// Returns [`SefiError::UnknownUnit`] in the chain for an unrecorded unit, otherwise an error
    /// when the write fails.
    pub fn mark_completed(&self, unit_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start ledger transaction")?;
        let known = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM ledger_units WHERE unit_id = ?1)",
                params![unit_id],
                |row| row.get::<_, bool>(0),
            )
            .context("failed to query ledger_units")?;
        if !known {
            return Err(SefiError::UnknownUnit(unit_id.to_string()).into());
        }

        tx.execute(
            "UPDATE ledger_units SET completed = 1, worker_id = NULL, completed_at = ?2
             WHERE unit_id = ?1 AND completed = 0",
            params![unit_id, rfc3339(OffsetDateTime::now_utc())?],
        )
        .with_context(|| format!("failed to complete {unit_id}"))?;
        tx.execute("UPDATE ledger_refs SET live = 0 WHERE unit_id = ?1", params![unit_id])
            .with_context(|| format!("failed to release documents of {unit_id}"))?;
        tx.commit().context("failed to commit ledger transaction")?;
        Ok(())
    }
}

impl LedgerJournal for SqliteLedgerJournal {
    fn load(&self) -> Result<Vec<LedgerRecord>, SefiError> {
        self.records().map_err(collaborator)
    }

    fn record_generated(&self, record: &LedgerRecord) -> Result<(), SefiError> {
        self.insert_generated(record).map_err(ledger_error)
    }

    fn record_assigned(&self, unit_id: &str, worker_id: &str) -> Result<(), SefiError> {
        self.mark_assigned(unit_id, worker_id).map_err(ledger_error)
    }

    fn record_completed(&self, unit_id: &str) -> Result<(), SefiError> {
        self.mark_completed(unit_id).map_err(ledger_error)
    }
}

/// Provenance backed by the ingested `efta_mapping` and `entities` tables.
#[derive(Debug)]
pub struct SqliteProvenanceLookup {
    conn: Mutex<Connection>,
}

impl SqliteProvenanceLookup {
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: Mutex::new(open_connection(path)?) })
    }

    /// Create the lookup tables when the ingest step has not.
    ///
    /// # Errors
    /// Returns an error when the DDL fails.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(PROVENANCE_SCHEMA_SQL)
            .context("failed to apply provenance schema")
    }

    /// # Errors
    /// Returns an error when the insert fails or violates table checks.
    pub fn insert_range(&self, dataset: u8, range_start: u32, range_end: u32) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO efta_mapping(dataset_number, range_start, range_end) VALUES (?1, ?2, ?3)",
                params![dataset, range_start, range_end],
            )
            .with_context(|| format!("failed to insert range {range_start}..={range_end}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_entity(&self, entity_id: &str, entity_type: Option<&str>) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR IGNORE INTO entities(entity_id, entity_type) VALUES (?1, ?2)",
                params![entity_id, entity_type],
            )
            .with_context(|| format!("failed to insert entity {entity_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when either lookup query fails.
    pub fn contains(&self, document_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        if let Some(number) = parse_document_id(document_id) {
            let in_range = conn
                .query_row(
                    "SELECT EXISTS(
                        SELECT 1 FROM efta_mapping WHERE ?1 BETWEEN range_start AND range_end
                    )",
                    params![number],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to query efta_mapping")?;
            if in_range == 1 {
                return Ok(true);
            }
        }

        let is_entity = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM entities WHERE entity_id = ?1)",
                params![document_id],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to query entities")?;
        Ok(is_entity == 1)
    }
}

impl ProvenanceLookup for SqliteProvenanceLookup {
    fn is_known(&self, document_id: &str) -> Result<bool, SefiError> {
        self.contains(document_id).map_err(collaborator)
    }
}

fn collaborator(err: anyhow::Error) -> SefiError {
    SefiError::Collaborator(format!("{err:#}"))
}

fn ledger_error(err: anyhow::Error) -> SefiError {
    match err.downcast::<SefiError>() {
        Ok(state) => state,
        Err(other) => collaborator(other),
    }
}

fn source_conflict(err: rusqlite::Error, unit_id: &str) -> anyhow::Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SefiError::SourceInFlight(format!(
                "unit {unit_id} needs a claim or document held by a live unit"
            ))
            .into()
        }
        _ => anyhow::Error::new(err).context(format!("failed to record unit {unit_id}")),
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
