#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SefiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no units available: {0}")]
    NoUnitsAvailable(String),
    #[error("unknown unit: {0}")]
    UnknownUnit(String),
    #[error("unit {unit_id} is already assigned to worker {worker_id}")]
    AlreadyAssigned { unit_id: String, worker_id: String },
    #[error("unit {0} is already completed")]
    AlreadyCompleted(String),
    #[error("unit {0} is already registered")]
    DuplicateUnit(String),
    #[error("source already in flight: {0}")]
    SourceInFlight(String),
    #[error("unknown unit kind: {0}")]
    UnknownKind(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

impl SefiError {
    /// True for the exhaustion condition, which callers treat as "try later" rather than fatal.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::NoUnitsAvailable(_))
    }
}
