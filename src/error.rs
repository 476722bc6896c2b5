use thiserror::Error;
use uuid::Uuid;

use crate::models::IntentStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A ledger entry for this intent already exists. Callers treat this as an
    /// idempotent no-op, not a failure.
    #[error("ledger entry for intent {0} already exists")]
    DuplicateEntry(Uuid),
    #[error("intent {intent_id} already confirmed with ref {existing}, got {incoming}")]
    ConflictingConfirmation {
        intent_id: Uuid,
        existing: String,
        incoming: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("rate snapshot stale (age {age_secs:?}s, max {max_secs}s)")]
    StaleRateData {
        age_secs: Option<i64>,
        max_secs: i64,
    },
    #[error("unknown currency {0}")]
    UnknownCurrency(String),
    #[error("unknown plan {0}")]
    UnknownPlan(String),
    #[error("intent {0} not found")]
    IntentNotFound(Uuid),
    /// A confirmation arrived for an intent already in a terminal state. The
    /// money may still have moved, so this is escalated, never auto-resolved.
    #[error("confirmation for intent {intent_id} arrived in terminal state {status}")]
    StaleExpiredIntent {
        intent_id: Uuid,
        status: IntentStatus,
    },
    #[error("invalid plan catalog: {0}")]
    InvalidCatalog(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::StorageUnavailable(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
