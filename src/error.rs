//! Error taxonomy shared by the ledger coordinator and the scheduler.

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed input, rejected before any store access.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced record does not exist or is soft-deleted.
    #[error("{0} not found")]
    NotFound(String),

    /// The record exists but is not in a state that permits the operation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// I/O failure talking to the store. Safe to retry at the caller's discretion.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A sequential unit of work failed after some of its writes committed.
    #[error("partial consistency risk ({committed_writes} write(s) committed): {source}")]
    PartialConsistencyRisk {
        committed_writes: u32,
        #[source]
        source: Box<LedgerError>,
    },
}

impl LedgerError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::PartialConsistencyRisk { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::StoreUnavailable(format!("store task failed: {e}"))
    }
}
