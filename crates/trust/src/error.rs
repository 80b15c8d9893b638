//! Trust ledger errors

use odotrust_core::sqlite::is_busy;
use odotrust_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Concurrent update conflict on vehicle {vehicle_id}")]
    Conflict { vehicle_id: String },

    #[error("Out-of-order event for vehicle {vehicle_id}: {event_timestamp} precedes latest {latest_timestamp}")]
    OutOfOrder {
        vehicle_id: String,
        event_timestamp: u64,
        latest_timestamp: u64,
    },

    #[error("Invalid trust event: {0}")]
    InvalidEvent(String),

    #[error("Cached score of vehicle {vehicle_id} disagrees with its event history")]
    InconsistentScore { vehicle_id: String },

    #[error("Corrupt event at seq_no {seq_no}: {detail}")]
    CorruptEvent { seq_no: u64, detail: String },
}

impl LedgerError {
    /// Lock contention surfaces as `Conflict` once retries are exhausted
    pub(crate) fn into_conflict_if_busy(self, vehicle_id: &str) -> Self {
        match self {
            LedgerError::DatabaseError(ref e) if is_busy(e) => LedgerError::Conflict {
                vehicle_id: vehicle_id.to_string(),
            },
            other => other,
        }
    }
}

impl Classify for LedgerError {
    fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::DatabaseError(e) if is_busy(e) => ErrorKind::Conflict,
            LedgerError::DatabaseError(_) => ErrorKind::Storage,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            LedgerError::InvalidEvent(_) => ErrorKind::ValidationFailure,
            LedgerError::InconsistentScore { .. } | LedgerError::CorruptEvent { .. } => {
                ErrorKind::InvariantViolation
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
