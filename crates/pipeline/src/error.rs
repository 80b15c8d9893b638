//! Pipeline errors

use crate::collaborators::ExternalError;
use odotrust_core::sqlite::is_busy;
use odotrust_core::{Classify, ErrorKind, MerkleError};
use odotrust_telemetry::TelemetryError;
use odotrust_trust::LedgerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Commitment error: {0}")]
    Commitment(#[from] MerkleError),

    #[error("Trust ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Batch store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Collaborator error: {0}")]
    External(#[from] ExternalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Corrupt batch record {batch_id}: {detail}")]
    CorruptBatch { batch_id: String, detail: String },

    #[error("Worker queue closed")]
    QueueClosed,

    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl Classify for PipelineError {
    fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Telemetry(e) => e.kind(),
            PipelineError::Commitment(e) => e.kind(),
            PipelineError::Ledger(e) => e.kind(),
            PipelineError::Store(e) if is_busy(e) => ErrorKind::Conflict,
            PipelineError::Store(_) | PipelineError::Serialization(_) => ErrorKind::Storage,
            PipelineError::External(e) => e.kind(),
            PipelineError::BatchNotFound(_) => ErrorKind::NotFound,
            PipelineError::CorruptBatch { .. } | PipelineError::Join(_) => {
                ErrorKind::InvariantViolation
            }
            PipelineError::QueueClosed => ErrorKind::ExternalUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
