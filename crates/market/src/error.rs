//! Marketplace errors

use crate::engine::TransferStep;
use crate::status::PurchaseStatus;
use odotrust_core::sqlite::is_busy;
use odotrust_core::{Classify, ErrorKind};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Cannot {action} request {request_id} in state {status}")]
    InvalidTransition {
        request_id: String,
        status: PurchaseStatus,
        action: &'static str,
    },

    #[error("{actor} is not allowed to {action}")]
    Unauthorized { actor: String, action: &'static str },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Idempotency key {key} already funds request {bound_request_id}")]
    IdempotencyKeyReused { key: String, bound_request_id: String },

    #[error("Escrow amount {actual} does not match agreed price {expected}")]
    AmountMismatch { expected: Decimal, actual: Decimal },

    #[error("Request {request_id} changed concurrently")]
    Conflict { request_id: String },

    #[error("Verification input unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Transfer aborted at {0:?}")]
    TransferFault(TransferStep),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl Classify for MarketError {
    fn kind(&self) -> ErrorKind {
        match self {
            MarketError::DatabaseError(e) if is_busy(e) => ErrorKind::Conflict,
            MarketError::DatabaseError(_) | MarketError::TransferFault(_) => ErrorKind::Storage,
            MarketError::NotFound { .. } => ErrorKind::NotFound,
            MarketError::InvalidTransition { .. }
            | MarketError::Unauthorized { .. }
            | MarketError::InvalidInput(_)
            | MarketError::IdempotencyKeyReused { .. }
            | MarketError::AmountMismatch { .. } => ErrorKind::ValidationFailure,
            MarketError::Conflict { .. } => ErrorKind::Conflict,
            MarketError::SourceUnavailable(_) => ErrorKind::ExternalUnavailable,
            MarketError::CorruptRecord(_) => ErrorKind::InvariantViolation,
        }
    }
}

pub type MarketResult<T> = std::result::Result<T, MarketError>;
