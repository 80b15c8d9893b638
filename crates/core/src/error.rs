//! Error taxonomy shared by every odotrust crate.
//!
//! Each crate keeps its own `thiserror` enum; those enums classify
//! themselves into an [`ErrorKind`] so the pipeline can decide whether a
//! failure is retried, surfaced, or treated as a programmer error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes understood by the orchestrating pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad input shape. Rejected immediately, never retried.
    ValidationFailure,
    /// Continuity validator rejected a batch.
    FraudDetected,
    /// Optimistic-concurrency collision on a per-vehicle unit of work.
    Conflict,
    /// Event timestamp precedes the latest recorded event. Caller bug.
    OutOfOrder,
    /// Anchor or storage collaborator unreachable.
    ExternalUnavailable,
    /// Broken internal invariant. Fatal.
    InvariantViolation,
    /// Referenced entity does not exist.
    NotFound,
    /// Database or filesystem failure.
    Storage,
}

impl ErrorKind {
    /// Only transient classes may be retried in-process or by a sweeper.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::ExternalUnavailable)
    }

    /// Classes surfaced to end users as an explicit rejection reason.
    pub fn is_user_visible(self) -> bool {
        matches!(
            self,
            ErrorKind::ValidationFailure | ErrorKind::FraudDetected | ErrorKind::NotFound
        )
    }
}

/// Implemented by every crate-level error enum.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Core error type for configuration and shared plumbing
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Validation(String),
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Storage,
            Error::Config(_) | Error::ConfigParse(_) | Error::Validation(_) => {
                ErrorKind::ValidationFailure
            }
            Error::Serialization(_) => ErrorKind::InvariantViolation,
        }
    }
}
