//! Error types for telemetry ingestion and segmentation.

use odotrust_core::{Classify, ErrorKind};
use thiserror::Error;

/// Errors raised while grouping or segmenting telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Device is not bound to any vehicle
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Point failed shape validation
    #[error("Invalid telemetry point: {0}")]
    InvalidPoint(String),

    /// Point is older than the last point of the device's open trip
    #[error("Out-of-order point for device {device_id}: last {last_timestamp}, got {timestamp}")]
    OutOfOrderPoint {
        /// Device identifier
        device_id: String,
        /// Timestamp of the latest accepted point
        last_timestamp: u64,
        /// Timestamp of the rejected point
        timestamp: u64,
    },

    /// Segments can only be built from a batch that is no longer open
    #[error("Batch {batch_id} is {status}, expected a closed batch")]
    BatchNotClosed {
        /// Batch identifier
        batch_id: String,
        /// Current status
        status: String,
    },

    /// A batch without points reached a stage that requires points
    #[error("Batch {0} has no points")]
    EmptyBatch(String),
}

impl Classify for TelemetryError {
    fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::EmptyBatch(_) => ErrorKind::InvariantViolation,
            _ => ErrorKind::ValidationFailure,
        }
    }
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
