//! Trip batches
//!
//! A batch collects the telemetry of one device between trip start and trip
//! end. Lifecycle:
//!
//! ```text
//! Open --(close)--> Closed --> Consolidating --> Anchored
//!                                     \--> Failed
//! ```

use odotrust_core::TelemetryPoint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Batch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepting points
    Open,
    /// Trip ended, waiting for consolidation
    Closed,
    /// Segments and commitment being produced
    Consolidating,
    /// Commitment accepted by the anchor
    Anchored,
    /// Rejected by the fraud checks or anchor submission failed
    Failed,
}

impl BatchStatus {
    /// Stable string form used in storage and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Closed => "closed",
            BatchStatus::Consolidating => "consolidating",
            BatchStatus::Anchored => "anchored",
            BatchStatus::Failed => "failed",
        }
    }

    /// Parse the storage form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(BatchStatus::Open),
            "closed" => Some(BatchStatus::Closed),
            "consolidating" => Some(BatchStatus::Consolidating),
            "anchored" => Some(BatchStatus::Anchored),
            "failed" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a trip was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Trailing points report rpm 0 and speed 0
    EngineOff,
    /// No data within the idle timeout
    DataTimeout,
    /// Device flagged the end of the trip
    EndOfTripSignal,
    /// Closed by an operator or at shutdown
    Manual,
}

impl CloseReason {
    /// Human-readable reason
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::EngineOff => "engine off",
            CloseReason::DataTimeout => "data timeout",
            CloseReason::EndOfTripSignal => "end of trip signal",
            CloseReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Odometer bounds of a batch, the only input the continuity checks need
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchBounds {
    /// Odometer at the first point
    pub start_odometer: u64,
    /// Odometer at the last point
    pub end_odometer: u64,
}

/// A trip: the ordered telemetry of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Batch identifier (UUID v4)
    pub id: String,
    /// Reporting device
    pub device_id: String,
    /// Vehicle the device is installed in
    pub vehicle_id: String,
    /// Lifecycle state
    pub status: BatchStatus,
    /// Points in arrival order (timestamps never decrease)
    pub points: Vec<TelemetryPoint>,
    /// Odometer at the first point
    pub start_odometer: u64,
    /// Odometer at the latest point
    pub end_odometer: u64,
    /// Timestamp of the first point (Unix milliseconds)
    pub opened_at: u64,
    /// Timestamp of the last point when the trip closed
    pub closed_at: Option<u64>,
    /// Why the trip closed
    pub close_reason: Option<CloseReason>,
}

impl Batch {
    /// Open a new batch seeded with its first point
    pub fn open(vehicle_id: impl Into<String>, first: TelemetryPoint) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: first.device_id.clone(),
            vehicle_id: vehicle_id.into(),
            status: BatchStatus::Open,
            start_odometer: first.odometer,
            end_odometer: first.odometer,
            opened_at: first.timestamp,
            closed_at: None,
            close_reason: None,
            points: vec![first],
        }
    }

    /// Append a point and move the end odometer
    pub fn push(&mut self, point: TelemetryPoint) {
        self.end_odometer = point.odometer;
        self.points.push(point);
    }

    /// Timestamp of the most recent point
    pub fn last_point_at(&self) -> u64 {
        self.points.last().map(|p| p.timestamp).unwrap_or(self.opened_at)
    }

    /// True while the trailing `count` points are all idle
    pub fn ends_idle(&self, count: usize) -> bool {
        count > 0
            && self.points.len() >= count
            && self.points[self.points.len() - count..]
                .iter()
                .all(TelemetryPoint::is_idle)
    }

    /// Transition `Open -> Closed`. Returns false if the batch was already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.status != BatchStatus::Open {
            return false;
        }
        self.status = BatchStatus::Closed;
        self.closed_at = Some(self.last_point_at());
        self.close_reason = Some(reason);
        true
    }

    /// Odometer bounds for continuity validation
    pub fn bounds(&self) -> BatchBounds {
        BatchBounds {
            start_odometer: self.start_odometer,
            end_odometer: self.end_odometer,
        }
    }

    /// Raw odometer difference, clamped at zero
    pub fn distance(&self) -> u64 {
        self.end_odometer.saturating_sub(self.start_odometer)
    }
}
