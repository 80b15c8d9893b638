//! Shared domain types

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Quality flag bits carried by a telemetry point.
pub mod quality {
    /// GPS fix was unavailable when the reading was taken
    pub const NO_GPS_FIX: u8 = 0b0000_0001;
    /// Reading was interpolated by the device
    pub const INTERPOLATED: u8 = 0b0000_0010;
    /// Device signalled an explicit end of trip
    pub const END_OF_TRIP: u8 = 0b0000_0100;
    /// Device clock was resynchronised shortly before this reading
    pub const CLOCK_RESYNC: u8 = 0b0000_1000;
}

/// A single odometer reading produced by a vehicle device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Device identifier
    pub device_id: String,
    /// Odometer value in distance units
    pub odometer: u64,
    /// Speed in km/h
    pub speed: f64,
    /// Engine revolutions per minute
    pub rpm: u32,
    /// Reading timestamp (Unix milliseconds)
    pub timestamp: u64,
    /// Bit set of [`quality`] flags
    #[serde(default)]
    pub quality_flags: u8,
}

impl TelemetryPoint {
    pub fn new(device_id: impl Into<String>, odometer: u64, speed: f64, rpm: u32, timestamp: u64) -> Self {
        Self {
            device_id: device_id.into(),
            odometer,
            speed,
            rpm,
            timestamp,
            quality_flags: 0,
        }
    }

    /// Builder-style helper for setting quality flags
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.quality_flags |= flags;
        self
    }

    /// Engine off and vehicle stationary
    pub fn is_idle(&self) -> bool {
        self.rpm == 0 && self.speed == 0.0
    }

    pub fn signals_end_of_trip(&self) -> bool {
        self.quality_flags & quality::END_OF_TRIP != 0
    }
}

/// A contiguous, gap-free time/distance slice of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    /// Segment start (Unix milliseconds)
    pub start_time: u64,
    /// Segment end (Unix milliseconds)
    pub end_time: u64,
    /// Distance covered in odometer units
    pub distance: u64,
}

impl Segment {
    /// Canonical byte encoding used for commitment leaves.
    ///
    /// Layout: domain tag, then start, end and distance as little-endian u64.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEGMENT_DOMAIN_TAG.len() + 24);
        out.extend_from_slice(SEGMENT_DOMAIN_TAG);
        out.extend_from_slice(&self.start_time.to_le_bytes());
        out.extend_from_slice(&self.end_time.to_le_bytes());
        out.extend_from_slice(&self.distance.to_le_bytes());
        out
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

const SEGMENT_DOMAIN_TAG: &[u8] = b"odotrust.segment.v1";

/// Current wall-clock time in Unix milliseconds
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
