//! JSON-lines telemetry replay
//!
//! One record per line, tagged by `type`:
//!
//! ```text
//! {"type":"device","device_id":"obd-7","vehicle_id":"veh-1","owner_id":"alice"}
//! {"type":"point","device_id":"obd-7","odometer":1000,"speed":42.0,"rpm":1800,"timestamp":1700000000000}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use odotrust_core::TelemetryPoint;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayRecord {
    Device {
        device_id: String,
        vehicle_id: String,
        owner_id: String,
    },
    Point(TelemetryPoint),
}

/// Parse one line; `Ok(None)` for blank and comment lines
pub fn parse_line(line: &str) -> Result<Option<ReplayRecord>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}
