//! Continuity / fraud validation
//!
//! Compares a trip's odometer bounds with the last accepted odometer of the
//! vehicle. Every rule is evaluated; the verdict carries all reasons found.
//!
//! | Rule | Condition | Effect |
//! |------|-----------|--------|
//! | large gap | `|start - last| > gap_tolerance` | invalid |
//! | rollback detected | `end < last` | invalid |
//! | unrealistic increase | `end - start > jump_threshold` | risk only |
//! | reset to zero | `end == 0 && last > 0` | invalid |

use odotrust_core::{current_timestamp_ms, ContinuityConfig};
use odotrust_telemetry::{Batch, BatchBounds};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// A single continuity finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContinuityReason {
    #[serde(rename = "large gap")]
    LargeGap,
    #[serde(rename = "rollback detected")]
    Rollback,
    #[serde(rename = "unrealistic increase")]
    UnrealisticIncrease,
    #[serde(rename = "reset to zero")]
    ZeroReset,
}

impl ContinuityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuityReason::LargeGap => "large gap",
            ContinuityReason::Rollback => "rollback detected",
            ContinuityReason::UnrealisticIncrease => "unrealistic increase",
            ContinuityReason::ZeroReset => "reset to zero",
        }
    }
}

impl fmt::Display for ContinuityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Elevated,
    High,
}

/// Outcome of a continuity check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityVerdict {
    pub is_valid: bool,
    pub reasons: Vec<ContinuityReason>,
    pub risk: RiskLevel,
    pub start_odometer: u64,
    pub end_odometer: u64,
    pub last_accepted_odometer: u64,
    /// Unix milliseconds
    pub checked_at: u64,
}

impl ContinuityVerdict {
    pub fn has_reason(&self, reason: ContinuityReason) -> bool {
        self.reasons.contains(&reason)
    }

    /// Reasons joined for logs and failure records
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            return "ok".to_string();
        }
        self.reasons
            .iter()
            .map(ContinuityReason::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Stateless validator configured with the gap and jump thresholds
#[derive(Debug, Clone, Default)]
pub struct ContinuityValidator {
    config: ContinuityConfig,
}

impl ContinuityValidator {
    pub fn new(config: ContinuityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContinuityConfig {
        &self.config
    }

    pub fn validate(&self, bounds: &BatchBounds, last_accepted: u64) -> ContinuityVerdict {
        let BatchBounds {
            start_odometer: start,
            end_odometer: end,
        } = *bounds;

        let mut reasons = Vec::new();

        let gap_ok = start.abs_diff(last_accepted) <= self.config.gap_tolerance;
        if !gap_ok {
            reasons.push(ContinuityReason::LargeGap);
        }

        let rollback = end < last_accepted;
        if rollback {
            reasons.push(ContinuityReason::Rollback);
        }

        if end.saturating_sub(start) > self.config.jump_threshold {
            reasons.push(ContinuityReason::UnrealisticIncrease);
        }

        let zero_reset = end == 0 && last_accepted > 0;
        if zero_reset {
            reasons.push(ContinuityReason::ZeroReset);
        }

        let is_valid = !(rollback || zero_reset) && gap_ok;
        let risk = if !is_valid {
            RiskLevel::High
        } else if reasons.is_empty() {
            RiskLevel::Low
        } else {
            RiskLevel::Elevated
        };

        let verdict = ContinuityVerdict {
            is_valid,
            reasons,
            risk,
            start_odometer: start,
            end_odometer: end,
            last_accepted_odometer: last_accepted,
            checked_at: current_timestamp_ms(),
        };

        if verdict.is_valid {
            debug!(start, end, last_accepted, risk = ?verdict.risk, "Continuity check passed");
        } else {
            warn!(
                start,
                end,
                last_accepted,
                reasons = %verdict.summary(),
                "Continuity check failed"
            );
        }

        verdict
    }

    pub fn validate_batch(&self, batch: &Batch, last_accepted: u64) -> ContinuityVerdict {
        self.validate(&batch.bounds(), last_accepted)
    }
}
