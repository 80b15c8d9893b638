//! Trust score arithmetic and event types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Score of a vehicle with no events
pub const DEFAULT_SCORE: u8 = 100;
pub const MIN_SCORE: u8 = 0;
pub const MAX_SCORE: u8 = 100;

/// Where a trust event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustSource {
    Telemetry,
    Manual,
    FraudEngine,
    Anchor,
}

impl TrustSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustSource::Telemetry => "telemetry",
            TrustSource::Manual => "manual",
            TrustSource::FraudEngine => "fraud_engine",
            TrustSource::Anchor => "anchor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "telemetry" => Some(TrustSource::Telemetry),
            "manual" => Some(TrustSource::Manual),
            "fraud_engine" => Some(TrustSource::FraudEngine),
            "anchor" => Some(TrustSource::Anchor),
            _ => None,
        }
    }
}

impl fmt::Display for TrustSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable entry of a vehicle's trust history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEvent {
    /// Ledger sequence number
    pub seq_no: u64,
    pub event_id: String,
    pub vehicle_id: String,
    pub change: i32,
    pub previous_score: u8,
    pub new_score: u8,
    pub reason: String,
    pub source: TrustSource,
    /// When the scored fact happened (Unix milliseconds)
    pub event_timestamp: u64,
    /// When the event was written
    pub recorded_at: u64,
}

/// Coarse classification of a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    Untrusted,
    Suspect,
    Watch,
    Trusted,
}

impl TrustLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => TrustLevel::Trusted,
            50..=79 => TrustLevel::Watch,
            20..=49 => TrustLevel::Suspect,
            _ => TrustLevel::Untrusted,
        }
    }
}

/// `clamp(previous + change, 0, 100)`
pub fn apply_change(previous: u8, change: i32) -> u8 {
    let next = i64::from(previous) + i64::from(change);
    next.clamp(i64::from(MIN_SCORE), i64::from(MAX_SCORE)) as u8
}

/// Fold changes in order starting from [`DEFAULT_SCORE`], clamping at every step.
pub fn fold_scores<I>(changes: I) -> u8
where
    I: IntoIterator<Item = i32>,
{
    changes.into_iter().fold(DEFAULT_SCORE, apply_change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_apply_change_clamps() {
        assert_eq!(apply_change(100, 1), 100);
        assert_eq!(apply_change(10, -20), 0);
        assert_eq!(apply_change(50, -20), 30);
        assert_eq!(apply_change(0, i32::MAX), 100);
        assert_eq!(apply_change(100, i32::MIN), 0);
    }

    #[test]
    fn test_fold_clamps_each_step() {
        // Without per-step clamping this would end at 70
        assert_eq!(fold_scores([-200, 70]), 70);
        assert_eq!(fold_scores([50, -30]), 70);
        assert_eq!(fold_scores(std::iter::empty()), DEFAULT_SCORE);
    }

    #[test]
    fn test_trust_levels() {
        assert_eq!(TrustLevel::from_score(100), TrustLevel::Trusted);
        assert_eq!(TrustLevel::from_score(70), TrustLevel::Watch);
        assert_eq!(TrustLevel::from_score(20), TrustLevel::Suspect);
        assert_eq!(TrustLevel::from_score(0), TrustLevel::Untrusted);
    }

    #[test]
    fn test_source_storage_form() {
        for source in [
            TrustSource::Telemetry,
            TrustSource::Manual,
            TrustSource::FraudEngine,
            TrustSource::Anchor,
        ] {
            assert_eq!(TrustSource::parse(source.as_str()), Some(source));
        }
    }

    proptest! {
        #[test]
        fn prop_score_stays_in_bounds(changes in proptest::collection::vec(-150i32..150, 0..200)) {
            let mut score = DEFAULT_SCORE;
            for change in changes {
                score = apply_change(score, change);
                prop_assert!(score <= MAX_SCORE);
            }
        }
    }
}
