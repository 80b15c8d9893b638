//! Pre-transfer verification
//!
//! Four independent checks are always evaluated and recorded. Which of them
//! gate the transfer is decided by the [`VerificationPolicy`]; the default
//! policy gates on the trust score alone and records the others as advisory.

use crate::sources::VehicleProvenance;
use odotrust_core::VerificationConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

const DAY_MS: u64 = 86_400_000;

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reasons: Vec<String>,
}

impl CheckOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            reasons: Vec::new(),
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub trust_score: CheckOutcome,
    pub continuity: CheckOutcome,
    pub anchor: CheckOutcome,
    pub storage: CheckOutcome,
    /// Score observed during the check
    pub score: u8,
    /// Aggregate under the policy in force
    pub passed: bool,
    /// Reasons of the failed gating checks
    pub reasons: Vec<String>,
    pub checked_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub min_trust_score: u8,
    pub continuity_max_age_ms: u64,
    pub require_trust_score: bool,
    pub require_continuity: bool,
    pub require_anchor: bool,
    pub require_storage: bool,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::from_config(&VerificationConfig::default())
    }
}

impl VerificationPolicy {
    pub fn from_config(config: &VerificationConfig) -> Self {
        Self {
            min_trust_score: config.min_trust_score,
            continuity_max_age_ms: config.continuity_max_age_ms,
            require_trust_score: config.require_trust_score,
            require_continuity: config.require_continuity,
            require_anchor: config.require_anchor,
            require_storage: config.require_storage,
        }
    }

    /// Every check gates the transfer
    pub fn strict(min_trust_score: u8) -> Self {
        Self {
            min_trust_score,
            require_trust_score: true,
            require_continuity: true,
            require_anchor: true,
            require_storage: true,
            ..Self::default()
        }
    }

    pub fn evaluate(
        &self,
        vehicle_id: &str,
        score: u8,
        provenance: Option<&VehicleProvenance>,
        now: u64,
    ) -> VerificationResult {
        let trust_score = if score >= self.min_trust_score {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(format!(
                "trust score {} below minimum {}",
                score, self.min_trust_score
            ))
        };

        let continuity = match provenance.and_then(|p| p.latest_verdict_valid.zip(p.latest_verdict_at)) {
            None => CheckOutcome::fail("no continuity verdict on record"),
            Some((false, _)) => CheckOutcome::fail("latest continuity verdict failed"),
            Some((true, at)) if now.saturating_sub(at) > self.continuity_max_age_ms => {
                CheckOutcome::fail(format!(
                    "latest continuity verdict older than {} days",
                    self.continuity_max_age_ms / DAY_MS
                ))
            }
            Some((true, _)) => CheckOutcome::pass(),
        };

        let anchor = match provenance {
            Some(VehicleProvenance {
                latest_anchor_reference: Some(_),
                anchor_confirmed: true,
                ..
            }) => CheckOutcome::pass(),
            Some(VehicleProvenance {
                latest_anchor_reference: Some(reference),
                ..
            }) => CheckOutcome::fail(format!("anchor {} not confirmed", reference)),
            _ => CheckOutcome::fail("no anchored batch"),
        };

        let storage = match provenance.and_then(|p| p.storage_object_id.as_ref()) {
            Some(_) => CheckOutcome::pass(),
            None => CheckOutcome::fail("no storage commitment"),
        };

        let mut passed = true;
        let mut reasons = Vec::new();
        for (required, check, name) in [
            (self.require_trust_score, &trust_score, "trust_score"),
            (self.require_continuity, &continuity, "continuity"),
            (self.require_anchor, &anchor, "anchor"),
            (self.require_storage, &storage, "storage"),
        ] {
            if check.passed {
                continue;
            }
            if required {
                passed = false;
                reasons.extend(check.reasons.iter().cloned());
            } else {
                info!(vehicle_id, check = name, reasons = ?check.reasons, "Advisory verification check failed");
            }
        }

        VerificationResult {
            trust_score,
            continuity,
            anchor,
            storage,
            score,
            passed,
            reasons,
            checked_at: now,
        }
    }
}
