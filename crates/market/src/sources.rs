//! Read-only inputs to verification
//!
//! The engine never walks batch -> vehicle -> owner graphs itself; it asks
//! these repositories for flat answers.

use crate::error::{MarketError, MarketResult};
use odotrust_trust::TrustLedger;
use serde::{Deserialize, Serialize};

/// Provenance state of one vehicle, flattened from the batch store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleProvenance {
    pub vehicle_id: String,
    pub last_accepted_odometer: Option<u64>,
    /// Validity of the most recent continuity verdict
    pub latest_verdict_valid: Option<bool>,
    /// When that verdict was produced (Unix milliseconds)
    pub latest_verdict_at: Option<u64>,
    pub latest_anchor_reference: Option<String>,
    pub anchor_confirmed: bool,
    pub storage_object_id: Option<String>,
}

pub trait TrustScoreSource: Send + Sync {
    fn trust_score(&self, vehicle_id: &str) -> MarketResult<u8>;
}

pub trait ProvenanceSource: Send + Sync {
    /// `None` when the vehicle has never produced a batch
    fn provenance(&self, vehicle_id: &str) -> MarketResult<Option<VehicleProvenance>>;
}

impl TrustScoreSource for TrustLedger {
    fn trust_score(&self, vehicle_id: &str) -> MarketResult<u8> {
        self.current_score(vehicle_id)
            .map_err(|e| MarketError::SourceUnavailable(e.to_string()))
    }
}
