//! Persisted marketplace records

use crate::status::{EscrowStatus, PurchaseStatus};
use crate::verification::VerificationResult;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub id: String,
    pub vehicle_id: String,
    pub buyer_id: String,
    /// Owner of the vehicle when the request was created
    pub seller_id: String,
    pub offered_price: Decimal,
    pub counter_price: Option<Decimal>,
    /// Price both parties accepted; set on entering `accepted`
    pub agreed_price: Option<Decimal>,
    pub status: PurchaseStatus,
    pub escrow_id: Option<String>,
    pub verification: Option<VerificationResult>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: String,
    pub purchase_request_id: String,
    pub amount: Decimal,
    pub status: EscrowStatus,
    pub idempotency_key: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Immutable record of a completed sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: String,
    pub purchase_request_id: String,
    pub vehicle_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub price: Decimal,
    pub anchor_reference: Option<String>,
    pub sold_at: u64,
}

/// One interval of ownership; `to_ts` is `None` for the current owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipEntry {
    pub vehicle_id: String,
    pub owner_id: String,
    pub from_ts: u64,
    pub to_ts: Option<u64>,
    pub anchor_reference: Option<String>,
}

/// Audit record of a status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub request_id: String,
    pub from_status: PurchaseStatus,
    pub to_status: PurchaseStatus,
    pub actor: String,
    pub reason: Option<String>,
    pub at: u64,
    /// BLAKE3 over request, states, actor and time (hex)
    pub transition_hash: String,
}

impl StatusTransition {
    pub(crate) fn hash(
        request_id: &str,
        from: PurchaseStatus,
        to: PurchaseStatus,
        actor: &str,
        at: u64,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(from.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(to.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(actor.as_bytes());
        hasher.update(&at.to_le_bytes());
        hex::encode(hasher.finalize().as_bytes())
    }
}
