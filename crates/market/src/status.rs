//! Purchase and escrow states

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Purchase request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    PendingSeller,
    Accepted,
    Rejected,
    CounterOffer,
    EscrowFunded,
    VerificationPassed,
    VerificationFailed,
    TransferPending,
    Sold,
    Cancelled,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::PendingSeller => "pending_seller",
            PurchaseStatus::Accepted => "accepted",
            PurchaseStatus::Rejected => "rejected",
            PurchaseStatus::CounterOffer => "counter_offer",
            PurchaseStatus::EscrowFunded => "escrow_funded",
            PurchaseStatus::VerificationPassed => "verification_passed",
            PurchaseStatus::VerificationFailed => "verification_failed",
            PurchaseStatus::TransferPending => "transfer_pending",
            PurchaseStatus::Sold => "sold",
            PurchaseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "pending_seller" => PurchaseStatus::PendingSeller,
            "accepted" => PurchaseStatus::Accepted,
            "rejected" => PurchaseStatus::Rejected,
            "counter_offer" => PurchaseStatus::CounterOffer,
            "escrow_funded" => PurchaseStatus::EscrowFunded,
            "verification_passed" => PurchaseStatus::VerificationPassed,
            "verification_failed" => PurchaseStatus::VerificationFailed,
            "transfer_pending" => PurchaseStatus::TransferPending,
            "sold" => PurchaseStatus::Sold,
            "cancelled" => PurchaseStatus::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PurchaseStatus::Rejected
                | PurchaseStatus::VerificationFailed
                | PurchaseStatus::Sold
                | PurchaseStatus::Cancelled
        )
    }

    /// Legal edges of the state machine. `TransferPending -> VerificationPassed`
    /// only reverts a claim whose transfer transaction rolled back.
    pub fn can_transition_to(&self, next: PurchaseStatus) -> bool {
        use PurchaseStatus::*;

        if next == Cancelled {
            return !self.is_terminal() && *self != TransferPending;
        }

        matches!(
            (self, next),
            (PendingSeller, Accepted)
                | (PendingSeller, Rejected)
                | (PendingSeller, CounterOffer)
                | (CounterOffer, Accepted)
                | (Accepted, EscrowFunded)
                | (EscrowFunded, VerificationPassed)
                | (EscrowFunded, VerificationFailed)
                | (VerificationPassed, TransferPending)
                | (TransferPending, Sold)
                | (TransferPending, VerificationPassed)
        )
    }
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Funded,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Funded => "funded",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "funded" => Some(EscrowStatus::Funded),
            "released" => Some(EscrowStatus::Released),
            "refunded" => Some(EscrowStatus::Refunded),
            _ => None,
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seller's answer to a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SellerResponse {
    Accept,
    Reject,
    Counter { price: Decimal },
}
