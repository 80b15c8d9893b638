//! odotrust Market
//!
//! Purchase/escrow state machine gating an ownership transfer behind the
//! vehicle's trust score and provenance:
//!
//! ```text
//! PendingSeller --accept--> Accepted --fund--> EscrowFunded --verify--> VerificationPassed
//!       |  \--counter--> CounterOffer --accept_counter--^     \--> VerificationFailed
//!       \--reject--> Rejected                                   VerificationPassed
//!                                                                 --confirm--> TransferPending --> Sold
//! any non-terminal --cancel--> Cancelled
//! ```
//!
//! The final transfer (ownership, sale record, status, escrow release) is
//! committed as one SQLite transaction.

pub mod engine;
pub mod error;
pub mod records;
pub mod sources;
pub mod status;
pub mod verification;

pub use engine::{PurchaseEngine, TransferStep};
pub use error::{MarketError, MarketResult};
pub use records::{Escrow, OwnershipEntry, PurchaseRequest, SaleRecord, StatusTransition};
pub use sources::{ProvenanceSource, TrustScoreSource, VehicleProvenance};
pub use status::{EscrowStatus, PurchaseStatus, SellerResponse};
pub use verification::{CheckOutcome, VerificationPolicy, VerificationResult};
