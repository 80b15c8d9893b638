//! odotrust Trust
//!
//! Fraud checks and the per-vehicle trust score ledger:
//! - Continuity validation of a trip's odometer bounds against the last
//!   accepted record (rollback, zero reset, gaps, unrealistic jumps)
//! - An append-only SQLite ledger of trust events with a cached, bounded
//!   current score maintained under optimistic concurrency
//!
//! The cached score is always reproducible by folding the event stream.

pub mod continuity;
pub mod error;
pub mod ledger;
pub mod score;

pub use continuity::{ContinuityReason, ContinuityValidator, ContinuityVerdict, RiskLevel};
pub use error::{LedgerError, Result};
pub use ledger::{AuditReport, LedgerHealth, LedgerMetrics, ScoreChange, TrustLedger};
pub use score::{fold_scores, TrustEvent, TrustLevel, TrustSource, DEFAULT_SCORE, MAX_SCORE, MIN_SCORE};
