//! Cross-crate integration tests
//!
//! This suite validates:
//! - Telemetry replay through the running pipeline to an anchored trip
//! - Rollback detection, trust penalties and owner notification
//! - Per-device ordering with many devices in flight
//! - Marketplace verification against the real ledger and batch store
//! - Atomic ownership transfer under injected faults
//! - Idempotent escrow funding under concurrent calls

pub mod test_utils;

#[cfg(test)]
mod provenance_scenarios;

#[cfg(test)]
mod transfer_tests;
