//! Core functionality for the odotrust mileage provenance ledger.
//!
//! This crate provides the shared types, error taxonomy, configuration,
//! logging, retry policy and the segment commitment builder used across
//! the odotrust workspace.

pub mod config;
pub mod error;
pub mod logging;
pub mod merkle;
pub mod retry;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod types;

pub use config::{
    AnchorConfig, Config, ContinuityConfig, PipelineConfig, SegmenterConfig, StorageConfig,
    TrustConfig, VerificationConfig,
};
pub use error::{Classify, Error, ErrorKind, Result};
pub use merkle::{commit, CommitmentTree, Hash as CommitmentHash, MerkleError, MerkleProof};
pub use retry::{with_retry, with_retry_async, RetryPolicy};
pub use types::{current_timestamp_ms, quality, Segment, TelemetryPoint};
