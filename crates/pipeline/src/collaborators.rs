//! External collaborators
//!
//! The anchor, object storage and notification services are reached through
//! these traits and injected at construction. All of them are treated as
//! unreliable: their failures never roll back trust or ownership state.

use async_trait::async_trait;
use odotrust_core::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    #[error("{service} unavailable: {detail}")]
    Unavailable { service: &'static str, detail: String },

    #[error("{service} rejected request: {detail}")]
    Rejected { service: &'static str, detail: String },
}

impl ExternalError {
    pub fn unavailable(service: &'static str, detail: impl Into<String>) -> Self {
        ExternalError::Unavailable {
            service,
            detail: detail.into(),
        }
    }
}

impl Classify for ExternalError {
    fn kind(&self) -> ErrorKind {
        match self {
            ExternalError::Unavailable { .. } => ErrorKind::ExternalUnavailable,
            ExternalError::Rejected { .. } => ErrorKind::ValidationFailure,
        }
    }
}

pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

/// Opaque signing capability supplied by wallet custody
#[derive(Clone, PartialEq, Eq)]
pub struct WalletCredential(String);

impl WalletCredential {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn handle(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WalletCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WalletCredential(..)")
    }
}

/// Commitment fact submitted to the anchor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPayload {
    pub batch_id: String,
    pub vehicle_id: String,
    /// Hex Merkle root over the batch segments
    pub commitment_root: String,
    pub segment_count: usize,
    pub distance: u64,
    pub start_odometer: u64,
    pub end_odometer: u64,
    pub closed_at: u64,
    #[serde(skip)]
    pub credential: Option<WalletCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReceipt {
    pub reference: String,
    pub confirmed: bool,
}

#[async_trait]
pub trait AnchorClient: Send + Sync {
    async fn submit(&self, payload: &AnchorPayload) -> ExternalResult<AnchorReceipt>;

    async fn confirm(&self, reference: &str) -> ExternalResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub batch_id: String,
    pub vehicle_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, metadata: ObjectMetadata) -> ExternalResult<StoredObject>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    FraudDetected {
        vehicle_id: String,
        batch_id: String,
        reasons: Vec<String>,
    },
    BatchAnchored {
        vehicle_id: String,
        batch_id: String,
        reference: String,
    },
    SubmissionAbandoned {
        vehicle_id: String,
        batch_id: String,
        attempts: u32,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, notification: &Notification) -> ExternalResult<()>;
}

/// Fire-and-forget delivery: failures are logged, never returned
pub async fn notify_quietly(notifier: &dyn Notifier, user_id: &str, notification: Notification) {
    if let Err(err) = notifier.notify(user_id, &notification).await {
        warn!(user_id, error = %err, ?notification, "Notification dropped");
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: &str, notification: &Notification) -> ExternalResult<()> {
        info!(user_id, ?notification, "Notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenNotifier;

    #[async_trait]
    impl Notifier for BrokenNotifier {
        async fn notify(&self, _user_id: &str, _n: &Notification) -> ExternalResult<()> {
            Err(ExternalError::unavailable("notifier", "connection refused"))
        }
    }

    #[tokio::test]
    async fn test_notify_quietly_swallows_failures() {
        notify_quietly(
            &BrokenNotifier,
            "owner-1",
            Notification::FraudDetected {
                vehicle_id: "veh-1".into(),
                batch_id: "b-1".into(),
                reasons: vec!["rollback detected".into()],
            },
        )
        .await;
    }

    #[test]
    fn test_external_errors_classify() {
        assert!(ExternalError::unavailable("anchor", "timeout").is_retryable());
        let rejected = ExternalError::Rejected {
            service: "anchor",
            detail: "bad root".into(),
        };
        assert_eq!(rejected.kind(), ErrorKind::ValidationFailure);
    }

    #[test]
    fn test_credential_is_not_printed() {
        let credential = WalletCredential::new("secret-handle");
        assert_eq!(format!("{:?}", credential), "WalletCredential(..)");
        assert_eq!(credential.handle(), "secret-handle");
    }
}
