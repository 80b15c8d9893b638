//! Per-batch processing
//!
//! A closed batch goes through segmenting, commitment, continuity and the
//! trust ledger before the anchor is called:
//!
//! ```text
//! closed -> consolidating -> (continuity) -> fail: -fraud_delta, failed(fraud), owner notified
//!                                         \-> pass: +positive_delta, accept odometer, upload, anchor
//!                                                   -> anchored | failed(submission)
//! ```
//!
//! The trust delta is written before anything else moves. If the ledger
//! refuses it, the batch is parked as `failed(ledger)` with nothing else
//! changed and the sweeper resumes it through [`BatchProcessor::resume`].
//!
//! Store and ledger calls block on SQLite and run on the blocking pool. No
//! lock is held while a collaborator future is awaited.

use crate::batch_store::{BatchStore, StoredBatch};
use crate::collaborators::{
    notify_quietly, AnchorClient, AnchorPayload, ExternalError, Notification, Notifier,
    ObjectMetadata, ObjectStorage, WalletCredential,
};
use crate::error::{PipelineError, Result};
use odotrust_core::{with_retry_async, Classify, CommitmentTree, Config, RetryPolicy, Segment, TrustConfig};
use odotrust_telemetry::{Batch, SegmentBuilder, VehicleDirectory};
use odotrust_trust::{ContinuityValidator, ContinuityVerdict, LedgerError, TrustLedger, TrustSource};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Terminal result of processing one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Anchored {
        batch_id: String,
        reference: String,
    },
    Fraud {
        batch_id: String,
        verdict: ContinuityVerdict,
    },
    SubmissionFailed {
        batch_id: String,
        attempts: u32,
        error: String,
    },
    /// Trust ledger write failed; parked for the sweeper
    Deferred {
        batch_id: String,
        attempts: u32,
        error: String,
    },
}

impl BatchOutcome {
    pub fn batch_id(&self) -> &str {
        match self {
            BatchOutcome::Anchored { batch_id, .. }
            | BatchOutcome::Fraud { batch_id, .. }
            | BatchOutcome::SubmissionFailed { batch_id, .. }
            | BatchOutcome::Deferred { batch_id, .. } => batch_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    pub batches_processed_total: AtomicU64,
    pub batches_anchored_total: AtomicU64,
    pub batches_fraud_total: AtomicU64,
    pub submission_failures_total: AtomicU64,
    pub resubmissions_total: AtomicU64,
    pub ledger_deferrals_total: AtomicU64,
    pub ledger_resumes_total: AtomicU64,
    pub confirmations_total: AtomicU64,
}

/// Tunables taken from the `trust` and `pipeline` config sections
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub positive_delta: i32,
    pub fraud_delta: i32,
    pub anchor_retry: RetryPolicy,
    pub max_submission_attempts: u32,
}

impl ProcessorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            positive_delta: config.trust.positive_delta,
            fraud_delta: config.trust.fraud_delta,
            anchor_retry: config.pipeline.anchor_retry,
            max_submission_attempts: config.pipeline.max_submission_attempts,
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        let trust = TrustConfig::default();
        let pipeline = odotrust_core::PipelineConfig::default();
        Self {
            positive_delta: trust.positive_delta,
            fraud_delta: trust.fraud_delta,
            anchor_retry: pipeline.anchor_retry,
            max_submission_attempts: pipeline.max_submission_attempts,
        }
    }
}

/// Everything needed to finish a consolidated batch, whether it comes
/// straight from the segmenter or back from the store
struct Settlement {
    batch_id: String,
    vehicle_id: String,
    device_id: String,
    start_odometer: u64,
    end_odometer: u64,
    closed_at: u64,
    root: String,
    segments: Vec<Segment>,
    verdict: ContinuityVerdict,
    trust_applied: bool,
}

impl Settlement {
    fn payload(&self, credential: Option<WalletCredential>) -> AnchorPayload {
        AnchorPayload {
            batch_id: self.batch_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            commitment_root: self.root.clone(),
            segment_count: self.segments.len(),
            distance: self.segments.iter().map(|s| s.distance).sum(),
            start_odometer: self.start_odometer,
            end_odometer: self.end_odometer,
            closed_at: self.closed_at,
            credential,
        }
    }
}

/// Document uploaded to object storage for an accepted batch
#[derive(Serialize)]
struct BatchDocument<'a> {
    batch_id: &'a str,
    vehicle_id: &'a str,
    device_id: &'a str,
    commitment_root: &'a str,
    segments: &'a [Segment],
    verdict: &'a ContinuityVerdict,
}

pub struct BatchProcessor {
    segments: SegmentBuilder,
    validator: ContinuityValidator,
    ledger: Arc<TrustLedger>,
    store: Arc<BatchStore>,
    directory: Arc<dyn VehicleDirectory>,
    anchor: Arc<dyn AnchorClient>,
    storage: Option<Arc<dyn ObjectStorage>>,
    notifier: Arc<dyn Notifier>,
    credential: Option<WalletCredential>,
    settings: ProcessorSettings,
    metrics: ProcessorMetrics,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        segments: SegmentBuilder,
        validator: ContinuityValidator,
        ledger: Arc<TrustLedger>,
        store: Arc<BatchStore>,
        directory: Arc<dyn VehicleDirectory>,
        anchor: Arc<dyn AnchorClient>,
        notifier: Arc<dyn Notifier>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            segments,
            validator,
            ledger,
            store,
            directory,
            anchor,
            storage: None,
            notifier,
            credential: None,
            settings,
            metrics: ProcessorMetrics::default(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_credential(mut self, credential: WalletCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn store(&self) -> &Arc<BatchStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<TrustLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Run a closed batch through consolidation, fraud checks and anchoring
    pub async fn process(&self, batch: Batch) -> Result<BatchOutcome> {
        let batch = Arc::new(batch);
        self.metrics.batches_processed_total.fetch_add(1, Ordering::Relaxed);

        {
            let store = self.store.clone();
            let batch = batch.clone();
            blocking(move || store.record_closed(&batch)).await?;
        }

        let segments = self.segments.build(&batch)?;
        let tree = CommitmentTree::from_segments(&segments)?;
        let root = tree.root_hex();

        let last_accepted = {
            let store = self.store.clone();
            let batch = batch.clone();
            let root = root.clone();
            let segments = segments.clone();
            blocking(move || {
                store.mark_consolidating(&batch.id, &root, &segments)?;
                store.last_accepted_odometer(&batch.vehicle_id)
            })
            .await?
        };

        // First batch of a vehicle is its own baseline
        let baseline = last_accepted.unwrap_or(batch.start_odometer);
        let verdict = self.validator.validate_batch(&batch, baseline);
        {
            let store = self.store.clone();
            let batch_id = batch.id.clone();
            let verdict = verdict.clone();
            blocking(move || store.record_verdict(&batch_id, &verdict)).await?;
        }

        self.settle(Settlement {
            batch_id: batch.id.clone(),
            vehicle_id: batch.vehicle_id.clone(),
            device_id: batch.device_id.clone(),
            start_odometer: batch.start_odometer,
            end_odometer: batch.end_odometer,
            closed_at: closed_at(&batch),
            root,
            segments,
            verdict,
            trust_applied: false,
        })
        .await
    }

    /// Finish a batch parked by a failed trust update, from its stored
    /// root, segments and verdict
    pub async fn resume(&self, stored: &StoredBatch) -> Result<BatchOutcome> {
        let corrupt = |detail: &str| PipelineError::CorruptBatch {
            batch_id: stored.id.clone(),
            detail: detail.to_string(),
        };
        let root = stored
            .commitment_root
            .clone()
            .ok_or_else(|| corrupt("parked batch without commitment root"))?;
        let verdict = stored
            .verdict
            .clone()
            .ok_or_else(|| corrupt("parked batch without continuity verdict"))?;

        self.metrics.ledger_resumes_total.fetch_add(1, Ordering::Relaxed);
        debug!(batch_id = %stored.id, attempts = stored.ledger_attempts, "Resuming parked batch");
        self.settle(Settlement {
            batch_id: stored.id.clone(),
            vehicle_id: stored.vehicle_id.clone(),
            device_id: stored.device_id.clone(),
            start_odometer: stored.start_odometer,
            end_odometer: stored.end_odometer,
            closed_at: stored.closed_at,
            root,
            segments: stored.segments.clone(),
            verdict,
            trust_applied: stored.trust_applied,
        })
        .await
    }

    async fn settle(&self, settlement: Settlement) -> Result<BatchOutcome> {
        if !settlement.verdict.is_valid {
            return self.reject(settlement).await;
        }

        if !settlement.trust_applied {
            let accepted = Some(settlement.end_odometer);
            if let Some(deferred) = self
                .commit_trust(
                    &settlement,
                    self.settings.positive_delta,
                    "continuity passed",
                    TrustSource::Telemetry,
                    accepted,
                )
                .await?
            {
                return Ok(deferred);
            }
        }

        if let Some(storage) = &self.storage {
            self.upload(storage.as_ref(), &settlement).await;
        }

        let payload = settlement.payload(self.credential.clone());
        let anchor = self.anchor.clone();
        let submitted = with_retry_async(&self.settings.anchor_retry, |attempt| {
            let anchor = anchor.clone();
            let payload = payload.clone();
            async move {
                debug!(batch_id = %payload.batch_id, attempt, "Submitting commitment");
                anchor.submit(&payload).await
            }
        })
        .await;

        self.record_submission(
            &settlement.batch_id,
            &settlement.vehicle_id,
            &settlement.device_id,
            submitted,
        )
        .await
    }

    /// One more submission attempt for a batch whose earlier submission failed
    pub async fn resubmit(&self, stored: &StoredBatch) -> Result<BatchOutcome> {
        let root = stored
            .commitment_root
            .clone()
            .ok_or_else(|| PipelineError::CorruptBatch {
                batch_id: stored.id.clone(),
                detail: "failed submission without commitment root".to_string(),
            })?;

        self.metrics.resubmissions_total.fetch_add(1, Ordering::Relaxed);
        let payload = AnchorPayload {
            batch_id: stored.id.clone(),
            vehicle_id: stored.vehicle_id.clone(),
            commitment_root: root,
            segment_count: stored.segments.len(),
            distance: stored.distance(),
            start_odometer: stored.start_odometer,
            end_odometer: stored.end_odometer,
            closed_at: stored.closed_at,
            credential: self.credential.clone(),
        };

        let submitted = self.anchor.submit(&payload).await;
        self.record_submission(&stored.id, &stored.vehicle_id, &stored.device_id, submitted)
            .await
    }

    /// Ask the anchor whether a submitted commitment is final
    pub async fn confirm(&self, stored: &StoredBatch) -> Result<bool> {
        let Some(reference) = stored.anchor_reference.as_deref() else {
            return Err(PipelineError::CorruptBatch {
                batch_id: stored.id.clone(),
                detail: "anchored batch without reference".to_string(),
            });
        };

        let confirmed = self.anchor.confirm(reference).await?;
        if confirmed {
            let store = self.store.clone();
            let batch_id = stored.id.clone();
            blocking(move || store.mark_confirmed(&batch_id)).await?;
            self.metrics.confirmations_total.fetch_add(1, Ordering::Relaxed);
            info!(batch_id = %stored.id, reference, "Anchor confirmed");
        }
        Ok(confirmed)
    }

    async fn reject(&self, settlement: Settlement) -> Result<BatchOutcome> {
        let summary = settlement.verdict.summary();
        warn!(
            batch_id = %settlement.batch_id,
            vehicle_id = %settlement.vehicle_id,
            reasons = %summary,
            last_accepted = settlement.verdict.last_accepted_odometer,
            "Continuity check failed"
        );

        if !settlement.trust_applied {
            if let Some(deferred) = self
                .commit_trust(
                    &settlement,
                    self.settings.fraud_delta,
                    &summary,
                    TrustSource::FraudEngine,
                    None,
                )
                .await?
            {
                return Ok(deferred);
            }
        }
        {
            let store = self.store.clone();
            let batch_id = settlement.batch_id.clone();
            let summary = summary.clone();
            blocking(move || store.mark_fraud(&batch_id, &summary)).await?;
        }
        self.metrics.batches_fraud_total.fetch_add(1, Ordering::Relaxed);

        let Settlement {
            batch_id,
            vehicle_id,
            device_id,
            verdict,
            ..
        } = settlement;
        self.notify_owner(
            &device_id,
            Notification::FraudDetected {
                vehicle_id,
                batch_id: batch_id.clone(),
                reasons: verdict.reasons.iter().map(|r| r.as_str().to_string()).collect(),
            },
        )
        .await;

        Ok(BatchOutcome::Fraud { batch_id, verdict })
    }

    /// Write the trust delta, then mark it settled on the batch together
    /// with the accepted odometer.
    ///
    /// A ledger error parks the batch as `failed(ledger)` and returns the
    /// deferred outcome; nothing else about the vehicle has moved by then.
    async fn commit_trust(
        &self,
        settlement: &Settlement,
        change: i32,
        reason: &str,
        source: TrustSource,
        accepted_odometer: Option<u64>,
    ) -> Result<Option<BatchOutcome>> {
        if let Err(err) = self.apply_trust(settlement, change, reason, source).await {
            let message = err.to_string();
            let attempts = {
                let store = self.store.clone();
                let batch_id = settlement.batch_id.clone();
                let message = message.clone();
                blocking(move || store.mark_ledger_failed(&batch_id, &message)).await?
            };
            self.metrics.ledger_deferrals_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                batch_id = %settlement.batch_id,
                vehicle_id = %settlement.vehicle_id,
                attempts,
                retryable = err.is_retryable(),
                error = %message,
                "Trust update failed, batch parked"
            );
            return Ok(Some(BatchOutcome::Deferred {
                batch_id: settlement.batch_id.clone(),
                attempts,
                error: message,
            }));
        }

        let store = self.store.clone();
        let batch_id = settlement.batch_id.clone();
        let vehicle_id = settlement.vehicle_id.clone();
        blocking(move || store.settle_trust(&batch_id, &vehicle_id, accepted_odometer)).await?;
        Ok(None)
    }

    /// Apply a delta stamped at the trip's close time.
    ///
    /// A penalty that lands behind a later event is re-stamped with the
    /// current time; a reward in that position is skipped.
    async fn apply_trust(
        &self,
        settlement: &Settlement,
        change: i32,
        reason: &str,
        source: TrustSource,
    ) -> Result<()> {
        let ledger = self.ledger.clone();
        let vehicle_id = settlement.vehicle_id.clone();
        let reason = reason.to_string();
        let stamp = settlement.closed_at;

        let applied = blocking(move || {
            let outcome = match ledger.apply_delta(&vehicle_id, change, &reason, source, Some(stamp)) {
                Err(LedgerError::OutOfOrder { latest_timestamp, .. }) if change < 0 => {
                    debug!(vehicle_id = %vehicle_id, stamp, latest_timestamp, "Re-stamping penalty");
                    ledger
                        .apply_delta(&vehicle_id, change, &reason, source, None)
                        .map(Some)
                }
                Err(LedgerError::OutOfOrder { latest_timestamp, .. }) => {
                    warn!(
                        vehicle_id = %vehicle_id,
                        stamp,
                        latest_timestamp,
                        "Trust reward behind latest event, skipped"
                    );
                    Ok(None)
                }
                other => other.map(Some),
            };
            outcome.map_err(PipelineError::from)
        })
        .await?;

        if let Some(applied) = applied {
            info!(
                vehicle_id = %applied.vehicle_id,
                batch_id = %settlement.batch_id,
                change,
                previous_score = applied.previous_score,
                new_score = applied.new_score,
                "Trust score updated"
            );
        }
        Ok(())
    }

    async fn upload(&self, storage: &dyn ObjectStorage, settlement: &Settlement) {
        let document = BatchDocument {
            batch_id: &settlement.batch_id,
            vehicle_id: &settlement.vehicle_id,
            device_id: &settlement.device_id,
            commitment_root: &settlement.root,
            segments: &settlement.segments,
            verdict: &settlement.verdict,
        };
        let bytes = match serde_json::to_vec(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(batch_id = %settlement.batch_id, error = %e, "Batch document not serializable");
                return;
            }
        };
        let metadata = ObjectMetadata {
            content_type: "application/json".to_string(),
            batch_id: settlement.batch_id.clone(),
            vehicle_id: settlement.vehicle_id.clone(),
        };

        match storage.upload(bytes, metadata).await {
            Ok(object) => {
                let store = self.store.clone();
                let batch_id = settlement.batch_id.clone();
                let object_id = object.id.clone();
                if let Err(e) = blocking(move || store.set_storage_object(&batch_id, &object_id)).await {
                    warn!(batch_id = %settlement.batch_id, error = %e, "Storage object not recorded");
                }
            }
            Err(e) => warn!(batch_id = %settlement.batch_id, error = %e, "Batch upload failed"),
        }
    }

    async fn record_submission(
        &self,
        batch_id: &str,
        vehicle_id: &str,
        device_id: &str,
        submitted: std::result::Result<crate::collaborators::AnchorReceipt, ExternalError>,
    ) -> Result<BatchOutcome> {
        let store = self.store.clone();
        let id = batch_id.to_string();

        match submitted {
            Ok(receipt) => {
                let reference = receipt.reference.clone();
                blocking(move || store.mark_anchored(&id, &receipt.reference, receipt.confirmed))
                    .await?;
                self.metrics.batches_anchored_total.fetch_add(1, Ordering::Relaxed);
                info!(batch_id, vehicle_id, reference = %reference, "Batch anchored");

                self.notify_owner(
                    device_id,
                    Notification::BatchAnchored {
                        vehicle_id: vehicle_id.to_string(),
                        batch_id: batch_id.to_string(),
                        reference: reference.clone(),
                    },
                )
                .await;

                Ok(BatchOutcome::Anchored {
                    batch_id: batch_id.to_string(),
                    reference,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let attempts = {
                    let message = message.clone();
                    blocking(move || store.mark_submission_failed(&id, &message)).await?
                };
                self.metrics.submission_failures_total.fetch_add(1, Ordering::Relaxed);
                warn!(batch_id, vehicle_id, attempts, error = %message, "Anchor submission failed");

                if attempts >= self.settings.max_submission_attempts {
                    error!(batch_id, vehicle_id, attempts, "Anchor submission abandoned");
                    self.notify_owner(
                        device_id,
                        Notification::SubmissionAbandoned {
                            vehicle_id: vehicle_id.to_string(),
                            batch_id: batch_id.to_string(),
                            attempts,
                        },
                    )
                    .await;
                }

                Ok(BatchOutcome::SubmissionFailed {
                    batch_id: batch_id.to_string(),
                    attempts,
                    error: message,
                })
            }
        }
    }

    async fn notify_owner(&self, device_id: &str, notification: Notification) {
        match self.directory.lookup_device(device_id) {
            Some(record) => {
                notify_quietly(self.notifier.as_ref(), &record.owner_id, notification).await
            }
            None => debug!(device_id, "No owner to notify"),
        }
    }
}

fn closed_at(batch: &Batch) -> u64 {
    batch.closed_at.unwrap_or_else(|| batch.last_point_at())
}

/// Run blocking store or ledger work off the async workers
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?
}
