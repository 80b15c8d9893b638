//! Batch processor and sweeper against real SQLite stores with stub collaborators

use async_trait::async_trait;
use odotrust_core::{RetryPolicy, SegmenterConfig, TelemetryPoint};
use odotrust_pipeline::{
    AnchorClient, AnchorPayload, AnchorReceipt, BatchOutcome, BatchProcessor, BatchStore,
    ExternalError, ExternalResult, FailureKind, Notification, Notifier, ProcessorSettings,
    SubmissionSweeper, SweeperConfig,
};
use odotrust_telemetry::{Batch, BatchStatus, CloseReason, SegmentBuilder, StaticDirectory, TripSegmenter};
use odotrust_trust::{ContinuityReason, ContinuityValidator, TrustLedger, TrustSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fails the first `failures` submissions, then accepts
struct StubAnchor {
    failures: AtomicU32,
    submits: AtomicU32,
    final_after_confirm: bool,
}

impl StubAnchor {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            submits: AtomicU32::new(0),
            final_after_confirm: true,
        }
    }
}

#[async_trait]
impl AnchorClient for StubAnchor {
    async fn submit(&self, payload: &AnchorPayload) -> ExternalResult<AnchorReceipt> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok()
        {
            return Err(ExternalError::unavailable("anchor", "connection refused"));
        }
        Ok(AnchorReceipt {
            reference: format!("tx-{}", payload.batch_id),
            confirmed: false,
        })
    }

    async fn confirm(&self, _reference: &str) -> ExternalResult<bool> {
        Ok(self.final_after_confirm)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(String, Notification)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: &str, notification: &Notification) -> ExternalResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user_id.to_string(), notification.clone()));
        Ok(())
    }
}

struct Harness {
    processor: Arc<BatchProcessor>,
    anchor: Arc<StubAnchor>,
    notifier: Arc<RecordingNotifier>,
    directory: Arc<StaticDirectory>,
    paths: Vec<PathBuf>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        for path in &self.paths {
            std::fs::remove_file(path).ok();
            std::fs::remove_file(path.with_extension("db-wal")).ok();
            std::fs::remove_file(path.with_extension("db-shm")).ok();
        }
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("test_pipe_{}_{}.db", name, uuid::Uuid::new_v4()))
}

fn harness(anchor_failures: u32) -> Harness {
    harness_at(temp_path("trust"), anchor_failures)
}

fn harness_at(trust_path: PathBuf, anchor_failures: u32) -> Harness {
    let batch_path = temp_path("batches");

    let directory = Arc::new(StaticDirectory::new());
    directory.register("dev-1", "veh-1", "owner-1");
    let anchor = Arc::new(StubAnchor::new(anchor_failures));
    let notifier = Arc::new(RecordingNotifier::default());

    let settings = ProcessorSettings {
        anchor_retry: RetryPolicy::none(),
        max_submission_attempts: 3,
        ..ProcessorSettings::default()
    };
    let processor = BatchProcessor::new(
        SegmentBuilder::from_config(&SegmenterConfig::default()),
        ContinuityValidator::default(),
        Arc::new(TrustLedger::open(&trust_path).unwrap()),
        Arc::new(BatchStore::open(&batch_path).unwrap()),
        directory.clone(),
        anchor.clone(),
        notifier.clone(),
        settings,
    );

    Harness {
        processor: Arc::new(processor),
        anchor,
        notifier,
        directory,
        paths: vec![trust_path, batch_path],
    }
}

fn sweeper(h: &Harness) -> SubmissionSweeper {
    let segmenter = Arc::new(TripSegmenter::new(SegmenterConfig::default(), h.directory.clone()));
    SubmissionSweeper::new(
        h.processor.clone(),
        segmenter,
        SweeperConfig {
            interval: Duration::from_millis(10),
            batch_size: 10,
            inter_submission_delay: Duration::ZERO,
            max_attempts: 3,
        },
    )
}

fn trip(start: u64, end: u64, t0: u64) -> Batch {
    let mut batch = Batch::open("veh-1", TelemetryPoint::new("dev-1", start, 40.0, 1800, t0));
    batch.push(TelemetryPoint::new("dev-1", end, 0.0, 0, t0 + 60_000));
    batch.close(CloseReason::EngineOff);
    batch
}

#[tokio::test]
async fn accepted_batch_is_anchored_and_scored() {
    let h = harness(0);
    let batch = trip(1000, 1050, 1_000_000);
    let batch_id = batch.id.clone();

    let outcome = h.processor.process(batch).await.unwrap();
    assert_eq!(
        outcome,
        BatchOutcome::Anchored {
            batch_id: batch_id.clone(),
            reference: format!("tx-{}", batch_id),
        }
    );

    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Anchored);
    assert_eq!(stored.distance(), 50);
    assert!(stored.commitment_root.is_some());
    assert!(stored.verdict.as_ref().unwrap().is_valid);
    assert_eq!(
        h.processor.store().last_accepted_odometer("veh-1").unwrap(),
        Some(1050)
    );

    let events = h.processor.ledger().events_for("veh-1").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, TrustSource::Telemetry);
    assert_eq!(events[0].event_timestamp, 1_060_000);
    assert_eq!(h.processor.ledger().current_score("veh-1").unwrap(), 100);

    let sent = h.notifier.sent.lock().unwrap();
    assert!(matches!(&sent[..], [(owner, Notification::BatchAnchored { .. })] if owner == "owner-1"));
}

#[tokio::test]
async fn rollback_is_fraud_and_skips_anchor() {
    let h = harness(0);
    h.processor.process(trip(67_000, 67_040, 1_000_000)).await.unwrap();
    let submits_before = h.anchor.submits.load(Ordering::SeqCst);

    let outcome = h.processor.process(trip(82, 90, 2_000_000)).await.unwrap();
    let BatchOutcome::Fraud { batch_id, verdict } = outcome else {
        panic!("expected fraud outcome");
    };
    assert!(verdict.has_reason(ContinuityReason::Rollback));
    assert_eq!(h.anchor.submits.load(Ordering::SeqCst), submits_before);

    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert_eq!(stored.failure, Some(FailureKind::Fraud));
    // Accepted mileage is not moved by a rejected batch
    assert_eq!(
        h.processor.store().last_accepted_odometer("veh-1").unwrap(),
        Some(67_040)
    );

    let latest = h.processor.ledger().latest_event("veh-1").unwrap().unwrap();
    assert_eq!(latest.change, -20);
    assert_eq!(latest.source, TrustSource::FraudEngine);
    assert_eq!(h.processor.ledger().current_score("veh-1").unwrap(), 80);

    let sent = h.notifier.sent.lock().unwrap();
    assert!(sent
        .iter()
        .any(|(_, n)| matches!(n, Notification::FraudDetected { reasons, .. } if reasons.contains(&"rollback detected".to_string()))));
}

#[tokio::test]
async fn failed_submission_is_retried_by_sweeper() {
    let h = harness(1);
    let batch = trip(1000, 1050, 1_000_000);
    let batch_id = batch.id.clone();

    let outcome = h.processor.process(batch).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::SubmissionFailed { attempts: 1, .. }));
    // Trust and mileage are not rolled back by an anchor failure
    assert_eq!(
        h.processor.store().last_accepted_odometer("veh-1").unwrap(),
        Some(1050)
    );
    assert_eq!(h.processor.ledger().events_for("veh-1").unwrap().len(), 1);

    let sweeper = sweeper(&h);
    let (resubmitted, anchored) = sweeper.sweep_submissions().await.unwrap();
    assert_eq!((resubmitted, anchored), (1, 1));
    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Anchored);
    assert_eq!(stored.failure, None);
    assert!(!stored.anchor_confirmed);

    assert_eq!(sweeper.sweep_confirmations().await.unwrap(), 1);
    assert!(h.processor.store().get(&batch_id).unwrap().unwrap().anchor_confirmed);
}

#[tokio::test]
async fn exhausted_submissions_notify_owner() {
    let h = harness(10);
    let outcome = h.processor.process(trip(1000, 1050, 1_000_000)).await.unwrap();
    let BatchOutcome::SubmissionFailed { batch_id, .. } = outcome else {
        panic!("expected submission failure");
    };

    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    h.processor.resubmit(&stored).await.unwrap();
    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    let last = h.processor.resubmit(&stored).await.unwrap();
    assert!(matches!(last, BatchOutcome::SubmissionFailed { attempts: 3, .. }));
    assert!(h.processor.store().pending_submissions(3, 10).unwrap().is_empty());

    let sent = h.notifier.sent.lock().unwrap();
    assert!(sent
        .iter()
        .any(|(_, n)| matches!(n, Notification::SubmissionAbandoned { attempts: 3, .. })));
}

#[tokio::test]
async fn late_penalty_is_restamped() {
    let h = harness(0);
    h.processor
        .ledger()
        .apply_delta("veh-1", 0, "manual review", TrustSource::Manual, Some(5_000_000))
        .unwrap();
    h.processor
        .store()
        .accept_odometer("veh-1", 5_000, "seed")
        .unwrap();

    // Closed before the manual event: the penalty still lands
    let outcome = h.processor.process(trip(10, 20, 1_000_000)).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Fraud { .. }));
    let latest = h.processor.ledger().latest_event("veh-1").unwrap().unwrap();
    assert_eq!(latest.change, -20);
    assert!(latest.event_timestamp >= 5_000_000);
}

#[tokio::test]
async fn ledger_failure_parks_batch_until_repaired() {
    let trust_path = temp_path("trust");
    {
        let ledger = TrustLedger::open(&trust_path).unwrap();
        ledger
            .apply_delta("veh-1", -10, "manual review", TrustSource::Manual, Some(500_000))
            .unwrap();
        ledger
            .__test_execute_raw_sql("UPDATE vehicle_scores SET score = 42 WHERE vehicle_id = 'veh-1'")
            .unwrap();
    }
    // Reopening flags veh-1 and blocks its trust writes
    let h = harness_at(trust_path, 0);
    assert!(!h.processor.ledger().health().is_ok());

    let batch = trip(1000, 1050, 1_000_000);
    let batch_id = batch.id.clone();
    let outcome = h.processor.process(batch).await.unwrap();
    assert!(matches!(outcome, BatchOutcome::Deferred { attempts: 1, .. }));

    // Nothing moved besides the parked batch
    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Failed);
    assert_eq!(stored.failure, Some(FailureKind::Ledger));
    assert!(!stored.trust_applied);
    assert_eq!(h.processor.store().last_accepted_odometer("veh-1").unwrap(), None);
    assert_eq!(h.processor.ledger().events_for("veh-1").unwrap().len(), 1);
    assert_eq!(h.anchor.submits.load(Ordering::SeqCst), 0);

    let sweeper = sweeper(&h);
    assert_eq!(sweeper.sweep_ledger().await.unwrap(), (1, 0));
    assert_eq!(
        h.processor.store().get(&batch_id).unwrap().unwrap().ledger_attempts,
        2
    );

    assert_eq!(h.processor.ledger().repair().unwrap(), vec!["veh-1".to_string()]);
    assert_eq!(sweeper.sweep_ledger().await.unwrap(), (1, 1));

    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.status, BatchStatus::Anchored);
    assert_eq!(stored.failure, None);
    assert!(stored.trust_applied);
    assert_eq!(
        h.processor.store().last_accepted_odometer("veh-1").unwrap(),
        Some(1050)
    );
    assert_eq!(h.processor.ledger().events_for("veh-1").unwrap().len(), 2);
    assert_eq!(h.processor.ledger().current_score("veh-1").unwrap(), 91);
    assert!(h.processor.store().pending_ledger(3, 10).unwrap().is_empty());
    assert_eq!(sweeper.sweep_submissions().await.unwrap(), (0, 0));
}

#[tokio::test]
async fn parked_fraud_batch_is_penalized_once_on_resume() {
    let trust_path = temp_path("trust");
    {
        let ledger = TrustLedger::open(&trust_path).unwrap();
        ledger
            .apply_delta("veh-1", 0, "baseline", TrustSource::Manual, Some(500_000))
            .unwrap();
        ledger
            .__test_execute_raw_sql("UPDATE vehicle_scores SET score = 55 WHERE vehicle_id = 'veh-1'")
            .unwrap();
    }
    let h = harness_at(trust_path, 0);
    h.processor.store().accept_odometer("veh-1", 67_000, "seed").unwrap();

    let outcome = h.processor.process(trip(82, 90, 1_000_000)).await.unwrap();
    let BatchOutcome::Deferred { batch_id, .. } = outcome else {
        panic!("expected deferred outcome");
    };
    assert!(h.notifier.sent.lock().unwrap().is_empty());

    h.processor.ledger().repair().unwrap();
    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    let resumed = h.processor.resume(&stored).await.unwrap();
    assert!(matches!(resumed, BatchOutcome::Fraud { .. }));

    let stored = h.processor.store().get(&batch_id).unwrap().unwrap();
    assert_eq!(stored.failure, Some(FailureKind::Fraud));
    assert!(stored.trust_applied);
    let events = h.processor.ledger().events_for("veh-1").unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].change, -20);
    assert_eq!(h.processor.ledger().current_score("veh-1").unwrap(), 80);
    assert_eq!(
        h.processor.store().last_accepted_odometer("veh-1").unwrap(),
        Some(67_000)
    );
    assert!(h
        .notifier
        .sent
        .lock()
        .unwrap()
        .iter()
        .any(|(_, n)| matches!(n, Notification::FraudDetected { .. })));
}
