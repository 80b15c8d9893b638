//! Telemetry to anchor, through the running pipeline
//!
//! Trip timestamps start at the current time so the background idle sweep
//! never closes a trip mid-replay.

use crate::test_utils::{drive, idle, CountingAnchor, RecordingNotifier, TestEnv, MINUTE_MS};
use odotrust_core::{commit, current_timestamp_ms, CommitmentTree};
use odotrust_pipeline::{FailureKind, Notification, Pipeline};
use odotrust_telemetry::{BatchStatus, TripSegmenter};
use odotrust_trust::{ContinuityReason, TrustSource};
use std::sync::Arc;

#[tokio::test]
async fn test_end_to_end_trip_is_anchored_and_scored() {
    let env = TestEnv::new();
    env.directory.register("obd-1", "veh-e2e", "alice");
    let anchor = Arc::new(CountingAnchor::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = Arc::new(env.processor(anchor.clone(), notifier.clone()));
    let segmenter = Arc::new(TripSegmenter::new(
        env.config.segmenter.clone(),
        env.directory.clone(),
    ));
    let pipeline = Pipeline::start(&env.config, segmenter.clone(), processor.clone());

    // 1000 -> 1050 over 40 minutes, then three engine-off readings
    let start = current_timestamp_ms();
    let mut points = drive("obd-1", 1000, 50, start, 40);
    points.extend(idle("obd-1", 1050, start + 40 * MINUTE_MS, 3));
    for point in points {
        pipeline.submit(point).await.unwrap();
    }
    pipeline.shutdown().await.unwrap();

    assert_eq!(segmenter.open_batch_count(), 0);
    let batches = processor.store().batches_for_vehicle("veh-e2e").unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.status, BatchStatus::Anchored);
    assert_eq!(batch.close_reason.as_deref(), Some("engine off"));
    assert_eq!(batch.point_count, 44);
    assert_eq!(batch.start_odometer, 1000);
    assert_eq!(batch.end_odometer, 1050);
    assert_eq!(batch.distance(), 50);

    let tree = CommitmentTree::from_segments(&batch.segments).unwrap();
    assert_eq!(commit(&batch.segments).unwrap(), tree.root());
    let expected_root = tree.root_hex();
    assert_eq!(batch.commitment_root.as_deref(), Some(expected_root.as_str()));

    let verdict = batch.verdict.as_ref().unwrap();
    assert!(verdict.is_valid);
    assert!(verdict.reasons.is_empty());

    assert_eq!(anchor.calls(), 1);
    let payload = anchor.payloads.lock().unwrap()[0].clone();
    assert_eq!(payload.commitment_root, expected_root);
    assert_eq!(payload.distance, 50);
    let reference = format!("0x{}", &expected_root[..16]);
    assert_eq!(batch.anchor_reference.as_deref(), Some(reference.as_str()));

    // Default 100 plus the +1 reward stays clamped at 100
    let ledger = processor.ledger();
    assert_eq!(ledger.current_score("veh-e2e").unwrap(), 100);
    let events = ledger.events_for("veh-e2e").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].change, 1);
    assert_eq!(events[0].previous_score, 100);
    assert_eq!(events[0].new_score, 100);
    assert_eq!(events[0].source, TrustSource::Telemetry);

    assert_eq!(
        processor.store().last_accepted_odometer("veh-e2e").unwrap(),
        Some(1050)
    );
    assert!(matches!(
        notifier.for_user("alice").as_slice(),
        [Notification::BatchAnchored { .. }]
    ));
}

#[tokio::test]
async fn test_rollback_trip_is_rejected_without_anchor_call() {
    let env = TestEnv::new();
    env.directory.register("obd-2", "veh-fraud", "bob");
    let anchor = Arc::new(CountingAnchor::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = Arc::new(env.processor(anchor.clone(), notifier.clone()));

    // Vehicle history: 67000 accepted, score already down to 10
    processor
        .store()
        .accept_odometer("veh-fraud", 67_000, "earlier-batch")
        .unwrap();
    processor
        .ledger()
        .apply_delta("veh-fraud", -90, "prior flags", TrustSource::Manual, None)
        .unwrap();

    let segmenter = Arc::new(TripSegmenter::new(
        env.config.segmenter.clone(),
        env.directory.clone(),
    ));
    let pipeline = Pipeline::start(&env.config, segmenter, processor.clone());

    let start = current_timestamp_ms() + MINUTE_MS;
    let mut points = drive("obd-2", 82, 8, start, 10);
    points.extend(idle("obd-2", 90, start + 10 * MINUTE_MS, 3));
    for point in points {
        pipeline.submit(point).await.unwrap();
    }
    pipeline.shutdown().await.unwrap();

    let batches = processor.store().batches_for_vehicle("veh-fraud").unwrap();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.failure, Some(FailureKind::Fraud));
    let verdict = batch.verdict.as_ref().unwrap();
    assert!(!verdict.is_valid);
    assert!(verdict.has_reason(ContinuityReason::Rollback));
    assert_eq!(verdict.last_accepted_odometer, 67_000);

    assert_eq!(anchor.calls(), 0);
    assert!(batch.anchor_reference.is_none());

    let latest = processor.ledger().latest_event("veh-fraud").unwrap().unwrap();
    assert_eq!(latest.change, -20);
    assert_eq!(latest.previous_score, 10);
    assert_eq!(latest.new_score, 0);
    assert_eq!(latest.source, TrustSource::FraudEngine);
    assert_eq!(processor.ledger().current_score("veh-fraud").unwrap(), 0);
    assert!(processor.ledger().audit("veh-fraud").unwrap().is_consistent());

    // Rejected mileage never becomes the baseline
    assert_eq!(
        processor.store().last_accepted_odometer("veh-fraud").unwrap(),
        Some(67_000)
    );
    assert!(notifier
        .for_user("bob")
        .iter()
        .any(|n| matches!(n, Notification::FraudDetected { vehicle_id, .. } if vehicle_id == "veh-fraud")));
}

#[tokio::test]
async fn test_many_devices_keep_per_vehicle_history() {
    let env = TestEnv::new();
    let devices = 6;
    for d in 0..devices {
        env.directory
            .register(&format!("obd-{}", d), &format!("veh-{}", d), "fleet");
    }
    let anchor = Arc::new(CountingAnchor::new());
    let processor = Arc::new(env.processor(anchor.clone(), Arc::new(RecordingNotifier::default())));
    let segmenter = Arc::new(TripSegmenter::new(
        env.config.segmenter.clone(),
        env.directory.clone(),
    ));
    let pipeline = Pipeline::start(&env.config, segmenter, processor.clone());

    // Two trips per device, interleaved across devices
    let start = current_timestamp_ms();
    let mut streams: Vec<Vec<_>> = (0..devices)
        .map(|d| {
            let device = format!("obd-{}", d);
            let base = 10_000 * (d as u64 + 1);
            let mut points = drive(&device, base, 20, start, 10);
            points.extend(idle(&device, base + 20, start + 10 * MINUTE_MS, 3));
            let second = start + 60 * MINUTE_MS;
            points.extend(drive(&device, base + 20, 30, second, 10));
            points.extend(idle(&device, base + 50, second + 10 * MINUTE_MS, 3));
            points.into_iter().rev().collect()
        })
        .collect();

    while streams.iter().any(|s| !s.is_empty()) {
        for stream in streams.iter_mut() {
            if let Some(point) = stream.pop() {
                pipeline.submit(point).await.unwrap();
            }
        }
    }
    pipeline.shutdown().await.unwrap();

    assert_eq!(anchor.calls(), devices * 2);
    for d in 0..devices {
        let vehicle = format!("veh-{}", d);
        let batches = processor.store().batches_for_vehicle(&vehicle).unwrap();
        assert_eq!(batches.len(), 2, "vehicle {}", vehicle);
        assert!(batches.iter().all(|b| b.status == BatchStatus::Anchored));
        assert_eq!(batches[0].distance() + batches[1].distance(), 50);

        let events = processor.ledger().events_for(&vehicle).unwrap();
        assert_eq!(events.len(), 2);
        assert!(processor.ledger().audit(&vehicle).unwrap().is_consistent());
        assert_eq!(
            processor.store().last_accepted_odometer(&vehicle).unwrap(),
            Some(10_000 * (d as u64 + 1) + 50)
        );
    }
}

#[tokio::test]
async fn test_historical_replay_is_not_split_by_idle_sweep() {
    let mut env = TestEnv::new();
    env.config.pipeline.sweep_interval_ms = 10;
    env.directory.register("obd-h", "veh-hist", "dana");
    let anchor = Arc::new(CountingAnchor::new());
    let processor = Arc::new(env.processor(anchor.clone(), Arc::new(RecordingNotifier::default())));
    let segmenter = Arc::new(TripSegmenter::new(
        env.config.segmenter.clone(),
        env.directory.clone(),
    ));
    let pipeline = Pipeline::start(&env.config, segmenter.clone(), processor.clone());

    // 2023-11-14, far older than any idle timeout on the wall clock
    let start = 1_700_000_000_000;
    let mut points = drive("obd-h", 5_000, 30, start, 30);
    points.extend(idle("obd-h", 5_030, start + 30 * MINUTE_MS, 3));
    let (first, rest) = points.split_at(15);

    for point in first.iter().cloned() {
        pipeline.submit(point).await.unwrap();
    }
    // Several sweeper ticks while the trip is still open
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(segmenter.open_batch_count(), 1);

    for point in rest.iter().cloned() {
        pipeline.submit(point).await.unwrap();
    }
    pipeline.shutdown().await.unwrap();

    let batches = processor.store().batches_for_vehicle("veh-hist").unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].close_reason.as_deref(), Some("engine off"));
    assert_eq!(batches[0].point_count, 34);
    assert_eq!(batches[0].distance(), 30);
    assert_eq!(anchor.calls(), 1);
}
