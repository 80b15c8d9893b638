//! Marketplace verification backed by the real trust ledger and batch store

use crate::test_utils::{drive, idle, CountingAnchor, MemoryStorage, RecordingNotifier, TestEnv, MINUTE_MS};
use odotrust_core::{current_timestamp_ms, Classify};
use odotrust_market::{
    EscrowStatus, MarketError, PurchaseEngine, PurchaseStatus, SellerResponse, TransferStep,
    VerificationPolicy,
};
use odotrust_pipeline::{
    BatchOutcome, BatchProcessor, Notification, SubmissionSweeper, SweeperConfig,
};
use odotrust_telemetry::{Batch, CloseReason, TripSegmenter};
use rust_decimal::Decimal;
use std::sync::Arc;

struct Marketplace {
    env: TestEnv,
    processor: Arc<BatchProcessor>,
    engine: Arc<PurchaseEngine>,
    anchor: Arc<CountingAnchor>,
    notifier: Arc<RecordingNotifier>,
}

fn marketplace(policy: VerificationPolicy) -> Marketplace {
    let env = TestEnv::new();
    env.directory.register("obd-s", "veh-sale", "alice");

    let anchor = Arc::new(CountingAnchor::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = Arc::new(
        env.processor(anchor.clone(), notifier.clone())
            .with_storage(Arc::new(MemoryStorage::default())),
    );
    let engine = PurchaseEngine::open(
        &env.config.storage.market_db_path,
        policy,
        processor.ledger().clone(),
        processor.store().clone(),
    )
    .unwrap();
    engine.register_vehicle("veh-sale", "alice").unwrap();

    Marketplace {
        env,
        processor,
        engine: Arc::new(engine),
        anchor,
        notifier,
    }
}

fn closed_trip(start_odometer: u64, distance: u64, start_ts: u64) -> Batch {
    let mut points = drive("obd-s", start_odometer, distance, start_ts, 20);
    points.extend(idle("obd-s", start_odometer + distance, start_ts + 20 * MINUTE_MS, 3));
    let mut iter = points.into_iter();
    let mut batch = Batch::open("veh-sale", iter.next().unwrap());
    for point in iter {
        batch.push(point);
    }
    batch.close(CloseReason::EngineOff);
    batch
}

fn sweeper(m: &Marketplace) -> SubmissionSweeper {
    SubmissionSweeper::new(
        m.processor.clone(),
        Arc::new(TripSegmenter::new(
            m.env.config.segmenter.clone(),
            m.env.directory.clone(),
        )),
        SweeperConfig::from_pipeline(&m.env.config.pipeline),
    )
}

fn price() -> Decimal {
    Decimal::new(1_850_000, 2)
}

/// Create, accept and fund a request from `buyer`
fn funded_request(m: &Marketplace, buyer: &str, key: &str) -> String {
    let request = m.engine.create_request("veh-sale", buyer, price()).unwrap();
    m.engine
        .respond(&request.id, "alice", SellerResponse::Accept)
        .unwrap();
    m.engine.fund_escrow(&request.id, buyer, price(), key).unwrap();
    request.id
}

#[tokio::test]
async fn test_anchored_history_passes_strict_verification_and_sells() {
    let m = marketplace(VerificationPolicy::strict(70));
    let outcome = m
        .processor
        .process(closed_trip(20_000, 35, current_timestamp_ms()))
        .await
        .unwrap();
    let BatchOutcome::Anchored { reference, .. } = outcome else {
        panic!("expected anchored batch");
    };

    // Receipt starts unconfirmed; strict policy needs the confirmation
    let request_id = funded_request(&m, "carol", "fund-1");
    let early = m.engine.verify(&request_id).unwrap();
    assert!(!early.passed);
    assert!(!early.anchor.passed);
    assert_eq!(
        m.engine.request(&request_id).unwrap().status,
        PurchaseStatus::VerificationFailed
    );

    assert_eq!(sweeper(&m).sweep_confirmations().await.unwrap(), 1);

    let request_id = funded_request(&m, "carol", "fund-2");
    let result = m.engine.verify(&request_id).unwrap();
    assert!(result.passed, "reasons: {:?}", result.reasons);
    assert!(result.trust_score.passed && result.continuity.passed);
    assert!(result.anchor.passed && result.storage.passed);
    assert_eq!(result.score, 100);

    let sale = m.engine.confirm_transfer(&request_id, "alice").unwrap();
    assert_eq!(sale.buyer_id, "carol");
    assert_eq!(sale.anchor_reference.as_deref(), Some(reference.as_str()));
    assert_eq!(m.engine.owner_of("veh-sale").unwrap().as_deref(), Some("carol"));

    // Later fraud flags reach the new owner
    m.env.directory.update_owner("veh-sale", "carol");
    let outcome = m
        .processor
        .process(closed_trip(100, 5, current_timestamp_ms() + 60 * MINUTE_MS))
        .await
        .unwrap();
    assert!(matches!(outcome, BatchOutcome::Fraud { .. }));
    assert!(m
        .notifier
        .for_user("carol")
        .iter()
        .any(|n| matches!(n, Notification::FraudDetected { .. })));
    assert_eq!(m.anchor.calls(), 1);
}

#[tokio::test]
async fn test_fraud_flag_fails_verification_and_refunds() {
    let m = marketplace(VerificationPolicy::strict(70));
    let now = current_timestamp_ms();
    m.processor.process(closed_trip(20_000, 35, now)).await.unwrap();
    m.processor
        .process(closed_trip(50, 10, now + 60 * MINUTE_MS))
        .await
        .unwrap();
    assert_eq!(m.processor.ledger().current_score("veh-sale").unwrap(), 80);

    let request_id = funded_request(&m, "dave", "fund-f");
    let result = m.engine.verify(&request_id).unwrap();
    assert!(!result.passed);
    assert!(result.trust_score.passed);
    assert!(!result.continuity.passed);
    assert!(result
        .reasons
        .contains(&"latest continuity verdict failed".to_string()));

    let request = m.engine.request(&request_id).unwrap();
    assert_eq!(request.status, PurchaseStatus::VerificationFailed);
    let escrow = m.engine.escrow(request.escrow_id.as_deref().unwrap()).unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);
    assert_eq!(m.engine.owner_of("veh-sale").unwrap().as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_default_policy_uses_live_trust_score() {
    let m = marketplace(VerificationPolicy::default());
    let now = current_timestamp_ms();
    m.processor.process(closed_trip(20_000, 35, now)).await.unwrap();
    // Two rejected trips: 100 -> 80 -> 60
    m.processor
        .process(closed_trip(50, 10, now + 60 * MINUTE_MS))
        .await
        .unwrap();
    m.processor
        .process(closed_trip(60, 10, now + 120 * MINUTE_MS))
        .await
        .unwrap();

    let request_id = funded_request(&m, "erin", "fund-d");
    let result = m.engine.verify(&request_id).unwrap();
    assert_eq!(result.score, 60);
    assert!(!result.passed);
    assert_eq!(
        result.reasons,
        vec!["trust score 60 below minimum 70".to_string()]
    );
}

#[tokio::test]
async fn test_injected_fault_keeps_ownership_and_escrow() {
    let m = marketplace(VerificationPolicy::default());
    let request_id = funded_request(&m, "carol", "fund-x");
    assert!(m.engine.verify(&request_id).unwrap().passed);

    m.engine.__inject_transfer_fault(TransferStep::AfterSaleRecord);
    let err = m.engine.confirm_transfer(&request_id, "alice").unwrap_err();
    assert!(matches!(err, MarketError::TransferFault(TransferStep::AfterSaleRecord)));

    assert_eq!(m.engine.owner_of("veh-sale").unwrap().as_deref(), Some("alice"));
    assert_eq!(m.engine.ownership_history("veh-sale").unwrap().len(), 1);
    assert!(m.engine.sale_record_for(&request_id).unwrap().is_none());
    let request = m.engine.request(&request_id).unwrap();
    assert_eq!(request.status, PurchaseStatus::VerificationPassed);
    let escrow = m.engine.escrow(request.escrow_id.as_deref().unwrap()).unwrap();
    assert_eq!(escrow.status, EscrowStatus::Funded);

    m.engine.confirm_transfer(&request_id, "alice").unwrap();
    assert_eq!(m.engine.owner_of("veh-sale").unwrap().as_deref(), Some("carol"));
    let escrow = m.engine.escrow(request.escrow_id.as_deref().unwrap()).unwrap();
    assert_eq!(escrow.status, EscrowStatus::Released);
}

#[test]
fn test_concurrent_funding_with_one_key_creates_one_escrow() {
    let m = marketplace(VerificationPolicy::default());
    let request = m.engine.create_request("veh-sale", "carol", price()).unwrap();
    m.engine
        .respond(&request.id, "alice", SellerResponse::Accept)
        .unwrap();

    let escrows: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = &m.engine;
                let request_id = &request.id;
                scope.spawn(move || engine.fund_escrow(request_id, "carol", price(), "same-key"))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let ids: Vec<String> = escrows
        .into_iter()
        .filter_map(|r| match r {
            Ok(escrow) => Some(escrow.id),
            // Lock contention surfaces as a retryable error
            Err(e) if e.is_retryable() => None,
            Err(other) => panic!("unexpected funding error: {}", other),
        })
        .collect();
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(m.engine.escrow_count(&request.id).unwrap(), 1);
    assert_eq!(
        m.engine.request(&request.id).unwrap().status,
        PurchaseStatus::EscrowFunded
    );
}
