//! Shared fixtures for the cross-crate scenarios

use async_trait::async_trait;
use odotrust_core::{Config, RetryPolicy, TelemetryPoint};
use odotrust_pipeline::{
    AnchorClient, AnchorPayload, AnchorReceipt, BatchProcessor, ExternalError, ExternalResult,
    Notification, Notifier, ObjectMetadata, ObjectStorage, Pipeline, StoredObject,
};
use odotrust_telemetry::StaticDirectory;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const MINUTE_MS: u64 = 60_000;

/// Install a test subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Temp databases plus a config pointing at them
pub struct TestEnv {
    pub config: Config,
    pub directory: Arc<StaticDirectory>,
    paths: Vec<PathBuf>,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let temp_path = |name: &str| {
            std::env::temp_dir().join(format!("test_{}_{}.db", name, uuid::Uuid::new_v4()))
        };

        let mut config = Config::default();
        config.storage.trust_db_path = temp_path("trust");
        config.storage.batch_db_path = temp_path("batches");
        config.storage.market_db_path = temp_path("market");
        config.pipeline.workers = 2;
        config.pipeline.queue_capacity = 64;
        // Sweeps are driven by hand in tests
        config.pipeline.sweep_interval_ms = 3_600_000;
        config.pipeline.inter_submission_delay_ms = 0;
        config.pipeline.anchor_retry = RetryPolicy::none();

        let paths = vec![
            config.storage.trust_db_path.clone(),
            config.storage.batch_db_path.clone(),
            config.storage.market_db_path.clone(),
        ];

        Self {
            config,
            directory: Arc::new(StaticDirectory::new()),
            paths,
        }
    }

    pub fn processor(
        &self,
        anchor: Arc<dyn AnchorClient>,
        notifier: Arc<dyn Notifier>,
    ) -> BatchProcessor {
        Pipeline::build_processor(&self.config, self.directory.clone(), anchor, notifier)
            .expect("processor")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        for path in &self.paths {
            std::fs::remove_file(path).ok();
            std::fs::remove_file(path.with_extension("db-wal")).ok();
            std::fs::remove_file(path.with_extension("db-shm")).ok();
        }
    }
}

/// Anchor that records payloads and can fail the first N submissions
#[derive(Default)]
pub struct CountingAnchor {
    fail_first: AtomicU32,
    unconfirmed: AtomicBool,
    pub payloads: Mutex<Vec<AnchorPayload>>,
}

impl CountingAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        let anchor = Self::default();
        anchor.fail_first.store(failures, Ordering::SeqCst);
        anchor
    }

    pub fn set_unconfirmed(&self, unconfirmed: bool) {
        self.unconfirmed.store(unconfirmed, Ordering::SeqCst);
    }

    /// Submission calls, failed ones included
    pub fn calls(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl AnchorClient for CountingAnchor {
    async fn submit(&self, payload: &AnchorPayload) -> ExternalResult<AnchorReceipt> {
        self.payloads.lock().unwrap().push(payload.clone());
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExternalError::unavailable("anchor", "503 service unavailable"));
        }
        Ok(AnchorReceipt {
            reference: format!("0x{}", &payload.commitment_root[..16]),
            confirmed: false,
        })
    }

    async fn confirm(&self, _reference: &str) -> ExternalResult<bool> {
        Ok(!self.unconfirmed.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, Notification)>>,
}

impl RecordingNotifier {
    pub fn for_user(&self, user_id: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, n)| n.clone())
            .collect()
    }
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

#[derive(Default)]
pub struct MemoryStorage {
    pub objects: Mutex<HashMap<String, (ObjectMetadata, Vec<u8>)>>,
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, bytes: Vec<u8>, metadata: ObjectMetadata) -> ExternalResult<StoredObject> {
        let id = format!("obj-{}", metadata.batch_id);
        let url = format!("mem://{}", id);
        self.objects
            .lock()
            .unwrap()
            .insert(id.clone(), (metadata, bytes));
        Ok(StoredObject { id, url })
    }
}

/// One point per minute covering `distance` over `minutes`, engine running
pub fn drive(device_id: &str, start_odometer: u64, distance: u64, start_ts: u64, minutes: u64) -> Vec<TelemetryPoint> {
    (0..=minutes)
        .map(|i| {
            TelemetryPoint::new(
                device_id,
                start_odometer + distance * i / minutes.max(1),
                60.0,
                2000,
                start_ts + i * MINUTE_MS,
            )
        })
        .collect()
}

/// `count` stationary points with the engine off, one per minute after `after_ts`
pub fn idle(device_id: &str, odometer: u64, after_ts: u64, count: u64) -> Vec<TelemetryPoint> {
    (1..=count)
        .map(|i| TelemetryPoint::new(device_id, odometer, 0.0, 0, after_ts + i * MINUTE_MS))
        .collect()
}
