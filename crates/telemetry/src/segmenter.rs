//! Trip Segmenter
//!
//! Groups incoming telemetry points per device into open batches and closes
//! them on end-of-trip heuristics.
//!
//! # Invariants
//!
//! - At most one open batch per device. The `device_id -> open batch` index
//!   is updated under its own lock whenever a batch is opened or closed.
//! - The index lock is never held while a batch lock is being acquired, so
//!   appends for different devices only contend on the short index lookup.
//! - Points within a batch have non-decreasing timestamps.
//!
//! # End-of-trip conditions (priority order)
//!
//! 1. The trailing `engine_off_points` points report rpm 0 and speed 0
//! 2. No data within the idle timeout. Checked on arrival of the next point
//!    against the point timestamps, and by [`TripSegmenter::close_silent`]
//!    against the time the device's last point was received
//! 3. The point carries the explicit end-of-trip flag

use crate::batch::{Batch, BatchStatus, CloseReason};
use crate::directory::VehicleDirectory;
use crate::error::{TelemetryError, TelemetryResult};
use odotrust_core::{current_timestamp_ms, SegmenterConfig, TelemetryPoint};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

type SharedBatch = Arc<Mutex<Batch>>;

/// Receiving-side activity of a device since its last close
#[derive(Debug, Clone, Copy)]
struct Activity {
    points: u64,
    last_received_at: u64,
}

/// Result of ingesting one point
#[derive(Debug, Clone)]
pub struct BatchRef {
    /// Batch the point was appended to
    pub batch_id: String,
    /// Status of that batch after the append
    pub status: BatchStatus,
    /// Batches closed while handling this point, in close order
    pub closed: Vec<Batch>,
}

/// Counters exported for monitoring
#[derive(Debug, Default)]
pub struct SegmenterMetrics {
    /// Points accepted
    pub points_ingested_total: AtomicU64,
    /// Points rejected by validation
    pub points_rejected_total: AtomicU64,
    /// Batches opened
    pub batches_opened_total: AtomicU64,
    /// Batches closed
    pub batches_closed_total: AtomicU64,
}

/// Per-device trip grouping
pub struct TripSegmenter {
    config: SegmenterConfig,
    directory: Arc<dyn VehicleDirectory>,
    /// device_id -> currently open batch
    open_index: Mutex<HashMap<String, SharedBatch>>,
    /// device_id -> points received since the last close
    activity: Mutex<HashMap<String, Activity>>,
    metrics: SegmenterMetrics,
}

impl TripSegmenter {
    /// Create a segmenter resolving vehicles through `directory`
    pub fn new(config: SegmenterConfig, directory: Arc<dyn VehicleDirectory>) -> Self {
        Self {
            config,
            directory,
            open_index: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
            metrics: SegmenterMetrics::default(),
        }
    }

    /// Append `point` to its device's open batch, opening one if needed.
    pub fn ingest(&self, point: TelemetryPoint) -> TelemetryResult<BatchRef> {
        if let Err(err) = validate_point(&point) {
            self.metrics.points_rejected_total.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let mut closed = Vec::new();

        loop {
            let existing = self.index().get(&point.device_id).cloned();

            let shared = match existing {
                Some(shared) => shared,
                None => match self.open_batch(&point)? {
                    Some(opened) => {
                        self.bump_pending(&point.device_id);
                        self.metrics.points_ingested_total.fetch_add(1, Ordering::Relaxed);
                        let mut batch = lock(&opened);
                        let status = self.evaluate_end_of_trip(&mut batch, &opened, &mut closed);
                        return Ok(BatchRef {
                            batch_id: batch.id.clone(),
                            status,
                            closed,
                        });
                    }
                    // Another caller opened a batch for this device first
                    None => continue,
                },
            };

            let mut batch = lock(&shared);
            if batch.status != BatchStatus::Open {
                // Closed between the index lookup and the batch lock
                continue;
            }

            let last = batch.last_point_at();
            if point.timestamp < last {
                self.metrics.points_rejected_total.fetch_add(1, Ordering::Relaxed);
                return Err(TelemetryError::OutOfOrderPoint {
                    device_id: point.device_id.clone(),
                    last_timestamp: last,
                    timestamp: point.timestamp,
                });
            }

            if point.timestamp - last > self.config.idle_timeout_ms {
                if let Some(done) = self.close_locked(&mut batch, &shared, CloseReason::DataTimeout) {
                    closed.push(done);
                }
                drop(batch);
                continue;
            }

            batch.push(point.clone());
            self.bump_pending(&point.device_id);
            self.metrics.points_ingested_total.fetch_add(1, Ordering::Relaxed);

            let status = self.evaluate_end_of_trip(&mut batch, &shared, &mut closed);
            return Ok(BatchRef {
                batch_id: batch.id.clone(),
                status,
                closed,
            });
        }
    }

    /// Close every open batch whose last point timestamp is older than the
    /// idle timeout at `now_ms`, both on the data clock.
    pub fn close_idle(&self, now_ms: u64) -> Vec<Batch> {
        let candidates: Vec<SharedBatch> = self.index().values().cloned().collect();
        let mut closed = Vec::new();

        for shared in candidates {
            let mut batch = lock(&shared);
            if batch.status == BatchStatus::Open
                && now_ms.saturating_sub(batch.last_point_at()) > self.config.idle_timeout_ms
            {
                if let Some(done) = self.close_locked(&mut batch, &shared, CloseReason::DataTimeout) {
                    closed.push(done);
                }
            }
        }

        if !closed.is_empty() {
            info!(count = closed.len(), "Closed idle trips");
        }
        closed
    }

    /// Close every open batch whose device has sent nothing for the idle
    /// timeout, measured on the receiving clock. A replay of old telemetry
    /// keeps its trips open as long as points keep arriving.
    pub fn close_silent(&self, now_ms: u64) -> Vec<Batch> {
        let silent: Vec<String> = self
            .activities()
            .iter()
            .filter(|(_, activity)| {
                now_ms.saturating_sub(activity.last_received_at) > self.config.idle_timeout_ms
            })
            .map(|(device_id, _)| device_id.clone())
            .collect();

        let closed: Vec<Batch> = silent
            .iter()
            .filter_map(|device_id| self.close_device(device_id, CloseReason::DataTimeout))
            .collect();
        if !closed.is_empty() {
            info!(count = closed.len(), "Closed trips of silent devices");
        }
        closed
    }

    /// Close the open batch of `device_id`, if any. Idempotent.
    pub fn close_device(&self, device_id: &str, reason: CloseReason) -> Option<Batch> {
        let shared = self.index().get(device_id).cloned()?;
        let mut batch = lock(&shared);
        self.close_locked(&mut batch, &shared, reason)
    }

    /// Close every open batch, used at shutdown
    pub fn close_all(&self, reason: CloseReason) -> Vec<Batch> {
        let devices: Vec<String> = self.index().keys().cloned().collect();
        devices
            .iter()
            .filter_map(|device_id| self.close_device(device_id, reason))
            .collect()
    }

    /// Snapshot of the device's open batch
    pub fn open_batch_for(&self, device_id: &str) -> Option<Batch> {
        let shared = self.index().get(device_id).cloned()?;
        let batch = lock(&shared);
        (batch.status == BatchStatus::Open).then(|| batch.clone())
    }

    /// Points received for `device_id` since its last close
    pub fn pending_points(&self, device_id: &str) -> u64 {
        self.activities()
            .get(device_id)
            .map_or(0, |activity| activity.points)
    }

    /// Number of devices with an open batch
    pub fn open_batch_count(&self) -> usize {
        self.index().len()
    }

    /// Monitoring counters
    pub fn metrics(&self) -> &SegmenterMetrics {
        &self.metrics
    }

    fn open_batch(&self, point: &TelemetryPoint) -> TelemetryResult<Option<SharedBatch>> {
        let vehicle = self.directory.lookup_device(&point.device_id).ok_or_else(|| {
            self.metrics.points_rejected_total.fetch_add(1, Ordering::Relaxed);
            TelemetryError::UnknownDevice(point.device_id.clone())
        })?;

        let mut index = self.index();
        match index.entry(point.device_id.clone()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let batch = Batch::open(vehicle.vehicle_id, point.clone());
                debug!(
                    batch_id = %batch.id,
                    device_id = %batch.device_id,
                    vehicle_id = %batch.vehicle_id,
                    odometer = batch.start_odometer,
                    "Opened trip batch"
                );
                let shared = Arc::new(Mutex::new(batch));
                slot.insert(Arc::clone(&shared));
                self.metrics.batches_opened_total.fetch_add(1, Ordering::Relaxed);
                Ok(Some(shared))
            }
        }
    }

    fn evaluate_end_of_trip(
        &self,
        batch: &mut Batch,
        shared: &SharedBatch,
        closed: &mut Vec<Batch>,
    ) -> BatchStatus {
        let reason = if batch.ends_idle(self.config.engine_off_points) {
            Some(CloseReason::EngineOff)
        } else if batch.points.last().map_or(false, TelemetryPoint::signals_end_of_trip) {
            Some(CloseReason::EndOfTripSignal)
        } else {
            None
        };

        if let Some(reason) = reason {
            if let Some(done) = self.close_locked(batch, shared, reason) {
                closed.push(done);
            }
        }
        batch.status
    }

    /// Close a batch whose lock is held by the caller. Returns the closed
    /// snapshot, or `None` if it was already closed.
    fn close_locked(&self, batch: &mut Batch, shared: &SharedBatch, reason: CloseReason) -> Option<Batch> {
        if !batch.close(reason) {
            return None;
        }

        {
            let mut index = self.index();
            if index
                .get(&batch.device_id)
                .map_or(false, |current| Arc::ptr_eq(current, shared))
            {
                index.remove(&batch.device_id);
            }
        }
        self.activities().remove(&batch.device_id);
        self.metrics.batches_closed_total.fetch_add(1, Ordering::Relaxed);

        info!(
            batch_id = %batch.id,
            device_id = %batch.device_id,
            vehicle_id = %batch.vehicle_id,
            points = batch.points.len(),
            start_odometer = batch.start_odometer,
            end_odometer = batch.end_odometer,
            reason = %reason,
            "Trip closed"
        );

        Some(batch.clone())
    }

    fn bump_pending(&self, device_id: &str) {
        let now = current_timestamp_ms();
        let mut activities = self.activities();
        let activity = activities.entry(device_id.to_string()).or_insert(Activity {
            points: 0,
            last_received_at: now,
        });
        activity.points += 1;
        activity.last_received_at = now;
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, SharedBatch>> {
        self.open_index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn activities(&self) -> MutexGuard<'_, HashMap<String, Activity>> {
        self.activity.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock(shared: &SharedBatch) -> MutexGuard<'_, Batch> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn validate_point(point: &TelemetryPoint) -> TelemetryResult<()> {
    if point.device_id.trim().is_empty() {
        return Err(TelemetryError::InvalidPoint("device_id cannot be empty".to_string()));
    }
    if !point.speed.is_finite() || point.speed < 0.0 {
        return Err(TelemetryError::InvalidPoint(format!(
            "speed must be a non-negative number, got {}",
            point.speed
        )));
    }
    if point.timestamp == 0 {
        return Err(TelemetryError::InvalidPoint("timestamp cannot be zero".to_string()));
    }
    Ok(())
}
