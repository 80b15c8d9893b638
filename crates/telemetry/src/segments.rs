//! Segment Builder
//!
//! Converts a closed batch into time-ordered distance segments. A segment
//! breaks when consecutive points are more than the configured gap apart, or
//! when a point falls in the last minute of a UTC calendar day. Distance
//! steps are clamped at zero: a decreasing odometer never produces negative
//! distance here, rollback is left to the continuity validator.

use crate::batch::{Batch, BatchStatus};
use crate::error::{TelemetryError, TelemetryResult};
use chrono::{TimeZone, Timelike, Utc};
use odotrust_core::{Segment, SegmenterConfig, TelemetryPoint};
use tracing::debug;

/// Builds segments from closed batches
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    gap_ms: u64,
}

struct RunningSegment {
    start_time: u64,
    end_time: u64,
    distance: u64,
    last_odometer: u64,
}

impl RunningSegment {
    fn start(point: &TelemetryPoint) -> Self {
        Self {
            start_time: point.timestamp,
            end_time: point.timestamp,
            distance: 0,
            last_odometer: point.odometer,
        }
    }

    fn extend(&mut self, point: &TelemetryPoint) {
        self.distance += point.odometer.saturating_sub(self.last_odometer);
        self.last_odometer = point.odometer;
        self.end_time = point.timestamp;
    }

    fn finish(self) -> Segment {
        Segment {
            start_time: self.start_time,
            end_time: self.end_time,
            distance: self.distance,
        }
    }
}

impl SegmentBuilder {
    /// Builder breaking segments on gaps longer than `gap_ms`
    pub fn new(gap_ms: u64) -> Self {
        Self { gap_ms }
    }

    /// Builder using the segmenter configuration
    pub fn from_config(config: &SegmenterConfig) -> Self {
        Self::new(config.segment_gap_ms)
    }

    /// Build the segments of a batch that is no longer open
    pub fn build(&self, batch: &Batch) -> TelemetryResult<Vec<Segment>> {
        if batch.status == BatchStatus::Open {
            return Err(TelemetryError::BatchNotClosed {
                batch_id: batch.id.clone(),
                status: batch.status.to_string(),
            });
        }
        if batch.points.is_empty() {
            return Err(TelemetryError::EmptyBatch(batch.id.clone()));
        }

        let segments = self.build_from_points(&batch.points);

        debug!(
            batch_id = %batch.id,
            segment_count = segments.len(),
            distance = segments.iter().map(|s| s.distance).sum::<u64>(),
            "Segments built"
        );

        Ok(segments)
    }

    /// Segment an arbitrary point sequence. Points are stably sorted by timestamp first.
    pub fn build_from_points(&self, points: &[TelemetryPoint]) -> Vec<Segment> {
        let mut ordered: Vec<&TelemetryPoint> = points.iter().collect();
        ordered.sort_by_key(|p| p.timestamp);

        let mut segments = Vec::new();
        let mut running: Option<RunningSegment> = None;

        for point in ordered {
            running = match running.take() {
                None => Some(RunningSegment::start(point)),
                Some(current) if point.timestamp - current.end_time > self.gap_ms => {
                    segments.push(current.finish());
                    Some(RunningSegment::start(point))
                }
                Some(mut current) => {
                    current.extend(point);
                    Some(current)
                }
            };

            if in_last_minute_of_day(point.timestamp) {
                // End of day: emit and let the next point start a fresh segment
                if let Some(current) = running.take() {
                    segments.push(current.finish());
                }
            }
        }

        if let Some(current) = running {
            segments.push(current.finish());
        }

        segments
    }
}

impl Default for SegmentBuilder {
    fn default() -> Self {
        Self::from_config(&SegmenterConfig::default())
    }
}

fn in_last_minute_of_day(timestamp_ms: u64) -> bool {
    i64::try_from(timestamp_ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map_or(false, |at| at.hour() == 23 && at.minute() == 59)
}
