//! Property tests for trip segmentation
//!
//! Verifies for arbitrary point streams:
//! - Segments are time-ordered and never overlap
//! - Segment distance never exceeds the sum of forward odometer steps
//! - Rebuilding from the same points yields the same segments

use odotrust_core::TelemetryPoint;
use odotrust_telemetry::{Batch, CloseReason, SegmentBuilder};
use proptest::prelude::*;

const T0: u64 = 1_700_000_000_000;

fn closed_batch(steps: &[(u64, i64)]) -> Batch {
    let mut at = T0;
    let mut odometer: i64 = 50_000;
    let mut points = Vec::with_capacity(steps.len() + 1);
    points.push(TelemetryPoint::new("dev-prop", odometer as u64, 30.0, 1500, at));
    for (dt, dodo) in steps {
        at += dt;
        odometer = (odometer + dodo).max(0);
        points.push(TelemetryPoint::new("dev-prop", odometer as u64, 30.0, 1500, at));
    }

    let mut iter = points.into_iter();
    let mut batch = Batch::open("veh-prop", iter.next().unwrap());
    for point in iter {
        batch.push(point);
    }
    batch.close(CloseReason::Manual);
    batch
}

proptest! {
    #[test]
    fn prop_segments_ordered_and_bounded(
        steps in proptest::collection::vec((1u64..3_600_000, -50i64..200), 0..80)
    ) {
        let batch = closed_batch(&steps);
        let segments = SegmentBuilder::default().build(&batch).unwrap();

        prop_assert!(!segments.is_empty());
        for pair in segments.windows(2) {
            prop_assert!(pair[0].end_time < pair[1].start_time);
        }
        for segment in &segments {
            prop_assert!(segment.start_time <= segment.end_time);
        }

        let forward_steps: u64 = batch
            .points
            .windows(2)
            .map(|w| w[1].odometer.saturating_sub(w[0].odometer))
            .sum();
        let total: u64 = segments.iter().map(|s| s.distance).sum();
        prop_assert!(total <= forward_steps);
    }

    #[test]
    fn prop_rebuild_is_stable(
        steps in proptest::collection::vec((1u64..600_000, 0i64..100), 1..40)
    ) {
        let batch = closed_batch(&steps);
        let builder = SegmentBuilder::default();
        prop_assert_eq!(builder.build(&batch).unwrap(), builder.build(&batch).unwrap());
    }
}
