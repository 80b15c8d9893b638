//! odotrust Telemetry
//!
//! Turns raw odometer telemetry into closed trips and time-bounded segments.
//!
//! This crate provides:
//! - The trip [`Batch`] model and its lifecycle states
//! - [`TripSegmenter`]: per-device grouping of points into trips
//! - [`SegmentBuilder`]: conversion of a closed trip into distance segments
//! - [`VehicleDirectory`]: device to vehicle resolution

#![warn(missing_docs)]

pub mod batch;
pub mod directory;
pub mod error;
pub mod segmenter;
pub mod segments;

pub use batch::{Batch, BatchBounds, BatchStatus, CloseReason};
pub use directory::{StaticDirectory, VehicleDirectory, VehicleRecord};
pub use error::{TelemetryError, TelemetryResult};
pub use segmenter::{BatchRef, SegmenterMetrics, TripSegmenter};
pub use segments::SegmentBuilder;
