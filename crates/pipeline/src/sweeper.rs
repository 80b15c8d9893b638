//! Background sweeps
//!
//! One task, four jobs per tick:
//! - ledger sweep: resume batches parked by a failed trust update
//! - submission sweep: retry batches whose anchor submission failed
//! - confirmation sweep: poll the anchor for unconfirmed references
//! - idle sweep: close trips whose device stopped sending, timed on the
//!   receiving clock so replayed history is not cut into pieces
//!
//! The loop stops when the shutdown signal flips to `true`.

use crate::error::Result;
use crate::processor::{blocking, BatchOutcome, BatchProcessor};
use crate::workers::WorkerPool;
use odotrust_core::{current_timestamp_ms, PipelineConfig};
use odotrust_telemetry::TripSegmenter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub batch_size: usize,
    pub inter_submission_delay: Duration,
    pub max_attempts: u32,
}

impl SweeperConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.sweep_interval_ms),
            batch_size: config.sweep_batch_size,
            inter_submission_delay: Duration::from_millis(config.inter_submission_delay_ms),
            max_attempts: config.max_submission_attempts,
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::from_pipeline(&PipelineConfig::default())
    }
}

/// What a single sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub resumed: usize,
    pub resubmitted: usize,
    pub anchored: usize,
    pub confirmed: usize,
    pub idle_closed: usize,
}

pub struct SubmissionSweeper {
    processor: Arc<BatchProcessor>,
    segmenter: Arc<TripSegmenter>,
    config: SweeperConfig,
}

impl SubmissionSweeper {
    pub fn new(
        processor: Arc<BatchProcessor>,
        segmenter: Arc<TripSegmenter>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            processor,
            segmenter,
            config,
        }
    }

    /// Resume batches whose trust update failed; returns (resumed, anchored)
    pub async fn sweep_ledger(&self) -> Result<(usize, usize)> {
        let parked = {
            let store = self.processor.store().clone();
            let max_attempts = self.config.max_attempts;
            let limit = self.config.batch_size;
            blocking(move || store.pending_ledger(max_attempts, limit)).await?
        };

        let mut anchored = 0;
        for stored in &parked {
            match self.processor.resume(stored).await {
                Ok(BatchOutcome::Anchored { .. }) => anchored += 1,
                Ok(BatchOutcome::Deferred { attempts, .. }) if attempts >= self.config.max_attempts => {
                    error!(batch_id = %stored.id, attempts, "Trust update abandoned")
                }
                Ok(_) => {}
                Err(e) => warn!(batch_id = %stored.id, error = %e, "Resume failed"),
            }
        }
        Ok((parked.len(), anchored))
    }

    /// Retry failed submissions, oldest first
    pub async fn sweep_submissions(&self) -> Result<(usize, usize)> {
        let pending = {
            let store = self.processor.store().clone();
            let max_attempts = self.config.max_attempts;
            let limit = self.config.batch_size;
            blocking(move || store.pending_submissions(max_attempts, limit)).await?
        };

        let mut anchored = 0;
        for (i, stored) in pending.iter().enumerate() {
            if i > 0 && !self.config.inter_submission_delay.is_zero() {
                tokio::time::sleep(self.config.inter_submission_delay).await;
            }
            match self.processor.resubmit(stored).await {
                Ok(BatchOutcome::Anchored { .. }) => anchored += 1,
                Ok(_) => {}
                Err(e) => warn!(batch_id = %stored.id, error = %e, "Resubmission failed"),
            }
        }
        Ok((pending.len(), anchored))
    }

    pub async fn sweep_confirmations(&self) -> Result<usize> {
        let unconfirmed = {
            let store = self.processor.store().clone();
            let limit = self.config.batch_size;
            blocking(move || store.unconfirmed_anchors(limit)).await?
        };

        let mut confirmed = 0;
        for stored in &unconfirmed {
            match self.processor.confirm(stored).await {
                Ok(true) => confirmed += 1,
                Ok(false) => debug!(batch_id = %stored.id, "Anchor not final yet"),
                Err(e) => warn!(batch_id = %stored.id, error = %e, "Confirmation check failed"),
            }
        }
        Ok(confirmed)
    }

    /// Close silent trips and hand them to their workers
    pub async fn sweep_idle(&self, workers: &WorkerPool) -> usize {
        let closed = self.segmenter.close_silent(current_timestamp_ms());
        let count = closed.len();
        for batch in closed {
            let batch_id = batch.id.clone();
            if let Err(e) = workers.dispatch_closed(batch).await {
                warn!(batch_id = %batch_id, error = %e, "Idle batch not dispatched");
            }
        }
        count
    }

    /// One pass of every sweep
    pub async fn sweep_once(&self, workers: &WorkerPool) -> SweepReport {
        let mut report = SweepReport {
            idle_closed: self.sweep_idle(workers).await,
            ..SweepReport::default()
        };

        match self.sweep_ledger().await {
            Ok((resumed, anchored)) => {
                report.resumed = resumed;
                report.anchored += anchored;
            }
            Err(e) => warn!(error = %e, "Ledger sweep failed"),
        }
        match self.sweep_submissions().await {
            Ok((resubmitted, anchored)) => {
                report.resubmitted = resubmitted;
                report.anchored += anchored;
            }
            Err(e) => warn!(error = %e, "Submission sweep failed"),
        }
        match self.sweep_confirmations().await {
            Ok(confirmed) => report.confirmed = confirmed,
            Err(e) => warn!(error = %e, "Confirmation sweep failed"),
        }

        if report != SweepReport::default() {
            info!(
                resumed = report.resumed,
                resubmitted = report.resubmitted,
                anchored = report.anchored,
                confirmed = report.confirmed,
                idle_closed = report.idle_closed,
                "Sweep finished"
            );
        }
        report
    }

    /// Run sweeps on an interval until `shutdown` becomes true
    pub fn start(self, workers: Arc<WorkerPool>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "Submission sweeper started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once(&workers).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Submission sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
