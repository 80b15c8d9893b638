//! odotrust Pipeline
//!
//! Wires the telemetry, trust and anchoring stages together:
//!
//! ```text
//! points -> WorkerPool (hash(device) % N) -> TripSegmenter -> closed batch
//!        -> BatchProcessor: segments, commitment root, continuity, trust ledger
//!        -> AnchorClient (best effort) -> BatchStore
//! SubmissionSweeper: failed submissions, confirmations, idle trips
//! ```
//!
//! External services are reached through the traits in [`collaborators`].

pub mod batch_store;
pub mod collaborators;
pub mod error;
pub mod processor;
pub mod sweeper;
pub mod workers;

pub use batch_store::{BatchStore, FailureKind, StoredBatch};
pub use collaborators::{
    notify_quietly, AnchorClient, AnchorPayload, AnchorReceipt, ExternalError, ExternalResult,
    LogNotifier, Notification, Notifier, ObjectMetadata, ObjectStorage, StoredObject,
    WalletCredential,
};
pub use error::{PipelineError, Result};
pub use processor::{BatchOutcome, BatchProcessor, ProcessorMetrics, ProcessorSettings};
pub use sweeper::{SubmissionSweeper, SweepReport, SweeperConfig};
pub use workers::{WorkItem, WorkerPool};

use odotrust_core::{Config, TelemetryPoint};
use odotrust_telemetry::{CloseReason, SegmentBuilder, TripSegmenter, VehicleDirectory};
use odotrust_trust::{ContinuityValidator, LedgerHealth, TrustLedger};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Running pipeline: worker pool plus background sweeper
pub struct Pipeline {
    segmenter: Arc<TripSegmenter>,
    processor: Arc<BatchProcessor>,
    workers: Arc<WorkerPool>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: JoinHandle<()>,
}

impl Pipeline {
    /// Open the ledger and batch store named in `config` and build a processor
    pub fn build_processor(
        config: &Config,
        directory: Arc<dyn VehicleDirectory>,
        anchor: Arc<dyn AnchorClient>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<BatchProcessor> {
        let ledger = Arc::new(TrustLedger::open_with_config(
            &config.storage.trust_db_path,
            &config.trust,
        )?);
        if let LedgerHealth::Inconsistent { vehicle_ids } = ledger.startup_consistency_check()? {
            warn!(
                inconsistent = ?vehicle_ids,
                "Trust writes blocked for inconsistent vehicles until repaired"
            );
        }
        let store = Arc::new(BatchStore::from_config(&config.storage)?);

        Ok(BatchProcessor::new(
            SegmentBuilder::from_config(&config.segmenter),
            ContinuityValidator::new(config.continuity.clone()),
            ledger,
            store,
            directory,
            anchor,
            notifier,
            ProcessorSettings::from_config(config),
        ))
    }

    /// Spawn workers and the sweeper. Must be called inside a tokio runtime.
    pub fn start(config: &Config, segmenter: Arc<TripSegmenter>, processor: Arc<BatchProcessor>) -> Self {
        let workers = Arc::new(WorkerPool::spawn(
            config.pipeline.workers,
            config.pipeline.queue_capacity,
            segmenter.clone(),
            processor.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = SubmissionSweeper::new(
            processor.clone(),
            segmenter.clone(),
            SweeperConfig::from_pipeline(&config.pipeline),
        )
        .start(workers.clone(), shutdown_rx);

        Self {
            segmenter,
            processor,
            workers,
            shutdown_tx,
            sweeper,
        }
    }

    pub async fn submit(&self, point: TelemetryPoint) -> Result<()> {
        self.workers.submit(point).await
    }

    /// Close every open trip and queue it for processing.
    ///
    /// Points still waiting in a worker queue open a new trip afterwards.
    pub async fn flush(&self) -> Result<usize> {
        let closed = self.segmenter.close_all(CloseReason::Manual);
        let count = closed.len();
        for batch in closed {
            self.workers.dispatch_closed(batch).await?;
        }
        Ok(count)
    }

    pub fn segmenter(&self) -> &Arc<TripSegmenter> {
        &self.segmenter
    }

    pub fn processor(&self) -> &Arc<BatchProcessor> {
        &self.processor
    }

    /// Stop the sweeper, drain the workers, then close and process the trips still open
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.sweeper.await {
            warn!(error = %e, "Sweeper task panicked");
        }

        match Arc::try_unwrap(self.workers) {
            Ok(workers) => workers.shutdown().await,
            Err(_) => warn!("Worker pool still shared; queues left open"),
        }

        let remaining = self.segmenter.close_all(CloseReason::Manual);
        let flushed = remaining.len();
        for batch in remaining {
            let batch_id = batch.id.clone();
            if let Err(e) = self.processor.process(batch).await {
                warn!(batch_id = %batch_id, error = %e, "Flushed batch not processed");
            }
        }
        info!(flushed, "Pipeline stopped");
        Ok(())
    }
}
