//! Device-sharded worker pool
//!
//! Each worker owns a bounded queue. A device always maps to the same worker
//! (`hash(device_id) % N`), so its points are ingested in submission order
//! while different devices proceed in parallel.

use crate::error::{PipelineError, Result};
use crate::processor::{BatchOutcome, BatchProcessor};
use odotrust_core::{Classify, TelemetryPoint};
use odotrust_telemetry::{Batch, TripSegmenter};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub enum WorkItem {
    /// Raw telemetry for the segmenter
    Point(TelemetryPoint),
    /// A batch closed outside the worker (idle sweep, shutdown flush)
    Closed(Batch),
}

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<WorkItem>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        workers: usize,
        queue_capacity: usize,
        segmenter: Arc<TripSegmenter>,
        processor: Arc<BatchProcessor>,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_capacity.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                rx,
                segmenter.clone(),
                processor.clone(),
            )));
        }

        info!(workers, queue_capacity, "Worker pool started");
        Self { senders, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Worker index owning `device_id`
    pub fn route(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a point; waits while the owning worker's queue is full
    pub async fn submit(&self, point: TelemetryPoint) -> Result<()> {
        let worker = self.route(&point.device_id);
        self.senders[worker]
            .send(WorkItem::Point(point))
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Hand a batch closed elsewhere to the worker owning its device
    pub async fn dispatch_closed(&self, batch: Batch) -> Result<()> {
        let worker = self.route(&batch.device_id);
        self.senders[worker]
            .send(WorkItem::Closed(batch))
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Close the queues and wait until every queued item has been handled
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkItem>,
    segmenter: Arc<TripSegmenter>,
    processor: Arc<BatchProcessor>,
) {
    debug!(worker_id, "Worker started");
    while let Some(item) = rx.recv().await {
        match item {
            WorkItem::Point(point) => {
                let device_id = point.device_id.clone();
                match segmenter.ingest(point) {
                    Ok(batch_ref) => {
                        for closed in batch_ref.closed {
                            process_logged(worker_id, &processor, closed).await;
                        }
                    }
                    Err(e) => warn!(worker_id, device_id = %device_id, kind = ?e.kind(), error = %e, "Point rejected"),
                }
            }
            WorkItem::Closed(batch) => process_logged(worker_id, &processor, batch).await,
        }
    }
    debug!(worker_id, "Worker drained");
}

async fn process_logged(worker_id: usize, processor: &BatchProcessor, batch: Batch) {
    let batch_id = batch.id.clone();
    match processor.process(batch).await {
        Ok(BatchOutcome::Anchored { .. }) => debug!(worker_id, batch_id = %batch_id, "Batch done"),
        Ok(outcome) => debug!(worker_id, batch_id = %batch_id, ?outcome, "Batch not anchored"),
        Err(e) => error!(
            worker_id,
            batch_id = %batch_id,
            kind = ?e.kind(),
            retryable = e.is_retryable(),
            error = %e,
            "Batch processing failed"
        ),
    }
}
