//! Durable record of closed batches and per-vehicle accepted mileage
//!
//! Open batches live in the segmenter; a batch is written here once it
//! closes and then follows `closed -> consolidating -> anchored | failed`.
//! A failed batch carries why it failed: `fraud` is permanent, `ledger` and
//! `submission` are eligible for the background sweep until their attempts
//! run out. `trust_applied` marks the batch whose score change is already in
//! the trust ledger, so a resumed batch never scores twice.

use crate::error::{PipelineError, Result};
use odotrust_core::sqlite::ConnectionPool;
use odotrust_core::{current_timestamp_ms, Segment, StorageConfig};
use odotrust_market::{MarketError, MarketResult, ProvenanceSource, VehicleProvenance};
use odotrust_telemetry::{Batch, BatchStatus};
use odotrust_trust::ContinuityVerdict;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_millis(1_000);

const BATCH_COLUMNS: &str = "id, device_id, vehicle_id, status, failure_kind, start_odometer, \
     end_odometer, opened_at, closed_at, close_reason, point_count, commitment_root, segments, \
     verdict, submission_attempts, last_error, anchor_reference, anchor_confirmed, \
     storage_object_id, updated_at, ledger_attempts, trust_applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Continuity validation rejected the batch
    Fraud,
    /// Trust ledger write failed before the score changed; resumed by the sweeper
    Ledger,
    /// Anchor submission failed; retried by the sweeper
    Submission,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Fraud => "fraud",
            FailureKind::Ledger => "ledger",
            FailureKind::Submission => "submission",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fraud" => Some(FailureKind::Fraud),
            "ledger" => Some(FailureKind::Ledger),
            "submission" => Some(FailureKind::Submission),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBatch {
    pub id: String,
    pub device_id: String,
    pub vehicle_id: String,
    pub status: BatchStatus,
    pub failure: Option<FailureKind>,
    pub start_odometer: u64,
    pub end_odometer: u64,
    pub opened_at: u64,
    pub closed_at: u64,
    pub close_reason: Option<String>,
    pub point_count: u64,
    /// Hex Merkle root, set when consolidated
    pub commitment_root: Option<String>,
    pub segments: Vec<Segment>,
    pub verdict: Option<ContinuityVerdict>,
    pub submission_attempts: u32,
    pub last_error: Option<String>,
    pub anchor_reference: Option<String>,
    pub anchor_confirmed: bool,
    pub storage_object_id: Option<String>,
    pub updated_at: u64,
    pub ledger_attempts: u32,
    pub trust_applied: bool,
}

impl StoredBatch {
    pub fn distance(&self) -> u64 {
        self.segments.iter().map(|s| s.distance).sum()
    }
}

pub struct BatchStore {
    pool: ConnectionPool,
}

impl BatchStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening batch store");
        let pool = ConnectionPool::open(path, POOL_SIZE, BUSY_TIMEOUT, Self::init_schema)?;
        Ok(Self { pool })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::open(&config.batch_db_path)
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                vehicle_id TEXT NOT NULL,
                status TEXT NOT NULL,
                failure_kind TEXT,
                start_odometer INTEGER NOT NULL,
                end_odometer INTEGER NOT NULL,
                opened_at INTEGER NOT NULL,
                closed_at INTEGER NOT NULL,
                close_reason TEXT,
                point_count INTEGER NOT NULL,
                commitment_root TEXT,
                segments TEXT NOT NULL DEFAULT '[]',
                verdict TEXT,
                submission_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                anchor_reference TEXT,
                anchor_confirmed INTEGER NOT NULL DEFAULT 0,
                storage_object_id TEXT,
                updated_at INTEGER NOT NULL,
                ledger_attempts INTEGER NOT NULL DEFAULT 0,
                trust_applied INTEGER NOT NULL DEFAULT 0
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_batches_open_device
                ON batches(device_id) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_batches_vehicle ON batches(vehicle_id, closed_at);
            CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status, failure_kind, updated_at);

            CREATE TABLE IF NOT EXISTS vehicle_odometer (
                vehicle_id TEXT PRIMARY KEY,
                odometer INTEGER NOT NULL,
                batch_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
    }

    /// Persist a batch handed over by the segmenter. Re-recording is a no-op.
    pub fn record_closed(&self, batch: &Batch) -> Result<()> {
        let conn = self.pool.get()?;
        let closed_at = batch.closed_at.unwrap_or_else(|| batch.last_point_at());
        conn.execute(
            r#"
            INSERT INTO batches (
                id, device_id, vehicle_id, status, start_odometer, end_odometer,
                opened_at, closed_at, close_reason, point_count, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                batch.id,
                batch.device_id,
                batch.vehicle_id,
                BatchStatus::Closed.as_str(),
                batch.start_odometer as i64,
                batch.end_odometer as i64,
                batch.opened_at as i64,
                closed_at as i64,
                batch.close_reason.map(|r| r.as_str()),
                batch.points.len() as i64,
                current_timestamp_ms() as i64,
            ],
        )?;
        debug!(batch_id = %batch.id, device_id = %batch.device_id, "Batch recorded");
        Ok(())
    }

    pub fn mark_consolidating(&self, batch_id: &str, commitment_root: &str, segments: &[Segment]) -> Result<()> {
        let segments = serde_json::to_string(segments)?;
        self.update(
            batch_id,
            "UPDATE batches SET status = ?2, commitment_root = ?3, segments = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                batch_id,
                BatchStatus::Consolidating.as_str(),
                commitment_root,
                segments,
                current_timestamp_ms() as i64
            ],
        )
    }

    pub fn record_verdict(&self, batch_id: &str, verdict: &ContinuityVerdict) -> Result<()> {
        let verdict = serde_json::to_string(verdict)?;
        self.update(
            batch_id,
            "UPDATE batches SET verdict = ?2, updated_at = ?3 WHERE id = ?1",
            params![batch_id, verdict, current_timestamp_ms() as i64],
        )
    }

    /// Permanent failure: continuity rejected the batch
    pub fn mark_fraud(&self, batch_id: &str, summary: &str) -> Result<()> {
        self.update(
            batch_id,
            "UPDATE batches SET status = ?2, failure_kind = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                batch_id,
                BatchStatus::Failed.as_str(),
                FailureKind::Fraud.as_str(),
                summary,
                current_timestamp_ms() as i64
            ],
        )
    }

    pub fn mark_anchored(&self, batch_id: &str, reference: &str, confirmed: bool) -> Result<()> {
        self.update(
            batch_id,
            r#"
            UPDATE batches
            SET status = ?2, failure_kind = NULL, last_error = NULL,
                anchor_reference = ?3, anchor_confirmed = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                batch_id,
                BatchStatus::Anchored.as_str(),
                reference,
                confirmed,
                current_timestamp_ms() as i64
            ],
        )
    }

    /// Park a batch whose trust update failed; returns the attempt count
    pub fn mark_ledger_failed(&self, batch_id: &str, error: &str) -> Result<u32> {
        self.update(
            batch_id,
            r#"
            UPDATE batches
            SET status = ?2, failure_kind = ?3, last_error = ?4,
                ledger_attempts = ledger_attempts + 1, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                batch_id,
                BatchStatus::Failed.as_str(),
                FailureKind::Ledger.as_str(),
                error,
                current_timestamp_ms() as i64
            ],
        )?;
        let conn = self.pool.get()?;
        let attempts: i64 = conn.query_row(
            "SELECT ledger_attempts FROM batches WHERE id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(attempts as u32)
    }

    /// Mark the trust change of a batch as written and, for an accepted
    /// batch, advance the vehicle's odometer in the same transaction
    pub fn settle_trust(
        &self,
        batch_id: &str,
        vehicle_id: &str,
        accepted_odometer: Option<u64>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            r#"
            UPDATE batches
            SET status = CASE WHEN status = 'failed' THEN ?2 ELSE status END,
                failure_kind = CASE WHEN failure_kind = 'ledger' THEN NULL ELSE failure_kind END,
                trust_applied = 1, updated_at = ?3
            WHERE id = ?1
            "#,
            params![
                batch_id,
                BatchStatus::Consolidating.as_str(),
                current_timestamp_ms() as i64
            ],
        )?;
        if updated == 0 {
            return Err(PipelineError::BatchNotFound(batch_id.to_string()));
        }
        if let Some(odometer) = accepted_odometer {
            Self::upsert_odometer(&tx, vehicle_id, odometer, batch_id)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failed submission attempt; returns the attempt count
    pub fn mark_submission_failed(&self, batch_id: &str, error: &str) -> Result<u32> {
        self.update(
            batch_id,
            r#"
            UPDATE batches
            SET status = ?2, failure_kind = ?3, last_error = ?4,
                submission_attempts = submission_attempts + 1, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                batch_id,
                BatchStatus::Failed.as_str(),
                FailureKind::Submission.as_str(),
                error,
                current_timestamp_ms() as i64
            ],
        )?;
        let conn = self.pool.get()?;
        let attempts: i64 = conn.query_row(
            "SELECT submission_attempts FROM batches WHERE id = ?1",
            params![batch_id],
            |row| row.get(0),
        )?;
        Ok(attempts as u32)
    }

    pub fn mark_confirmed(&self, batch_id: &str) -> Result<()> {
        self.update(
            batch_id,
            "UPDATE batches SET anchor_confirmed = 1, updated_at = ?2 WHERE id = ?1",
            params![batch_id, current_timestamp_ms() as i64],
        )
    }

    pub fn set_storage_object(&self, batch_id: &str, object_id: &str) -> Result<()> {
        self.update(
            batch_id,
            "UPDATE batches SET storage_object_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![batch_id, object_id, current_timestamp_ms() as i64],
        )
    }

    fn update(&self, batch_id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let conn = self.pool.get()?;
        if conn.execute(sql, params)? == 0 {
            return Err(PipelineError::BatchNotFound(batch_id.to_string()));
        }
        Ok(())
    }

    /// Advance the accepted odometer of a vehicle. A lower reading never
    /// replaces a higher one.
    pub fn accept_odometer(&self, vehicle_id: &str, odometer: u64, batch_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        Self::upsert_odometer(&conn, vehicle_id, odometer, batch_id)?;
        Ok(())
    }

    fn upsert_odometer(
        conn: &Connection,
        vehicle_id: &str,
        odometer: u64,
        batch_id: &str,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            r#"
            INSERT INTO vehicle_odometer (vehicle_id, odometer, batch_id, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(vehicle_id) DO UPDATE SET
                odometer = excluded.odometer,
                batch_id = excluded.batch_id,
                updated_at = excluded.updated_at
            WHERE excluded.odometer >= vehicle_odometer.odometer
            "#,
            params![vehicle_id, odometer as i64, batch_id, current_timestamp_ms() as i64],
        )
    }

    pub fn last_accepted_odometer(&self, vehicle_id: &str) -> Result<Option<u64>> {
        let conn = self.pool.get()?;
        let odometer = conn
            .query_row(
                "SELECT odometer FROM vehicle_odometer WHERE vehicle_id = ?1",
                params![vehicle_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(odometer.map(|o| o as u64))
    }

    pub fn get(&self, batch_id: &str) -> Result<Option<StoredBatch>> {
        let conn = self.pool.get()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM batches WHERE id = ?1", BATCH_COLUMNS),
                params![batch_id],
                RawBatch::read,
            )
            .optional()?;
        raw.map(RawBatch::decode).transpose()
    }

    /// Batches whose submission failed and may be retried, oldest first
    pub fn pending_submissions(&self, max_attempts: u32, limit: usize) -> Result<Vec<StoredBatch>> {
        self.query_batches(
            &format!(
                r#"
                SELECT {} FROM batches
                WHERE status = 'failed' AND failure_kind = 'submission' AND submission_attempts < ?1
                ORDER BY updated_at ASC LIMIT ?2
                "#,
                BATCH_COLUMNS
            ),
            params![max_attempts, limit as i64],
        )
    }

    /// Batches parked by a failed trust update, oldest first
    pub fn pending_ledger(&self, max_attempts: u32, limit: usize) -> Result<Vec<StoredBatch>> {
        self.query_batches(
            &format!(
                r#"
                SELECT {} FROM batches
                WHERE status = 'failed' AND failure_kind = 'ledger' AND ledger_attempts < ?1
                ORDER BY updated_at ASC LIMIT ?2
                "#,
                BATCH_COLUMNS
            ),
            params![max_attempts, limit as i64],
        )
    }

    /// Anchored batches still waiting for confirmation
    pub fn unconfirmed_anchors(&self, limit: usize) -> Result<Vec<StoredBatch>> {
        self.query_batches(
            &format!(
                r#"
                SELECT {} FROM batches
                WHERE status = 'anchored' AND anchor_confirmed = 0
                ORDER BY updated_at ASC LIMIT ?1
                "#,
                BATCH_COLUMNS
            ),
            params![limit as i64],
        )
    }

    pub fn batches_for_vehicle(&self, vehicle_id: &str) -> Result<Vec<StoredBatch>> {
        self.query_batches(
            &format!(
                "SELECT {} FROM batches WHERE vehicle_id = ?1 ORDER BY closed_at ASC",
                BATCH_COLUMNS
            ),
            params![vehicle_id],
        )
    }

    fn query_batches(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<StoredBatch>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawBatch::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawBatch::decode).collect()
    }

    /// Flattened provenance of a vehicle, `None` if it has no batches
    pub fn vehicle_provenance(&self, vehicle_id: &str) -> Result<Option<VehicleProvenance>> {
        let batches = self.batches_for_vehicle(vehicle_id)?;
        if batches.is_empty() {
            return Ok(None);
        }

        let latest_verdict = batches.iter().rev().find_map(|b| b.verdict.as_ref());
        let latest_anchor = batches
            .iter()
            .rev()
            .find(|b| b.status == BatchStatus::Anchored);

        Ok(Some(VehicleProvenance {
            vehicle_id: vehicle_id.to_string(),
            last_accepted_odometer: self.last_accepted_odometer(vehicle_id)?,
            latest_verdict_valid: latest_verdict.map(|v| v.is_valid),
            latest_verdict_at: latest_verdict.map(|v| v.checked_at),
            latest_anchor_reference: latest_anchor.and_then(|b| b.anchor_reference.clone()),
            anchor_confirmed: latest_anchor.map_or(false, |b| b.anchor_confirmed),
            storage_object_id: batches
                .iter()
                .rev()
                .find_map(|b| b.storage_object_id.clone()),
        }))
    }
}

impl ProvenanceSource for BatchStore {
    fn provenance(&self, vehicle_id: &str) -> MarketResult<Option<VehicleProvenance>> {
        self.vehicle_provenance(vehicle_id)
            .map_err(|e| MarketError::SourceUnavailable(e.to_string()))
    }
}

struct RawBatch {
    id: String,
    device_id: String,
    vehicle_id: String,
    status: String,
    failure_kind: Option<String>,
    start_odometer: i64,
    end_odometer: i64,
    opened_at: i64,
    closed_at: i64,
    close_reason: Option<String>,
    point_count: i64,
    commitment_root: Option<String>,
    segments: String,
    verdict: Option<String>,
    submission_attempts: i64,
    last_error: Option<String>,
    anchor_reference: Option<String>,
    anchor_confirmed: bool,
    storage_object_id: Option<String>,
    updated_at: i64,
    ledger_attempts: i64,
    trust_applied: bool,
}

impl RawBatch {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            vehicle_id: row.get(2)?,
            status: row.get(3)?,
            failure_kind: row.get(4)?,
            start_odometer: row.get(5)?,
            end_odometer: row.get(6)?,
            opened_at: row.get(7)?,
            closed_at: row.get(8)?,
            close_reason: row.get(9)?,
            point_count: row.get(10)?,
            commitment_root: row.get(11)?,
            segments: row.get(12)?,
            verdict: row.get(13)?,
            submission_attempts: row.get(14)?,
            last_error: row.get(15)?,
            anchor_reference: row.get(16)?,
            anchor_confirmed: row.get(17)?,
            storage_object_id: row.get(18)?,
            updated_at: row.get(19)?,
            ledger_attempts: row.get(20)?,
            trust_applied: row.get(21)?,
        })
    }

    fn decode(self) -> Result<StoredBatch> {
        let corrupt = |detail: String| PipelineError::CorruptBatch {
            batch_id: self.id.clone(),
            detail,
        };

        let status = BatchStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("status '{}'", self.status)))?;
        let failure = match self.failure_kind.as_deref() {
            None => None,
            Some(kind) => Some(
                FailureKind::parse(kind).ok_or_else(|| corrupt(format!("failure kind '{}'", kind)))?,
            ),
        };
        let segments: Vec<Segment> = serde_json::from_str(&self.segments)
            .map_err(|e| corrupt(format!("segments: {}", e)))?;
        let verdict = self
            .verdict
            .as_deref()
            .map(|raw| serde_json::from_str::<ContinuityVerdict>(raw))
            .transpose()
            .map_err(|e| corrupt(format!("verdict: {}", e)))?;

        Ok(StoredBatch {
            id: self.id,
            device_id: self.device_id,
            vehicle_id: self.vehicle_id,
            status,
            failure,
            start_odometer: self.start_odometer as u64,
            end_odometer: self.end_odometer as u64,
            opened_at: self.opened_at as u64,
            closed_at: self.closed_at as u64,
            close_reason: self.close_reason,
            point_count: self.point_count as u64,
            commitment_root: self.commitment_root,
            segments,
            verdict,
            submission_attempts: self.submission_attempts as u32,
            last_error: self.last_error,
            anchor_reference: self.anchor_reference,
            anchor_confirmed: self.anchor_confirmed,
            storage_object_id: self.storage_object_id,
            updated_at: self.updated_at as u64,
            ledger_attempts: self.ledger_attempts as u32,
            trust_applied: self.trust_applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odotrust_core::TelemetryPoint;
    use odotrust_telemetry::CloseReason;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("test_batches_{}.db", uuid::Uuid::new_v4()))
    }

    fn closed_batch(vehicle: &str, start: u64, end: u64) -> Batch {
        let mut batch = Batch::open(vehicle, TelemetryPoint::new("dev-1", start, 30.0, 1500, 1_000));
        batch.push(TelemetryPoint::new("dev-1", end, 0.0, 0, 2_000));
        batch.close(CloseReason::Manual);
        batch
    }

    #[test]
    fn test_lifecycle_to_anchored() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        let batch = closed_batch("veh-1", 1000, 1050);

        store.record_closed(&batch).unwrap();
        store.record_closed(&batch).unwrap();
        let segments = vec![Segment {
            start_time: 1_000,
            end_time: 2_000,
            distance: 50,
        }];
        store.mark_consolidating(&batch.id, "ab", &segments).unwrap();
        store.mark_anchored(&batch.id, "ref-1", false).unwrap();

        let stored = store.get(&batch.id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Anchored);
        assert_eq!(stored.segments, segments);
        assert_eq!(stored.distance(), 50);
        assert_eq!(stored.close_reason.as_deref(), Some("manual"));
        assert_eq!(store.unconfirmed_anchors(10).unwrap().len(), 1);

        store.mark_confirmed(&batch.id).unwrap();
        assert!(store.unconfirmed_anchors(10).unwrap().is_empty());

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_submission_failures_are_bounded() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        let batch = closed_batch("veh-1", 1000, 1050);
        store.record_closed(&batch).unwrap();

        assert_eq!(store.mark_submission_failed(&batch.id, "timeout").unwrap(), 1);
        assert_eq!(store.pending_submissions(2, 10).unwrap().len(), 1);
        assert_eq!(store.mark_submission_failed(&batch.id, "timeout").unwrap(), 2);
        assert!(store.pending_submissions(2, 10).unwrap().is_empty());

        let stored = store.get(&batch.id).unwrap().unwrap();
        assert_eq!(stored.failure, Some(FailureKind::Submission));
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_fraud_batches_never_resubmitted() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        let batch = closed_batch("veh-1", 67_000, 82);
        store.record_closed(&batch).unwrap();
        store.mark_fraud(&batch.id, "rollback detected").unwrap();

        assert!(store.pending_submissions(5, 10).unwrap().is_empty());
        assert_eq!(
            store.get(&batch.id).unwrap().unwrap().failure,
            Some(FailureKind::Fraud)
        );

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_provenance_flattens_latest_state() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        assert!(store.vehicle_provenance("veh-1").unwrap().is_none());

        let batch = closed_batch("veh-1", 1000, 1050);
        store.record_closed(&batch).unwrap();
        store.mark_anchored(&batch.id, "ref-9", true).unwrap();
        store.set_storage_object(&batch.id, "obj-9").unwrap();
        store.accept_odometer("veh-1", 1050, &batch.id).unwrap();

        let provenance = store.vehicle_provenance("veh-1").unwrap().unwrap();
        assert_eq!(provenance.last_accepted_odometer, Some(1050));
        assert_eq!(provenance.latest_anchor_reference.as_deref(), Some("ref-9"));
        assert!(provenance.anchor_confirmed);
        assert_eq!(provenance.storage_object_id.as_deref(), Some("obj-9"));
        assert_eq!(provenance.latest_verdict_valid, None);

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_ledger_failure_parks_until_trust_settles() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        let batch = closed_batch("veh-1", 1000, 1050);
        store.record_closed(&batch).unwrap();

        assert_eq!(store.mark_ledger_failed(&batch.id, "score cache inconsistent").unwrap(), 1);
        let parked = store.pending_ledger(3, 10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].failure, Some(FailureKind::Ledger));
        assert!(!parked[0].trust_applied);
        assert!(store.pending_submissions(3, 10).unwrap().is_empty());
        assert_eq!(store.last_accepted_odometer("veh-1").unwrap(), None);

        store.settle_trust(&batch.id, "veh-1", Some(1050)).unwrap();
        let stored = store.get(&batch.id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Consolidating);
        assert_eq!(stored.failure, None);
        assert!(stored.trust_applied);
        assert_eq!(stored.ledger_attempts, 1);
        assert!(store.pending_ledger(3, 10).unwrap().is_empty());
        assert_eq!(store.last_accepted_odometer("veh-1").unwrap(), Some(1050));

        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_accepted_odometer_never_moves_back() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        store.accept_odometer("veh-1", 5_000, "b1").unwrap();
        store.accept_odometer("veh-1", 4_000, "b0").unwrap();
        assert_eq!(store.last_accepted_odometer("veh-1").unwrap(), Some(5_000));
        store.accept_odometer("veh-1", 5_200, "b2").unwrap();
        assert_eq!(store.last_accepted_odometer("veh-1").unwrap(), Some(5_200));
        std::fs::remove_file(db_path).ok();
    }

    #[test]
    fn test_unknown_batch_update_fails() {
        let db_path = temp_db();
        let store = BatchStore::open(&db_path).unwrap();
        assert!(matches!(
            store.mark_confirmed("missing"),
            Err(PipelineError::BatchNotFound(_))
        ));
        std::fs::remove_file(db_path).ok();
    }
}
