//! Trust Score Ledger - append-only event log with a cached current score
//!
//! This module provides per-vehicle trust scoring with:
//! - SQLite backend in WAL mode, one pooled connection per unit of work
//! - Strict append-only `trust_events` (UPDATE and DELETE raise)
//! - A cached `vehicle_scores` row guarded by an optimistic version column
//! - Bounded retry on commit conflicts, immediate rejection of out-of-order events
//! - Startup consistency check between the cache and the folded history
//!
//! # Unit of work
//!
//! ```text
//! BEGIN (deferred)
//!   read score, version, latest event timestamp
//!   reject if event timestamp < latest
//!   new = clamp(previous + change, 0, 100)
//!   INSERT trust_events
//!   UPDATE vehicle_scores ... WHERE version = ?
//! COMMIT
//! ```
//!
//! Lock contention and version mismatches are conflicts; the whole unit is
//! re-run under the configured [`RetryPolicy`].

use crate::error::{LedgerError, Result};
use crate::score::{apply_change, fold_scores, TrustEvent, TrustSource, DEFAULT_SCORE};
use odotrust_core::sqlite::ConnectionPool;
use odotrust_core::{current_timestamp_ms, with_retry, Classify, RetryPolicy, TrustConfig};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of a successful score mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreChange {
    pub vehicle_id: String,
    pub event_id: String,
    pub seq_no: u64,
    pub previous_score: u8,
    pub new_score: u8,
    pub event_timestamp: u64,
}

/// Health of the cached scores, established at open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerHealth {
    Ok,
    /// Cached score differs from the folded history for these vehicles
    Inconsistent { vehicle_ids: Vec<String> },
}

impl LedgerHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, LedgerHealth::Ok)
    }
}

/// Cache versus history comparison for one vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub vehicle_id: String,
    /// Cached score, `None` if the vehicle has no cache row
    pub stored_score: Option<u8>,
    pub folded_score: u8,
    pub event_count: u64,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.stored_score.unwrap_or(DEFAULT_SCORE) == self.folded_score
    }
}

/// Observability metrics for the ledger
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMetrics {
    pub trust_events_applied_total: u64,
    pub trust_conflicts_total: u64,
    pub trust_out_of_order_total: u64,
    pub trust_recomputes_total: u64,
    pub trust_startup_checks_total: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    conflicts: AtomicU64,
    out_of_order: AtomicU64,
    recomputes: AtomicU64,
    startup_checks: AtomicU64,
}

struct ScoreRow {
    score: u8,
    version: i64,
    latest_event_timestamp: Option<u64>,
}

/// Per-vehicle trust score ledger
///
/// All methods take `&self`; share the ledger behind an `Arc`.
pub struct TrustLedger {
    pool: ConnectionPool,
    retry: RetryPolicy,
    health: RwLock<LedgerHealth>,
    counters: Counters,
}

impl TrustLedger {
    /// Open the ledger with default settings
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, &TrustConfig::default())
    }

    /// Create or open a ledger, then run the startup consistency check
    pub fn open_with_config(path: impl AsRef<Path>, config: &TrustConfig) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening trust ledger");

        let pool = ConnectionPool::open(
            path,
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
            Self::init_schema,
        )?;

        let ledger = Self {
            pool,
            retry: config.retry,
            health: RwLock::new(LedgerHealth::Ok),
            counters: Counters::default(),
        };

        ledger.startup_consistency_check()?;

        Ok(ledger)
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trust_events (
                seq_no INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                vehicle_id TEXT NOT NULL,
                change INTEGER NOT NULL,
                previous_score INTEGER NOT NULL,
                new_score INTEGER NOT NULL,
                reason TEXT NOT NULL,
                source TEXT NOT NULL,
                event_timestamp INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trust_events_vehicle
                ON trust_events(vehicle_id, event_timestamp, seq_no);

            CREATE TRIGGER IF NOT EXISTS trust_events_no_update
                BEFORE UPDATE ON trust_events
                BEGIN SELECT RAISE(ABORT, 'trust_events is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS trust_events_no_delete
                BEFORE DELETE ON trust_events
                BEGIN SELECT RAISE(ABORT, 'trust_events is append-only'); END;

            CREATE TABLE IF NOT EXISTS vehicle_scores (
                vehicle_id TEXT PRIMARY KEY,
                score INTEGER NOT NULL CHECK (score BETWEEN 0 AND 100),
                version INTEGER NOT NULL,
                latest_event_timestamp INTEGER,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
    }

    /// Apply a score change for a vehicle.
    ///
    /// `event_timestamp` is the time of the scored fact; when `None` the
    /// event is stamped with the later of now and the latest event.
    ///
    /// # Errors
    /// * `OutOfOrder` - the timestamp precedes the vehicle's latest event; nothing is written
    /// * `Conflict` - concurrent writers kept winning until retries ran out
    pub fn apply_delta(
        &self,
        vehicle_id: &str,
        change: i32,
        reason: &str,
        source: TrustSource,
        event_timestamp: Option<u64>,
    ) -> Result<ScoreChange> {
        if vehicle_id.is_empty() {
            return Err(LedgerError::InvalidEvent(
                "vehicle_id cannot be empty".to_string(),
            ));
        }
        self.ensure_consistent(vehicle_id)?;

        let result = with_retry(&self.retry, |attempt| {
            let outcome = self.try_apply(vehicle_id, change, reason, source, event_timestamp);
            if let Err(ref err) = outcome {
                if err.is_retryable() {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    debug!(vehicle_id, attempt, error = %err, "Trust update conflicted");
                }
            }
            outcome
        })
        .map_err(|err| err.into_conflict_if_busy(vehicle_id));

        match &result {
            Ok(applied) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    vehicle_id,
                    change,
                    source = %source,
                    previous_score = applied.previous_score,
                    new_score = applied.new_score,
                    seq_no = applied.seq_no,
                    "Trust event applied"
                );
            }
            Err(LedgerError::OutOfOrder {
                event_timestamp,
                latest_timestamp,
                ..
            }) => {
                self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
                warn!(
                    vehicle_id,
                    event_timestamp, latest_timestamp, "Rejected out-of-order trust event"
                );
            }
            Err(err) => warn!(vehicle_id, change, error = %err, "Trust update failed"),
        }

        result
    }

    fn try_apply(
        &self,
        vehicle_id: &str,
        change: i32,
        reason: &str,
        source: TrustSource,
        event_timestamp: Option<u64>,
    ) -> Result<ScoreChange> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;

        let row = Self::read_score_row(&tx, vehicle_id)?;
        let (previous_score, version, latest) = match &row {
            Some(row) => (row.score, row.version, row.latest_event_timestamp),
            None => (DEFAULT_SCORE, 0, None),
        };

        if let (Some(at), Some(latest)) = (event_timestamp, latest) {
            if at < latest {
                // Dropping the transaction rolls it back
                return Err(LedgerError::OutOfOrder {
                    vehicle_id: vehicle_id.to_string(),
                    event_timestamp: at,
                    latest_timestamp: latest,
                });
            }
        }

        let new_score = apply_change(previous_score, change);
        let recorded_at = current_timestamp_ms();
        let event_timestamp = event_timestamp
            .unwrap_or_else(|| latest.map_or(recorded_at, |latest| latest.max(recorded_at)));
        let event_id = uuid::Uuid::new_v4().to_string();

        tx.execute(
            r#"
            INSERT INTO trust_events (
                event_id, vehicle_id, change, previous_score, new_score,
                reason, source, event_timestamp, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event_id,
                vehicle_id,
                change,
                previous_score,
                new_score,
                reason,
                source.as_str(),
                event_timestamp as i64,
                recorded_at as i64,
            ],
        )?;
        let seq_no = tx.last_insert_rowid() as u64;

        let written = if row.is_some() {
            tx.execute(
                r#"
                UPDATE vehicle_scores
                SET score = ?1, version = version + 1, latest_event_timestamp = ?2, updated_at = ?3
                WHERE vehicle_id = ?4 AND version = ?5
                "#,
                params![
                    new_score,
                    event_timestamp as i64,
                    recorded_at as i64,
                    vehicle_id,
                    version
                ],
            )?
        } else {
            tx.execute(
                r#"
                INSERT INTO vehicle_scores (vehicle_id, score, version, latest_event_timestamp, updated_at)
                VALUES (?1, ?2, 1, ?3, ?4)
                ON CONFLICT(vehicle_id) DO NOTHING
                "#,
                params![vehicle_id, new_score, event_timestamp as i64, recorded_at as i64],
            )?
        };

        if written != 1 {
            return Err(LedgerError::Conflict {
                vehicle_id: vehicle_id.to_string(),
            });
        }

        tx.commit()?;

        Ok(ScoreChange {
            vehicle_id: vehicle_id.to_string(),
            event_id,
            seq_no,
            previous_score,
            new_score,
            event_timestamp,
        })
    }

    fn read_score_row(conn: &Connection, vehicle_id: &str) -> Result<Option<ScoreRow>> {
        let row = conn
            .query_row(
                "SELECT score, version, latest_event_timestamp FROM vehicle_scores WHERE vehicle_id = ?1",
                params![vehicle_id],
                |row| {
                    Ok(ScoreRow {
                        score: row.get(0)?,
                        version: row.get(1)?,
                        latest_event_timestamp: row.get::<_, Option<i64>>(2)?.map(|t| t as u64),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Current score, 100 for vehicles without events
    pub fn current_score(&self, vehicle_id: &str) -> Result<u8> {
        let conn = self.pool.get()?;
        Ok(Self::read_score_row(&conn, vehicle_id)?
            .map(|row| row.score)
            .unwrap_or(DEFAULT_SCORE))
    }

    /// All events of a vehicle in fold order
    pub fn events_for(&self, vehicle_id: &str) -> Result<Vec<TrustEvent>> {
        let conn = self.pool.get()?;
        Self::load_events(&conn, vehicle_id)
    }

    /// Most recent event of a vehicle
    pub fn latest_event(&self, vehicle_id: &str) -> Result<Option<TrustEvent>> {
        Ok(self.events_for(vehicle_id)?.pop())
    }

    fn load_events(conn: &Connection, vehicle_id: &str) -> Result<Vec<TrustEvent>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT seq_no, event_id, vehicle_id, change, previous_score, new_score,
                   reason, source, event_timestamp, recorded_at
            FROM trust_events
            WHERE vehicle_id = ?1
            ORDER BY event_timestamp ASC, seq_no ASC
            "#,
        )?;

        let rows = stmt.query_map(params![vehicle_id], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i32>(3)?,
                row.get::<_, u8>(4)?,
                row.get::<_, u8>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)? as u64,
                row.get::<_, i64>(9)? as u64,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (seq_no, event_id, vehicle_id, change, previous_score, new_score, reason, source, event_timestamp, recorded_at) =
                row?;
            let source = TrustSource::parse(&source).ok_or_else(|| LedgerError::CorruptEvent {
                seq_no,
                detail: format!("unknown source '{}'", source),
            })?;
            events.push(TrustEvent {
                seq_no,
                event_id,
                vehicle_id,
                change,
                previous_score,
                new_score,
                reason,
                source,
                event_timestamp,
                recorded_at,
            });
        }

        Ok(events)
    }

    fn fold_history(conn: &Connection, vehicle_id: &str) -> Result<(u8, u64)> {
        let events = Self::load_events(conn, vehicle_id)?;
        let count = events.len() as u64;
        Ok((fold_scores(events.iter().map(|e| e.change)), count))
    }

    /// Fold the history and overwrite the cached score with the result
    pub fn recompute(&self, vehicle_id: &str) -> Result<u8> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let events = Self::load_events(&tx, vehicle_id)?;
        let folded = fold_scores(events.iter().map(|e| e.change));
        let latest = events.iter().map(|e| e.event_timestamp).max();

        tx.execute(
            r#"
            INSERT INTO vehicle_scores (vehicle_id, score, version, latest_event_timestamp, updated_at)
            VALUES (?1, ?2, 1, ?3, ?4)
            ON CONFLICT(vehicle_id) DO UPDATE SET
                score = excluded.score,
                version = vehicle_scores.version + 1,
                latest_event_timestamp = excluded.latest_event_timestamp,
                updated_at = excluded.updated_at
            "#,
            params![
                vehicle_id,
                folded,
                latest.map(|t| t as i64),
                current_timestamp_ms() as i64
            ],
        )?;
        tx.commit()?;

        self.counters.recomputes.fetch_add(1, Ordering::Relaxed);
        self.clear_inconsistent(vehicle_id);

        info!(vehicle_id, score = folded, event_count = events.len(), "Trust score recomputed");

        Ok(folded)
    }

    /// Compare the cached score with the folded history without writing
    pub fn audit(&self, vehicle_id: &str) -> Result<AuditReport> {
        let conn = self.pool.get()?;
        let stored_score = Self::read_score_row(&conn, vehicle_id)?.map(|row| row.score);
        let (folded_score, event_count) = Self::fold_history(&conn, vehicle_id)?;
        Ok(AuditReport {
            vehicle_id: vehicle_id.to_string(),
            stored_score,
            folded_score,
            event_count,
        })
    }

    /// Every vehicle with a cached score or at least one event
    pub fn vehicles(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT vehicle_id FROM vehicle_scores
            UNION
            SELECT DISTINCT vehicle_id FROM trust_events
            ORDER BY vehicle_id
            "#,
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Audit every vehicle and record the outcome as the ledger health
    pub fn startup_consistency_check(&self) -> Result<LedgerHealth> {
        self.counters.startup_checks.fetch_add(1, Ordering::Relaxed);
        info!(path = %self.pool.path().display(), "Starting trust ledger consistency check");

        let mut inconsistent = Vec::new();
        let vehicles = self.vehicles()?;
        for vehicle_id in &vehicles {
            let report = self.audit(vehicle_id)?;
            if !report.is_consistent() {
                error!(
                    vehicle_id = %vehicle_id,
                    stored_score = ?report.stored_score,
                    folded_score = report.folded_score,
                    "Cached trust score disagrees with event history"
                );
                inconsistent.push(vehicle_id.clone());
            }
        }

        let health = if inconsistent.is_empty() {
            info!(vehicles = vehicles.len(), "Trust ledger consistency check passed");
            LedgerHealth::Ok
        } else {
            LedgerHealth::Inconsistent {
                vehicle_ids: inconsistent,
            }
        };

        *self.health.write().unwrap_or_else(|p| p.into_inner()) = health.clone();
        Ok(health)
    }

    /// Recompute every vehicle flagged by the last consistency check
    pub fn repair(&self) -> Result<Vec<String>> {
        let flagged = match self.health() {
            LedgerHealth::Ok => return Ok(Vec::new()),
            LedgerHealth::Inconsistent { vehicle_ids } => vehicle_ids,
        };
        for vehicle_id in &flagged {
            self.recompute(vehicle_id)?;
        }
        Ok(flagged)
    }

    pub fn health(&self) -> LedgerHealth {
        self.health.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn metrics(&self) -> LedgerMetrics {
        LedgerMetrics {
            trust_events_applied_total: self.counters.applied.load(Ordering::Relaxed),
            trust_conflicts_total: self.counters.conflicts.load(Ordering::Relaxed),
            trust_out_of_order_total: self.counters.out_of_order.load(Ordering::Relaxed),
            trust_recomputes_total: self.counters.recomputes.load(Ordering::Relaxed),
            trust_startup_checks_total: self.counters.startup_checks.load(Ordering::Relaxed),
        }
    }

    fn ensure_consistent(&self, vehicle_id: &str) -> Result<()> {
        match &*self.health.read().unwrap_or_else(|p| p.into_inner()) {
            LedgerHealth::Inconsistent { vehicle_ids } if vehicle_ids.iter().any(|v| v == vehicle_id) => {
                Err(LedgerError::InconsistentScore {
                    vehicle_id: vehicle_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn clear_inconsistent(&self, vehicle_id: &str) {
        let mut health = self.health.write().unwrap_or_else(|p| p.into_inner());
        if let LedgerHealth::Inconsistent { vehicle_ids } = &mut *health {
            vehicle_ids.retain(|v| v != vehicle_id);
            if vehicle_ids.is_empty() {
                *health = LedgerHealth::Ok;
            }
        }
    }

    /// Execute raw SQL against the ledger database.
    ///
    /// Only for corrupting the cache in tests.
    #[doc(hidden)]
    pub fn __test_execute_raw_sql(&self, sql: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}
