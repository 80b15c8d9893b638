//! Purchase engine
//!
//! Every operation is a short SQLite transaction. Status changes are
//! compare-and-set (`WHERE status = ?`), so two callers racing on the same
//! request cannot both win; the loser gets `Conflict`.

use crate::error::{MarketError, MarketResult};
use crate::records::{Escrow, OwnershipEntry, PurchaseRequest, SaleRecord, StatusTransition};
use crate::sources::{ProvenanceSource, TrustScoreSource};
use crate::status::{EscrowStatus, PurchaseStatus, SellerResponse};
use crate::verification::{VerificationPolicy, VerificationResult};
use odotrust_core::current_timestamp_ms;
use odotrust_core::sqlite::{is_constraint_violation, ConnectionPool};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

const POOL_SIZE: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_millis(1_000);

const REQUEST_COLUMNS: &str = "id, vehicle_id, buyer_id, seller_id, offered_price, counter_price, \
     agreed_price, status, escrow_id, verification, created_at, updated_at";

const ESCROW_COLUMNS: &str =
    "id, purchase_request_id, amount, status, idempotency_key, created_at, updated_at";

/// Steps of the transfer transaction where a fault can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    /// The claim is committed and the engine stops, as if the process died
    AfterClaim,
    AfterOwnershipUpdate,
    AfterSaleRecord,
    AfterStatusUpdate,
}

pub struct PurchaseEngine {
    pool: ConnectionPool,
    policy: VerificationPolicy,
    trust: Arc<dyn TrustScoreSource>,
    provenance: Arc<dyn ProvenanceSource>,
    transfer_fault: Mutex<Option<TransferStep>>,
}

impl PurchaseEngine {
    pub fn open(
        path: impl AsRef<Path>,
        policy: VerificationPolicy,
        trust: Arc<dyn TrustScoreSource>,
        provenance: Arc<dyn ProvenanceSource>,
    ) -> MarketResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening purchase engine");

        let pool = ConnectionPool::open(path, POOL_SIZE, BUSY_TIMEOUT, Self::init_schema)?;

        let engine = Self {
            pool,
            policy,
            trust,
            provenance,
            transfer_fault: Mutex::new(None),
        };
        engine.recover_stale_claims()?;
        Ok(engine)
    }

    /// Return requests left in `transfer_pending` by an interrupted transfer
    /// to `verification_passed`. Runs at open, before this engine starts any
    /// transfer, so every claim found is stale.
    pub fn recover_stale_claims(&self) -> MarketResult<Vec<String>> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM purchase_requests WHERE status = ?1 ORDER BY updated_at ASC",
                REQUEST_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![PurchaseStatus::TransferPending.as_str()], read_request)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().collect::<MarketResult<Vec<_>>>()?
        };

        let now = current_timestamp_ms();
        for request in &stale {
            set_status(
                &tx,
                request,
                PurchaseStatus::VerificationPassed,
                "system",
                Some("interrupted transfer recovered"),
                now,
            )?;
        }
        tx.commit()?;

        let ids: Vec<String> = stale.into_iter().map(|r| r.id).collect();
        if !ids.is_empty() {
            warn!(requests = ?ids, "Reverted interrupted transfer claims");
        }
        Ok(ids)
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vehicles (
                vehicle_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ownership_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT NOT NULL REFERENCES vehicles(vehicle_id),
                owner_id TEXT NOT NULL,
                from_ts INTEGER NOT NULL,
                to_ts INTEGER,
                anchor_reference TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_ownership_open
                ON ownership_history(vehicle_id) WHERE to_ts IS NULL;

            CREATE TABLE IF NOT EXISTS purchase_requests (
                id TEXT PRIMARY KEY,
                vehicle_id TEXT NOT NULL REFERENCES vehicles(vehicle_id),
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                offered_price TEXT NOT NULL,
                counter_price TEXT,
                agreed_price TEXT,
                status TEXT NOT NULL,
                escrow_id TEXT,
                verification TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS escrows (
                id TEXT PRIMARY KEY,
                purchase_request_id TEXT NOT NULL REFERENCES purchase_requests(id),
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sale_records (
                id TEXT PRIMARY KEY,
                purchase_request_id TEXT NOT NULL UNIQUE REFERENCES purchase_requests(id),
                vehicle_id TEXT NOT NULL,
                buyer_id TEXT NOT NULL,
                seller_id TEXT NOT NULL,
                price TEXT NOT NULL,
                anchor_reference TEXT,
                sold_at INTEGER NOT NULL
            );

            CREATE TRIGGER IF NOT EXISTS sale_records_no_update
                BEFORE UPDATE ON sale_records
                BEGIN SELECT RAISE(ABORT, 'sale records are immutable'); END;

            CREATE TRIGGER IF NOT EXISTS sale_records_no_delete
                BEFORE DELETE ON sale_records
                BEGIN SELECT RAISE(ABORT, 'sale records are immutable'); END;

            CREATE TABLE IF NOT EXISTS request_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT,
                at INTEGER NOT NULL,
                transition_hash TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_request
                ON request_transitions(request_id, id);
            "#,
        )
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Record the first owner of a vehicle
    pub fn register_vehicle(&self, vehicle_id: &str, owner_id: &str) -> MarketResult<OwnershipEntry> {
        require_non_empty("vehicle_id", vehicle_id)?;
        require_non_empty("owner_id", owner_id)?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = current_timestamp_ms();

        let inserted = tx.execute(
            "INSERT INTO vehicles (vehicle_id, owner_id, version, updated_at) VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(vehicle_id) DO NOTHING",
            params![vehicle_id, owner_id, now as i64],
        )?;
        if inserted == 0 {
            return Err(MarketError::InvalidInput(format!(
                "vehicle {} already registered",
                vehicle_id
            )));
        }
        tx.execute(
            "INSERT INTO ownership_history (vehicle_id, owner_id, from_ts) VALUES (?1, ?2, ?3)",
            params![vehicle_id, owner_id, now as i64],
        )?;
        tx.commit()?;

        info!(vehicle_id, owner_id, "Vehicle registered");

        Ok(OwnershipEntry {
            vehicle_id: vehicle_id.to_string(),
            owner_id: owner_id.to_string(),
            from_ts: now,
            to_ts: None,
            anchor_reference: None,
        })
    }

    /// Open a purchase request addressed to the vehicle's current owner
    pub fn create_request(
        &self,
        vehicle_id: &str,
        buyer_id: &str,
        offered_price: Decimal,
    ) -> MarketResult<PurchaseRequest> {
        require_non_empty("buyer_id", buyer_id)?;
        require_positive("offered_price", offered_price)?;

        let seller_id = self.owner_of(vehicle_id)?.ok_or_else(|| MarketError::NotFound {
            entity: "vehicle",
            id: vehicle_id.to_string(),
        })?;
        if seller_id == buyer_id {
            return Err(MarketError::InvalidInput(
                "buyer already owns the vehicle".to_string(),
            ));
        }

        let now = current_timestamp_ms();
        let request = PurchaseRequest {
            id: uuid::Uuid::new_v4().to_string(),
            vehicle_id: vehicle_id.to_string(),
            buyer_id: buyer_id.to_string(),
            seller_id,
            offered_price,
            counter_price: None,
            agreed_price: None,
            status: PurchaseStatus::PendingSeller,
            escrow_id: None,
            verification: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO purchase_requests (
                id, vehicle_id, buyer_id, seller_id, offered_price, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                request.id,
                request.vehicle_id,
                request.buyer_id,
                request.seller_id,
                request.offered_price.to_string(),
                request.status.as_str(),
                now as i64,
                now as i64,
            ],
        )?;

        info!(
            request_id = %request.id,
            vehicle_id,
            buyer_id,
            price = %offered_price,
            "Purchase request created"
        );

        Ok(request)
    }

    /// Seller accepts, rejects or counters a pending request
    pub fn respond(
        &self,
        request_id: &str,
        seller_id: &str,
        response: SellerResponse,
    ) -> MarketResult<PurchaseRequest> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let request = load_request(&tx, request_id)?;
        require_actor(&request.seller_id, seller_id, "respond to this request")?;
        require_status(&request, PurchaseStatus::PendingSeller, "respond to")?;

        let now = current_timestamp_ms();
        let (next, reason) = match &response {
            SellerResponse::Accept => {
                tx.execute(
                    "UPDATE purchase_requests SET agreed_price = ?1 WHERE id = ?2",
                    params![request.offered_price.to_string(), request_id],
                )?;
                (PurchaseStatus::Accepted, "seller accepted".to_string())
            }
            SellerResponse::Reject => (PurchaseStatus::Rejected, "seller rejected".to_string()),
            SellerResponse::Counter { price } => {
                require_positive("counter price", *price)?;
                tx.execute(
                    "UPDATE purchase_requests SET counter_price = ?1 WHERE id = ?2",
                    params![price.to_string(), request_id],
                )?;
                (PurchaseStatus::CounterOffer, format!("seller countered at {}", price))
            }
        };

        set_status(&tx, &request, next, seller_id, Some(&reason), now)?;
        let updated = load_request(&tx, request_id)?;
        tx.commit()?;

        info!(request_id, status = %updated.status, "Seller responded");
        Ok(updated)
    }

    /// Buyer takes the seller's counter price
    pub fn accept_counter(&self, request_id: &str, buyer_id: &str) -> MarketResult<PurchaseRequest> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let request = load_request(&tx, request_id)?;
        require_actor(&request.buyer_id, buyer_id, "accept this counter offer")?;
        require_status(&request, PurchaseStatus::CounterOffer, "accept counter on")?;

        let counter = request.counter_price.ok_or_else(|| {
            MarketError::CorruptRecord(format!("request {} countered without a price", request_id))
        })?;
        tx.execute(
            "UPDATE purchase_requests SET agreed_price = ?1 WHERE id = ?2",
            params![counter.to_string(), request_id],
        )?;
        let now = current_timestamp_ms();
        set_status(
            &tx,
            &request,
            PurchaseStatus::Accepted,
            buyer_id,
            Some("buyer accepted counter offer"),
            now,
        )?;
        let updated = load_request(&tx, request_id)?;
        tx.commit()?;

        info!(request_id, price = %counter, "Counter offer accepted");
        Ok(updated)
    }

    /// Fund the escrow of an accepted request.
    ///
    /// Repeating the call with the same idempotency key returns the escrow
    /// created by the first call, whatever state the request reached since.
    pub fn fund_escrow(
        &self,
        request_id: &str,
        buyer_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> MarketResult<Escrow> {
        require_non_empty("idempotency_key", idempotency_key)?;

        match self.try_fund(request_id, buyer_id, amount, idempotency_key) {
            // A concurrent first call won the UNIQUE key
            Err(MarketError::DatabaseError(ref e)) if is_constraint_violation(e) => {
                let conn = self.pool.get()?;
                let existing = escrow_by_key(&conn, idempotency_key)?.ok_or_else(|| {
                    MarketError::CorruptRecord(format!(
                        "idempotency key {} rejected but not stored",
                        idempotency_key
                    ))
                })?;
                let escrow = bound_to(existing, request_id, idempotency_key)?;
                let request = load_request(&conn, request_id)?;
                require_actor(&request.buyer_id, buyer_id, "fund this escrow")?;
                Ok(escrow)
            }
            other => other,
        }
    }

    fn try_fund(
        &self,
        request_id: &str,
        buyer_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> MarketResult<Escrow> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = escrow_by_key(&tx, idempotency_key)? {
            let escrow = bound_to(existing, request_id, idempotency_key)?;
            let request = load_request(&tx, request_id)?;
            require_actor(&request.buyer_id, buyer_id, "fund this escrow")?;
            info!(request_id, escrow_id = %escrow.id, "Escrow funding replayed");
            return Ok(escrow);
        }

        let request = load_request(&tx, request_id)?;
        require_actor(&request.buyer_id, buyer_id, "fund this escrow")?;
        require_status(&request, PurchaseStatus::Accepted, "fund escrow for")?;

        let expected = request.agreed_price.ok_or_else(|| {
            MarketError::CorruptRecord(format!("accepted request {} has no agreed price", request_id))
        })?;
        if amount != expected {
            return Err(MarketError::AmountMismatch {
                expected,
                actual: amount,
            });
        }

        let now = current_timestamp_ms();
        let escrow = Escrow {
            id: uuid::Uuid::new_v4().to_string(),
            purchase_request_id: request_id.to_string(),
            amount,
            status: EscrowStatus::Funded,
            idempotency_key: idempotency_key.to_string(),
            created_at: now,
            updated_at: now,
        };

        tx.execute(
            r#"
            INSERT INTO escrows (id, purchase_request_id, amount, status, idempotency_key, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                escrow.id,
                escrow.purchase_request_id,
                escrow.amount.to_string(),
                escrow.status.as_str(),
                escrow.idempotency_key,
                now as i64,
                now as i64,
            ],
        )?;
        tx.execute(
            "UPDATE purchase_requests SET escrow_id = ?1 WHERE id = ?2",
            params![escrow.id, request_id],
        )?;
        set_status(
            &tx,
            &request,
            PurchaseStatus::EscrowFunded,
            buyer_id,
            Some("escrow funded"),
            now,
        )?;
        tx.commit()?;

        info!(request_id, escrow_id = %escrow.id, amount = %amount, "Escrow funded");
        Ok(escrow)
    }

    /// Run the verification checks on a funded request.
    ///
    /// Failure is terminal and refunds the escrow.
    pub fn verify(&self, request_id: &str) -> MarketResult<VerificationResult> {
        let request = self.request(request_id)?;
        require_status(&request, PurchaseStatus::EscrowFunded, "verify")?;

        let score = self.trust.trust_score(&request.vehicle_id)?;
        let provenance = self.provenance.provenance(&request.vehicle_id)?;
        let now = current_timestamp_ms();
        let result = self
            .policy
            .evaluate(&request.vehicle_id, score, provenance.as_ref(), now);

        let verification = serde_json::to_string(&result)
            .map_err(|e| MarketError::CorruptRecord(format!("verification encoding: {}", e)))?;

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE purchase_requests SET verification = ?1 WHERE id = ?2",
            params![verification, request_id],
        )?;

        if result.passed {
            set_status(
                &tx,
                &request,
                PurchaseStatus::VerificationPassed,
                "verifier",
                None,
                now,
            )?;
        } else {
            let reason = result.reasons.join("; ");
            set_status(
                &tx,
                &request,
                PurchaseStatus::VerificationFailed,
                "verifier",
                Some(&reason),
                now,
            )?;
            refund_escrow(&tx, &request, now)?;
        }
        tx.commit()?;

        if result.passed {
            info!(request_id, vehicle_id = %request.vehicle_id, score, "Verification passed");
        } else {
            warn!(
                request_id,
                vehicle_id = %request.vehicle_id,
                score,
                reasons = ?result.reasons,
                "Verification failed, escrow refunded"
            );
        }

        Ok(result)
    }

    /// Hand the vehicle to the buyer.
    ///
    /// The request is first claimed (`transfer_pending`); ownership, sale
    /// record, `sold` and escrow release then commit together. If that
    /// transaction fails nothing of it is visible and the claim is reverted.
    /// A claim left behind by a crash is reverted the next time the engine
    /// opens.
    pub fn confirm_transfer(&self, request_id: &str, seller_id: &str) -> MarketResult<SaleRecord> {
        let request = self.request(request_id)?;
        require_actor(&request.seller_id, seller_id, "confirm this transfer")?;
        require_status(&request, PurchaseStatus::VerificationPassed, "confirm transfer of")?;

        let anchor_reference = self
            .provenance
            .provenance(&request.vehicle_id)?
            .and_then(|p| p.latest_anchor_reference);

        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            set_status(
                &tx,
                &request,
                PurchaseStatus::TransferPending,
                seller_id,
                Some("seller confirmed"),
                current_timestamp_ms(),
            )?;
            tx.commit()?;
        }

        let claimed = PurchaseRequest {
            status: PurchaseStatus::TransferPending,
            ..request
        };
        self.check_fault(TransferStep::AfterClaim)?;

        match self.complete_transfer(&claimed, anchor_reference) {
            Ok(sale) => {
                info!(
                    request_id,
                    vehicle_id = %sale.vehicle_id,
                    buyer_id = %sale.buyer_id,
                    price = %sale.price,
                    "Ownership transferred"
                );
                Ok(sale)
            }
            Err(err) => {
                error!(request_id, error = %err, "Transfer rolled back");
                if let Err(revert) = self.revert_claim(&claimed) {
                    error!(request_id, error = %revert, "Failed to revert transfer claim");
                }
                Err(err)
            }
        }
    }

    fn complete_transfer(
        &self,
        request: &PurchaseRequest,
        anchor_reference: Option<String>,
    ) -> MarketResult<SaleRecord> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = current_timestamp_ms();

        // 1. ownership
        let (owner_id, version): (String, i64) = tx
            .query_row(
                "SELECT owner_id, version FROM vehicles WHERE vehicle_id = ?1",
                params![request.vehicle_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| MarketError::NotFound {
                entity: "vehicle",
                id: request.vehicle_id.clone(),
            })?;
        if owner_id != request.seller_id {
            return Err(MarketError::Conflict {
                request_id: request.id.clone(),
            });
        }

        tx.execute(
            "UPDATE ownership_history SET to_ts = ?1 WHERE vehicle_id = ?2 AND to_ts IS NULL",
            params![now as i64, request.vehicle_id],
        )?;
        let moved = tx.execute(
            "UPDATE vehicles SET owner_id = ?1, version = version + 1, updated_at = ?2
             WHERE vehicle_id = ?3 AND version = ?4",
            params![request.buyer_id, now as i64, request.vehicle_id, version],
        )?;
        if moved != 1 {
            return Err(MarketError::Conflict {
                request_id: request.id.clone(),
            });
        }
        tx.execute(
            "INSERT INTO ownership_history (vehicle_id, owner_id, from_ts, anchor_reference)
             VALUES (?1, ?2, ?3, ?4)",
            params![request.vehicle_id, request.buyer_id, now as i64, anchor_reference],
        )?;
        self.check_fault(TransferStep::AfterOwnershipUpdate)?;

        // 2. sale record
        let price = request.agreed_price.ok_or_else(|| {
            MarketError::CorruptRecord(format!("request {} has no agreed price", request.id))
        })?;
        let sale = SaleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            purchase_request_id: request.id.clone(),
            vehicle_id: request.vehicle_id.clone(),
            buyer_id: request.buyer_id.clone(),
            seller_id: request.seller_id.clone(),
            price,
            anchor_reference,
            sold_at: now,
        };
        tx.execute(
            r#"
            INSERT INTO sale_records (
                id, purchase_request_id, vehicle_id, buyer_id, seller_id, price, anchor_reference, sold_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                sale.id,
                sale.purchase_request_id,
                sale.vehicle_id,
                sale.buyer_id,
                sale.seller_id,
                sale.price.to_string(),
                sale.anchor_reference,
                now as i64,
            ],
        )?;
        self.check_fault(TransferStep::AfterSaleRecord)?;

        // 3. request status
        set_status(&tx, request, PurchaseStatus::Sold, &request.seller_id, None, now)?;
        self.check_fault(TransferStep::AfterStatusUpdate)?;

        // 4. escrow
        let released = tx.execute(
            "UPDATE escrows SET status = ?1, updated_at = ?2
             WHERE purchase_request_id = ?3 AND status = ?4",
            params![
                EscrowStatus::Released.as_str(),
                now as i64,
                request.id,
                EscrowStatus::Funded.as_str()
            ],
        )?;
        if released != 1 {
            return Err(MarketError::CorruptRecord(format!(
                "request {} has no funded escrow to release",
                request.id
            )));
        }

        tx.commit()?;
        Ok(sale)
    }

    fn revert_claim(&self, claimed: &PurchaseRequest) -> MarketResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        set_status(
            &tx,
            claimed,
            PurchaseStatus::VerificationPassed,
            "system",
            Some("transfer rolled back"),
            current_timestamp_ms(),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Cancel a request that has not reached a terminal state; a funded escrow is refunded
    pub fn cancel(&self, request_id: &str, actor_id: &str) -> MarketResult<PurchaseRequest> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let request = load_request(&tx, request_id)?;
        if actor_id != request.buyer_id && actor_id != request.seller_id {
            return Err(MarketError::Unauthorized {
                actor: actor_id.to_string(),
                action: "cancel this request",
            });
        }
        if !request.status.can_transition_to(PurchaseStatus::Cancelled) {
            return Err(MarketError::InvalidTransition {
                request_id: request_id.to_string(),
                status: request.status,
                action: "cancel",
            });
        }

        let now = current_timestamp_ms();
        set_status(
            &tx,
            &request,
            PurchaseStatus::Cancelled,
            actor_id,
            Some("cancelled by participant"),
            now,
        )?;
        refund_escrow(&tx, &request, now)?;
        let updated = load_request(&tx, request_id)?;
        tx.commit()?;

        info!(request_id, actor_id, previous = %request.status, "Purchase request cancelled");
        Ok(updated)
    }

    pub fn request(&self, request_id: &str) -> MarketResult<PurchaseRequest> {
        let conn = self.pool.get()?;
        load_request(&conn, request_id)
    }

    pub fn escrow(&self, escrow_id: &str) -> MarketResult<Escrow> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {} FROM escrows WHERE id = ?1", ESCROW_COLUMNS),
            params![escrow_id],
            read_escrow,
        )
        .optional()?
        .ok_or_else(|| MarketError::NotFound {
            entity: "escrow",
            id: escrow_id.to_string(),
        })?
    }

    /// Number of escrows ever created for a request
    pub fn escrow_count(&self, request_id: &str) -> MarketResult<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM escrows WHERE purchase_request_id = ?1",
            params![request_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn sale_record_for(&self, request_id: &str) -> MarketResult<Option<SaleRecord>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, purchase_request_id, vehicle_id, buyer_id, seller_id, price, anchor_reference, sold_at
                FROM sale_records WHERE purchase_request_id = ?1
                "#,
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(id, purchase_request_id, vehicle_id, buyer_id, seller_id, price, anchor_reference, sold_at)| {
                Ok(SaleRecord {
                    id,
                    purchase_request_id,
                    vehicle_id,
                    buyer_id,
                    seller_id,
                    price: parse_decimal(&price)?,
                    anchor_reference,
                    sold_at: sold_at as u64,
                })
            },
        )
        .transpose()
    }

    pub fn owner_of(&self, vehicle_id: &str) -> MarketResult<Option<String>> {
        let conn = self.pool.get()?;
        let owner = conn
            .query_row(
                "SELECT owner_id FROM vehicles WHERE vehicle_id = ?1",
                params![vehicle_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Ownership intervals, oldest first
    pub fn ownership_history(&self, vehicle_id: &str) -> MarketResult<Vec<OwnershipEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT vehicle_id, owner_id, from_ts, to_ts, anchor_reference
            FROM ownership_history WHERE vehicle_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let entries = stmt
            .query_map(params![vehicle_id], |row| {
                Ok(OwnershipEntry {
                    vehicle_id: row.get(0)?,
                    owner_id: row.get(1)?,
                    from_ts: row.get::<_, i64>(2)? as u64,
                    to_ts: row.get::<_, Option<i64>>(3)?.map(|t| t as u64),
                    anchor_reference: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Status audit trail of a request, oldest first
    pub fn transitions(&self, request_id: &str) -> MarketResult<Vec<StatusTransition>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT request_id, from_status, to_status, actor, reason, at, transition_hash
            FROM request_transitions WHERE request_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt
            .query_map(params![request_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(request_id, from, to, actor, reason, at, transition_hash)| {
                Ok(StatusTransition {
                    request_id,
                    from_status: parse_status(&from)?,
                    to_status: parse_status(&to)?,
                    actor,
                    reason,
                    at: at as u64,
                    transition_hash,
                })
            })
            .collect()
    }

    fn check_fault(&self, step: TransferStep) -> MarketResult<()> {
        let mut fault = self
            .transfer_fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *fault == Some(step) {
            *fault = None;
            return Err(MarketError::TransferFault(step));
        }
        Ok(())
    }

    /// Make the next transfer fail at `step`.
    ///
    /// Only for exercising the rollback path in tests.
    #[doc(hidden)]
    pub fn __inject_transfer_fault(&self, step: TransferStep) {
        *self
            .transfer_fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(step);
    }
}

fn require_non_empty(field: &str, value: &str) -> MarketResult<()> {
    if value.trim().is_empty() {
        return Err(MarketError::InvalidInput(format!("{} cannot be empty", field)));
    }
    Ok(())
}

fn require_positive(field: &str, value: Decimal) -> MarketResult<()> {
    if value <= Decimal::ZERO {
        return Err(MarketError::InvalidInput(format!("{} must be positive", field)));
    }
    Ok(())
}

fn require_actor(expected: &str, actor: &str, action: &'static str) -> MarketResult<()> {
    if expected != actor {
        return Err(MarketError::Unauthorized {
            actor: actor.to_string(),
            action,
        });
    }
    Ok(())
}

fn require_status(
    request: &PurchaseRequest,
    expected: PurchaseStatus,
    action: &'static str,
) -> MarketResult<()> {
    if request.status != expected {
        return Err(MarketError::InvalidTransition {
            request_id: request.id.clone(),
            status: request.status,
            action,
        });
    }
    Ok(())
}

/// Compare-and-set the request status and append the audit record
fn set_status(
    conn: &Connection,
    request: &PurchaseRequest,
    to: PurchaseStatus,
    actor: &str,
    reason: Option<&str>,
    now: u64,
) -> MarketResult<()> {
    let from = request.status;
    if !from.can_transition_to(to) {
        return Err(MarketError::InvalidTransition {
            request_id: request.id.clone(),
            status: from,
            action: "move",
        });
    }

    let changed = conn.execute(
        "UPDATE purchase_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), now as i64, request.id, from.as_str()],
    )?;
    if changed != 1 {
        return Err(MarketError::Conflict {
            request_id: request.id.clone(),
        });
    }

    conn.execute(
        r#"
        INSERT INTO request_transitions (request_id, from_status, to_status, actor, reason, at, transition_hash)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            request.id,
            from.as_str(),
            to.as_str(),
            actor,
            reason,
            now as i64,
            StatusTransition::hash(&request.id, from, to, actor, now),
        ],
    )?;
    Ok(())
}

fn refund_escrow(conn: &Connection, request: &PurchaseRequest, now: u64) -> MarketResult<()> {
    let refunded = conn.execute(
        "UPDATE escrows SET status = ?1, updated_at = ?2 WHERE purchase_request_id = ?3 AND status = ?4",
        params![
            EscrowStatus::Refunded.as_str(),
            now as i64,
            request.id,
            EscrowStatus::Funded.as_str()
        ],
    )?;
    if refunded > 0 {
        info!(request_id = %request.id, "Escrow refunded");
    }
    Ok(())
}

fn bound_to(escrow: Escrow, request_id: &str, key: &str) -> MarketResult<Escrow> {
    if escrow.purchase_request_id != request_id {
        return Err(MarketError::IdempotencyKeyReused {
            key: key.to_string(),
            bound_request_id: escrow.purchase_request_id,
        });
    }
    Ok(escrow)
}

fn load_request(conn: &Connection, request_id: &str) -> MarketResult<PurchaseRequest> {
    conn.query_row(
        &format!("SELECT {} FROM purchase_requests WHERE id = ?1", REQUEST_COLUMNS),
        params![request_id],
        read_request,
    )
    .optional()?
    .ok_or_else(|| MarketError::NotFound {
        entity: "purchase request",
        id: request_id.to_string(),
    })?
}

fn escrow_by_key(conn: &Connection, key: &str) -> MarketResult<Option<Escrow>> {
    conn.query_row(
        &format!("SELECT {} FROM escrows WHERE idempotency_key = ?1", ESCROW_COLUMNS),
        params![key],
        read_escrow,
    )
    .optional()?
    .transpose()
}

// Row readers return the SQL error outside and the decoding error inside,
// so `optional()` still sees `QueryReturnedNoRows`.
fn read_request(row: &Row<'_>) -> rusqlite::Result<MarketResult<PurchaseRequest>> {
    let id: String = row.get(0)?;
    let vehicle_id: String = row.get(1)?;
    let buyer_id: String = row.get(2)?;
    let seller_id: String = row.get(3)?;
    let offered_price: String = row.get(4)?;
    let counter_price: Option<String> = row.get(5)?;
    let agreed_price: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    let escrow_id: Option<String> = row.get(8)?;
    let verification: Option<String> = row.get(9)?;
    let created_at: i64 = row.get(10)?;
    let updated_at: i64 = row.get(11)?;

    let decode = || -> MarketResult<PurchaseRequest> {
        Ok(PurchaseRequest {
            id,
            vehicle_id,
            buyer_id,
            seller_id,
            offered_price: parse_decimal(&offered_price)?,
            counter_price: counter_price.as_deref().map(parse_decimal).transpose()?,
            agreed_price: agreed_price.as_deref().map(parse_decimal).transpose()?,
            status: parse_status(&status)?,
            escrow_id,
            verification: verification
                .as_deref()
                .map(|raw| serde_json::from_str::<VerificationResult>(raw))
                .transpose()
                .map_err(|e| MarketError::CorruptRecord(format!("verification: {}", e)))?,
            created_at: created_at as u64,
            updated_at: updated_at as u64,
        })
    };
    Ok(decode())
}

fn read_escrow(row: &Row<'_>) -> rusqlite::Result<MarketResult<Escrow>> {
    let id: String = row.get(0)?;
    let purchase_request_id: String = row.get(1)?;
    let amount: String = row.get(2)?;
    let status: String = row.get(3)?;
    let idempotency_key: String = row.get(4)?;
    let created_at: i64 = row.get(5)?;
    let updated_at: i64 = row.get(6)?;

    let decode = || -> MarketResult<Escrow> {
        Ok(Escrow {
            id,
            purchase_request_id,
            amount: parse_decimal(&amount)?,
            status: EscrowStatus::parse(&status)
                .ok_or_else(|| MarketError::CorruptRecord(format!("escrow status '{}'", status)))?,
            idempotency_key,
            created_at: created_at as u64,
            updated_at: updated_at as u64,
        })
    };
    Ok(decode())
}

fn parse_decimal(value: &str) -> MarketResult<Decimal> {
    Decimal::from_str(value).map_err(|e| MarketError::CorruptRecord(format!("amount '{}': {}", value, e)))
}

fn parse_status(value: &str) -> MarketResult<PurchaseStatus> {
    PurchaseStatus::parse(value)
        .ok_or_else(|| MarketError::CorruptRecord(format!("request status '{}'", value)))
}
