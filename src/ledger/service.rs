//! Loan ledger persistence - balance mutation and status transitions.
//!
//! Every mutating method either runs inside one database transaction or is
//! a single statement, so cross-sweep concurrency on the same loan is
//! resolved by the loan `version` column and the `gateway_ref` uniqueness
//! constraint rather than by lock ordering.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::EngineError;
use crate::ledger::model::{
    CollectionCase, Collector, Loan, LoanOffer, LoanTransaction, OfferStatus, TransactionKind,
};
use crate::money::Minor;

/// Final gateway outcome recorded on a transaction row.
#[derive(Debug, Clone, Default)]
pub struct TransactionOutcome {
    pub code: String,
    pub message: Option<String>,
    pub reference: Option<String>,
    pub payment_reference: Option<String>,
}

/// Ledger service wrapping all loan/offer/transaction/case persistence.
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ===== Fetches =====

    pub async fn offer(&self, id: Uuid) -> Result<Option<LoanOffer>, EngineError> {
        let offer = sqlx::query_as::<_, LoanOffer>("SELECT * FROM loan_offers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(offer)
    }

    pub async fn loan(&self, id: Uuid) -> Result<Option<Loan>, EngineError> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    pub async fn loan_for_offer(&self, offer_id: Uuid) -> Result<Option<Loan>, EngineError> {
        let loan = sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE offer_id = $1")
            .bind(offer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    pub async fn transaction(&self, id: Uuid) -> Result<Option<LoanTransaction>, EngineError> {
        let txn =
            sqlx::query_as::<_, LoanTransaction>("SELECT * FROM loan_transactions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(txn)
    }

    // ===== Transaction rows =====

    /// Create a pending transaction row. This happens before the gateway
    /// call so a crash mid-call still leaves a record to reconcile.
    pub async fn create_transaction(
        &self,
        loan_id: Uuid,
        amount: Minor,
        intent: TransactionKind,
    ) -> Result<LoanTransaction, EngineError> {
        let txn = sqlx::query_as::<_, LoanTransaction>(
            r#"
            INSERT INTO loan_transactions (id, loan_id, amount, kind, intent, created_at, updated_at)
            VALUES ($1, $2, $3, 'none', $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(loan_id)
        .bind(amount)
        .bind(intent)
        .fetch_one(&self.pool)
        .await?;

        Ok(txn)
    }

    /// True when some transaction already carries this gateway reference -
    /// the idempotency guard against double-applying a reconciled outcome.
    pub async fn gateway_ref_exists(&self, reference: &str) -> Result<bool, EngineError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM loan_transactions WHERE gateway_ref = $1)",
        )
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Record a definitive non-applied outcome (declined credit/debit) on a
    /// pending transaction. No balance is touched.
    pub async fn record_failure(
        &self,
        txn_id: Uuid,
        outcome: &TransactionOutcome,
    ) -> Result<(), EngineError> {
        let mut conn = self.pool.acquire().await?;
        finalize_transaction(&mut conn, txn_id, TransactionKind::None, outcome).await
    }

    /// Stamp a finalized outcome of the given kind without any ledger
    /// mutation (refunds settle against the gateway, not loan balances).
    pub async fn record_outcome(
        &self,
        txn_id: Uuid,
        kind: TransactionKind,
        outcome: &TransactionOutcome,
    ) -> Result<(), EngineError> {
        let mut conn = self.pool.acquire().await?;
        finalize_transaction(&mut conn, txn_id, kind, outcome).await
    }

    // ===== Settlement units of work =====

    /// Confirmed disbursement: open the loan, move the offer to OPEN and
    /// stamp the transaction as CREDIT, atomically.
    pub async fn settle_credit(
        &self,
        offer_id: Uuid,
        loan: &Loan,
        txn_id: Uuid,
        outcome: &TransactionOutcome,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE loans
            SET amount_remaining = amount_payable, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(loan.id)
        .bind(loan.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "loan {} changed concurrently",
                loan.id
            )));
        }

        let moved = sqlx::query(
            "UPDATE loan_offers SET status = 'open', updated_at = NOW() WHERE id = $1 AND status = 'accepted'",
        )
        .bind(offer_id)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "offer {} left ACCEPTED concurrently",
                offer_id
            )));
        }

        finalize_transaction(&mut tx, txn_id, TransactionKind::Credit, outcome).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Confirmed collection: persist the in-memory balance mutation done by
    /// [`Loan::apply_debit`] and stamp the transaction as DEBIT, atomically.
    /// `loan.version` must still hold the version the loan was fetched at.
    pub async fn settle_debit(
        &self,
        loan: &Loan,
        txn_id: Uuid,
        outcome: &TransactionOutcome,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE loans
            SET amount_remaining = $1, penalty_remaining = $2, version = version + 1, updated_at = NOW()
            WHERE id = $3 AND version = $4
            "#,
        )
        .bind(loan.amount_remaining)
        .bind(loan.penalty_remaining)
        .bind(loan.id)
        .bind(loan.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "loan {} changed concurrently",
                loan.id
            )));
        }

        finalize_transaction(&mut tx, txn_id, TransactionKind::Debit, outcome).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Close out a fully covered offer: offer -> CLOSED and any open
    /// collection case closed, atomically.
    pub async fn close_out_offer(&self, offer_id: Uuid) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE loan_offers SET status = 'closed', updated_at = NOW() WHERE id = $1")
            .bind(offer_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE collection_cases
            SET status = 'closed', updated_at = NOW()
            WHERE offer_id = $1 AND status = 'open'
            "#,
        )
        .bind(offer_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Overdue accrual unit of work: penalty bump on the loan, optional
    /// first transition to OVERDUE, optional collector assignment.
    /// `loan` carries the in-memory mutation from [`Loan::accrue_penalty`].
    pub async fn apply_accrual(
        &self,
        offer: &LoanOffer,
        loan: &Loan,
        assign_to: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE loans
            SET penalty = $1, penalty_remaining = $2, defaults = $3, next_due_date = $4,
                version = version + 1, updated_at = NOW()
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(loan.penalty)
        .bind(loan.penalty_remaining)
        .bind(loan.defaults)
        .bind(loan.next_due_date)
        .bind(loan.id)
        .bind(loan.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::Conflict(format!(
                "loan {} changed concurrently",
                loan.id
            )));
        }

        if offer.status != OfferStatus::Overdue {
            sqlx::query(
                "UPDATE loan_offers SET status = 'overdue', updated_at = NOW() WHERE id = $1",
            )
            .bind(offer.id)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(collector_id) = assign_to {
            sqlx::query(
                r#"
                INSERT INTO collection_cases (id, offer_id, assigned_to, status, assigned_at, created_at, updated_at)
                VALUES ($1, $2, $3, 'open', $4, NOW(), NOW())
                ON CONFLICT (offer_id) WHERE status = 'open'
                DO UPDATE SET assigned_to = $3, assigned_at = $4, updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(offer.id)
            .bind(collector_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Bulk-requery verdict: the offer never opened, mark it FAILED and
    /// stamp the requery timestamp.
    pub async fn mark_offer_failed(&self, offer_id: Uuid) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE loan_offers
            SET status = 'failed', last_requeried_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'accepted'
            "#,
        )
        .bind(offer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== Sweep candidate queries =====

    /// OPEN offers whose loan is due on or before `now`.
    pub async fn offers_due_for_debit(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LoanOffer>, EngineError> {
        let offers = sqlx::query_as::<_, LoanOffer>(
            r#"
            SELECT o.* FROM loan_offers o
            JOIN loans l ON l.offer_id = o.id
            WHERE o.status = 'open' AND l.due_date <= $1
            ORDER BY l.due_date
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    /// OVERDUE offers with anything still outstanding.
    pub async fn offers_overdue_for_debit(&self) -> Result<Vec<LoanOffer>, EngineError> {
        let offers = sqlx::query_as::<_, LoanOffer>(
            r#"
            SELECT o.* FROM loan_offers o
            JOIN loans l ON l.offer_id = o.id
            WHERE o.status = 'overdue' AND l.amount_remaining + l.penalty_remaining > 0
            ORDER BY l.due_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    /// ACCEPTED offers awaiting disbursement.
    pub async fn offers_accepted(&self) -> Result<Vec<LoanOffer>, EngineError> {
        let offers = sqlx::query_as::<_, LoanOffer>(
            "SELECT * FROM loan_offers WHERE status = 'accepted' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    /// ACCEPTED offers last touched before `cutoff` (bulk requery sweep).
    pub async fn offers_accepted_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LoanOffer>, EngineError> {
        let offers = sqlx::query_as::<_, LoanOffer>(
            "SELECT * FROM loan_offers WHERE status = 'accepted' AND updated_at < $1 ORDER BY updated_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    /// Offers eligible for the overdue accrual sweep: OPEN past due, or
    /// OVERDUE with a past `next_due_date`. An OVERDUE loan with no
    /// `next_due_date` is not yet eligible for re-accrual.
    pub async fn offers_for_accrual(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<LoanOffer>, EngineError> {
        let offers = sqlx::query_as::<_, LoanOffer>(
            r#"
            SELECT o.* FROM loan_offers o
            JOIN loans l ON l.offer_id = o.id
            WHERE (o.status = 'open' AND l.due_date < $1)
               OR (o.status = 'overdue' AND l.next_due_date IS NOT NULL AND l.next_due_date < $1)
            ORDER BY l.due_date
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(offers)
    }

    /// CREDIT/NONE transactions on a loan, the set the requery sweep must
    /// confirm before failing an offer.
    pub async fn transactions_for_requery(
        &self,
        loan_id: Uuid,
    ) -> Result<Vec<LoanTransaction>, EngineError> {
        let txns = sqlx::query_as::<_, LoanTransaction>(
            r#"
            SELECT * FROM loan_transactions
            WHERE loan_id = $1 AND kind IN ('credit', 'none')
            ORDER BY created_at
            "#,
        )
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(txns)
    }

    /// Transactions created with the given intent that never received a
    /// gateway outcome. These are what an in-flight scheduler would have
    /// resolved had the process kept running.
    pub async fn transactions_unresolved(
        &self,
        intent: TransactionKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LoanTransaction>, EngineError> {
        let txns = sqlx::query_as::<_, LoanTransaction>(
            r#"
            SELECT * FROM loan_transactions
            WHERE gateway_code IS NULL AND intent = $1 AND created_at < $2
            ORDER BY created_at
            "#,
        )
        .bind(intent)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(txns)
    }

    pub async fn has_credit_transaction(&self, loan_id: Uuid) -> Result<bool, EngineError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM loan_transactions WHERE loan_id = $1 AND kind = 'credit')",
        )
        .bind(loan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// True when the customer already has another running loan.
    pub async fn customer_has_active_loan(
        &self,
        customer_id: Uuid,
        excluding_offer: Uuid,
    ) -> Result<bool, EngineError> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM loan_offers
                WHERE customer_id = $1 AND id != $2 AND status IN ('open', 'overdue')
            )
            "#,
        )
        .bind(customer_id)
        .bind(excluding_offer)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    // ===== Collectors and cases =====

    /// The full ordered collector list used for round-robin assignment.
    pub async fn collectors_ordered(&self) -> Result<Vec<Collector>, EngineError> {
        let collectors = sqlx::query_as::<_, Collector>(
            "SELECT * FROM collectors WHERE active = TRUE ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(collectors)
    }

    pub async fn open_case_for_offer(
        &self,
        offer_id: Uuid,
    ) -> Result<Option<CollectionCase>, EngineError> {
        let case = sqlx::query_as::<_, CollectionCase>(
            "SELECT * FROM collection_cases WHERE offer_id = $1 AND status = 'open'",
        )
        .bind(offer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(case)
    }

    /// OPEN cases assigned at or before `cutoff` (rotation sweep).
    pub async fn open_cases_assigned_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CollectionCase>, EngineError> {
        let cases = sqlx::query_as::<_, CollectionCase>(
            "SELECT * FROM collection_cases WHERE status = 'open' AND assigned_at <= $1 ORDER BY assigned_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(cases)
    }

    pub async fn reassign_case(
        &self,
        case_id: Uuid,
        collector_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            UPDATE collection_cases
            SET assigned_to = $1, assigned_at = $2, updated_at = NOW()
            WHERE id = $3 AND status = 'open'
            "#,
        )
        .bind(collector_id)
        .bind(now)
        .bind(case_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Stamp the final gateway outcome on a pending transaction, exactly once.
/// A transaction that already carries an outcome is a conflict, not an
/// overwrite.
async fn finalize_transaction(
    conn: &mut PgConnection,
    txn_id: Uuid,
    kind: TransactionKind,
    outcome: &TransactionOutcome,
) -> Result<(), EngineError> {
    let updated = sqlx::query(
        r#"
        UPDATE loan_transactions
        SET kind = $1, gateway_code = $2, gateway_message = $3,
            gateway_ref = $4, gateway_payment_ref = $5, updated_at = NOW()
        WHERE id = $6 AND gateway_code IS NULL
        "#,
    )
    .bind(kind)
    .bind(&outcome.code)
    .bind(&outcome.message)
    .bind(&outcome.reference)
    .bind(&outcome.payment_reference)
    .bind(txn_id)
    .execute(conn)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(EngineError::Conflict(format!(
            "transaction {} already finalized",
            txn_id
        )));
    }

    Ok(())
}
