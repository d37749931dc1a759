//! Reconciliation - resolving transactions whose gateway call returned no
//! usable response.
//!
//! The gateway's `query` endpoint is idempotent, and the `gateway_ref`
//! uniqueness check makes replaying an outcome safe: if a concurrent path
//! already applied it, the replay degrades to a no-op plus whatever
//! status/notification work the current ledger state still calls for.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Policy;
use crate::error::EngineError;
use crate::gateway::{Gateway, GatewayLoanStatus, GatewayResponse};
use crate::ledger::{
    LedgerService, Loan, LoanOffer, LoanTransaction, OfferStatus, TransactionKind,
};
use crate::notify::{self, Notification, NotificationSink};

/// Which orchestrator flow a reconciliation replays.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileKind {
    Credit,
    Debit,
    Refund,
}

/// Replays after a lost write race before the conflict propagates to the
/// caller's retry policy.
const CONFLICT_REPLAYS: u32 = 3;

pub struct ReconciliationService {
    ledger: LedgerService,
    gateway: Arc<dyn Gateway>,
    notifier: Arc<dyn NotificationSink>,
    policy: Policy,
}

impl ReconciliationService {
    pub fn new(
        ledger: LedgerService,
        gateway: Arc<dyn Gateway>,
        notifier: Arc<dyn NotificationSink>,
        policy: Policy,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            policy,
        }
    }

    /// Resolve one transaction by requerying the gateway. A transport
    /// failure on the query itself is returned to the caller, whose retry
    /// policy (the scheduler's) applies.
    ///
    /// A sweep can move the loan while the query round-trip is in flight.
    /// Losing that write race is not an abandonment: the outcome is re-read
    /// and replayed, and the idempotency guards make the replay a no-op
    /// when the other writer already applied it.
    pub async fn reconcile(
        &self,
        transaction_id: Uuid,
        kind: ReconcileKind,
    ) -> Result<(), EngineError> {
        let (mut offer, mut loan, mut txn) = self.load(transaction_id).await?;

        let response = self.gateway.query(txn.id).await?;

        tracing::debug!(
            transaction_id = %transaction_id,
            kind = ?kind,
            code = %response.response_code,
            "Reconciliation query answered"
        );

        let mut replays = 0;
        loop {
            let result = match kind {
                ReconcileKind::Credit => {
                    self.apply_credit_outcome(&offer, &loan, &txn, &response).await
                }
                ReconcileKind::Debit => {
                    self.apply_debit_outcome(&offer, &loan, &txn, &response).await
                }
                ReconcileKind::Refund => self.apply_refund_outcome(&offer, &txn, &response).await,
            };

            match result {
                Err(EngineError::Conflict(reason)) if replays < CONFLICT_REPLAYS => {
                    replays += 1;
                    tracing::debug!(
                        transaction_id = %transaction_id,
                        reason = %reason,
                        replay = replays,
                        "Reconcile lost a write race; re-reading and replaying"
                    );
                    (offer, loan, txn) = self.load(transaction_id).await?;
                }
                other => return other,
            }
        }
    }

    async fn load(
        &self,
        transaction_id: Uuid,
    ) -> Result<(LoanOffer, Loan, LoanTransaction), EngineError> {
        let txn = self
            .ledger
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("transaction {}", transaction_id)))?;

        let loan = self
            .ledger
            .loan(txn.loan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan {}", txn.loan_id)))?;

        let offer = self
            .ledger
            .offer(loan.offer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan offer {}", loan.offer_id)))?;

        Ok((offer, loan, txn))
    }

    /// True when this outcome was already applied through another path.
    async fn already_applied(
        &self,
        txn: &LoanTransaction,
        response: &GatewayResponse,
    ) -> Result<bool, EngineError> {
        if txn.is_finalized() {
            return Ok(true);
        }
        if let Some(reference) = response.transaction_ref.as_deref() {
            return self.ledger.gateway_ref_exists(reference).await;
        }
        Ok(false)
    }

    async fn apply_credit_outcome(
        &self,
        offer: &LoanOffer,
        loan: &Loan,
        txn: &LoanTransaction,
        response: &GatewayResponse,
    ) -> Result<(), EngineError> {
        if !response.is_success() {
            if !txn.is_finalized() {
                self.ledger.record_failure(txn.id, &response.outcome()).await?;
                self.notify_offer(
                    offer,
                    notify::render_disbursement_failed(&offer.currency, txn.amount),
                )
                .await;
            }
            return Ok(());
        }

        if self.already_applied(txn, response).await? || offer.status != OfferStatus::Accepted {
            tracing::debug!(
                transaction_id = %txn.id,
                "Credit already applied; reconciliation is a no-op"
            );
            return Ok(());
        }

        self.ledger
            .settle_credit(offer.id, loan, txn.id, &response.outcome())
            .await?;

        tracing::info!(
            offer_id = %offer.id,
            transaction_id = %txn.id,
            "Disbursement confirmed by reconciliation"
        );

        self.notify_offer(
            offer,
            notify::render_disbursed(&offer.currency, txn.amount),
        )
        .await;

        Ok(())
    }

    async fn apply_debit_outcome(
        &self,
        offer: &LoanOffer,
        loan: &Loan,
        txn: &LoanTransaction,
        response: &GatewayResponse,
    ) -> Result<(), EngineError> {
        if !response.is_success() {
            if !txn.is_finalized() {
                self.ledger.record_failure(txn.id, &response.outcome()).await?;
            }
            return Ok(());
        }

        let already = self.already_applied(txn, response).await?;

        let (current, deducted) = if already {
            tracing::debug!(
                transaction_id = %txn.id,
                "Debit already applied; skipping mutation"
            );
            let current = self
                .ledger
                .loan(loan.id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("loan {}", loan.id)))?;
            (current, None)
        } else {
            let mut mutated = loan.clone();
            let deducted = mutated.apply_debit(txn.amount);
            self.ledger
                .settle_debit(&mutated, txn.id, &response.outcome())
                .await?;
            tracing::info!(
                offer_id = %offer.id,
                transaction_id = %txn.id,
                deducted = deducted,
                "Debit confirmed by reconciliation"
            );
            (mutated, Some(deducted))
        };

        // Same closure check as the direct debit path, against the ledger
        // state as it stands now.
        if current.is_fully_covered() && offer.status != OfferStatus::Closed {
            self.close_covered_loan(offer, &current).await?;
            if let Some(deducted) = deducted {
                self.notify_offer(
                    offer,
                    notify::render_collected_full(&offer.currency, deducted),
                )
                .await;
            }
        } else if let Some(deducted) = deducted {
            self.notify_offer(
                offer,
                notify::render_collected_partial(&offer.currency, deducted, current.outstanding()),
            )
            .await;
        }

        Ok(())
    }

    async fn apply_refund_outcome(
        &self,
        offer: &LoanOffer,
        txn: &LoanTransaction,
        response: &GatewayResponse,
    ) -> Result<(), EngineError> {
        if txn.is_finalized() {
            return Ok(());
        }

        if response.is_success() {
            self.ledger
                .record_outcome(txn.id, TransactionKind::Refund, &response.outcome())
                .await?;
            self.notify_offer(offer, notify::render_refunded(&offer.currency, txn.amount))
                .await;
        } else {
            self.ledger.record_failure(txn.id, &response.outcome()).await?;
        }

        Ok(())
    }

    async fn close_covered_loan(&self, offer: &LoanOffer, loan: &Loan) -> Result<(), EngineError> {
        let loan_ref = loan
            .external_ref
            .clone()
            .unwrap_or_else(|| loan.id.to_string());

        let response = self
            .gateway
            .update_status(&loan_ref, GatewayLoanStatus::Closed)
            .await
            .map_err(|err| EngineError::StatusUpdate {
                loan_id: loan.id,
                reason: err.to_string(),
            })?;

        if !response.is_success() {
            return Err(EngineError::StatusUpdate {
                loan_id: loan.id,
                reason: format!("gateway returned code {}", response.response_code),
            });
        }

        self.ledger.close_out_offer(offer.id).await?;
        tracing::info!(offer_id = %offer.id, "Loan closed by reconciliation");
        Ok(())
    }

    // ===== Bulk requery sweep =====

    /// Requery every unresolved disbursement on ACCEPTED offers older than
    /// the configured age; offers confirmed never to have opened move to
    /// FAILED. Returns the number of offers examined.
    pub async fn requery_stale_offers(&self) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - Duration::hours(self.policy.requery_age_hours);
        let offers = self.ledger.offers_accepted_stale(cutoff).await?;
        let examined = offers.len();

        for offer in offers {
            if let Err(err) = self.requery_offer(&offer).await {
                tracing::warn!(
                    offer_id = %offer.id,
                    error = %err,
                    "Stale offer requery failed; continuing sweep"
                );
            }
        }

        Ok(examined)
    }

    /// Requery debits and refunds that never received a final outcome,
    /// picking up work a previous process scheduled but did not live to
    /// finish. Unresolved disbursements are covered by the stale-offer
    /// requery. Returns the number of transactions examined.
    pub async fn requery_unresolved(&self) -> Result<usize, EngineError> {
        let cutoff =
            Utc::now() - Duration::seconds(self.policy.debit_requery_delay.as_secs() as i64);
        let mut examined = 0;

        for (intent, kind) in [
            (TransactionKind::Debit, ReconcileKind::Debit),
            (TransactionKind::Refund, ReconcileKind::Refund),
        ] {
            for txn in self.ledger.transactions_unresolved(intent, cutoff).await? {
                examined += 1;
                if let Err(err) = self.reconcile(txn.id, kind).await {
                    tracing::warn!(
                        transaction_id = %txn.id,
                        error = %err,
                        "Unresolved transaction requery failed; continuing sweep"
                    );
                }
            }
        }

        Ok(examined)
    }

    async fn requery_offer(&self, offer: &LoanOffer) -> Result<(), EngineError> {
        let loan = self
            .ledger
            .loan_for_offer(offer.id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("offer {} has no loan", offer.id)))?;

        let transactions = self.ledger.transactions_for_requery(loan.id).await?;

        let mut all_requeried = true;
        for txn in transactions {
            if let Err(err) = self.reconcile(txn.id, ReconcileKind::Credit).await {
                all_requeried = false;
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %err,
                    "Requery attempt failed"
                );
            }
        }

        // Only a fully confirmed non-disbursement fails the offer.
        let current = self
            .ledger
            .offer(offer.id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan offer {}", offer.id)))?;

        if all_requeried && current.status != OfferStatus::Open {
            self.ledger.mark_offer_failed(offer.id).await?;
            tracing::info!(offer_id = %offer.id, "Offer failed after exhaustive requery");
        }

        Ok(())
    }

    async fn notify_offer(&self, offer: &LoanOffer, body: String) {
        notify::send_best_effort(
            self.notifier.as_ref(),
            Notification {
                recipient: offer.customer_msisdn.clone(),
                body,
                loan_offer_id: Some(offer.id),
                best_effort: true,
            },
        )
        .await;
    }
}
