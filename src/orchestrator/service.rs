//! Transaction orchestrator - one money movement, exactly-once ledger effect.
//!
//! Every flow creates its transaction row before touching the gateway, so
//! an ambiguous call always leaves something for reconciliation to finish.
//! Declines are definitive and recorded; transport failures are deferred to
//! the reconciliation queue and never interpreted as an outcome.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::config::Policy;
use crate::error::EngineError;
use crate::gateway::{CreditRequest, DebitRequest, Gateway, GatewayLoanStatus, GatewayResponse, RefundRequest};
use crate::ledger::{LedgerService, Loan, LoanOffer, LoanTransaction, OfferStatus, TransactionKind};
use crate::money::Minor;
use crate::notify::{self, NotificationSink, Notification};
use crate::reconciliation::ReconcileKind;
use crate::schedule::{ReconcileScheduler, ReconcileTask};

/// Outcome of a disbursement attempt.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreditOutcome {
    Disbursed,
    Declined { code: String },
    /// Transport failure; reconciliation scheduled.
    Deferred,
}

/// Outcome of a collection attempt.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DebitOutcome {
    Collected { deducted: Minor, closed: bool },
    /// Declined with no usable fallback; left for the next sweep.
    Abandoned,
    /// Transport failure; reconciliation scheduled.
    Deferred,
}

/// Outcome of a refund attempt.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded,
    Declined { code: String },
    Deferred,
}

/// Partial-balance fallback bound: collect what the account can bear while
/// leaving the reserve floor untouched. `None` when the gateway reported no
/// balance or the balance does not exceed the reserve.
pub fn fallback_deductible(balance: Option<Minor>, reserve: Minor, amount: Minor) -> Option<Minor> {
    let balance = balance?;
    if balance <= reserve {
        return None;
    }
    Some((balance - reserve).min(amount))
}

/// Provider-side reference for a loan; falls back to our id for loans the
/// provider has not labelled yet.
fn provider_loan_ref(loan: &Loan) -> String {
    loan.external_ref
        .clone()
        .unwrap_or_else(|| loan.id.to_string())
}

/// Orchestrates gateway credit/debit/refund calls and their ledger effects.
pub struct OrchestratorService {
    ledger: LedgerService,
    gateway: Arc<dyn Gateway>,
    notifier: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn ReconcileScheduler>,
    policy: Policy,
}

impl OrchestratorService {
    pub fn new(
        ledger: LedgerService,
        gateway: Arc<dyn Gateway>,
        notifier: Arc<dyn NotificationSink>,
        scheduler: Arc<dyn ReconcileScheduler>,
        policy: Policy,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            scheduler,
            policy,
        }
    }

    // ===== Credit (disbursement) =====

    /// Disburse an ACCEPTED offer to the customer.
    pub async fn credit_loan_offer(&self, offer_id: Uuid) -> Result<CreditOutcome, EngineError> {
        let offer = self
            .ledger
            .offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan offer {}", offer_id)))?;

        if offer.status != OfferStatus::Accepted {
            return Err(EngineError::Invariant(format!(
                "offer {} is not ACCEPTED",
                offer_id
            )));
        }

        let loan = self
            .ledger
            .loan_for_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("offer {} has no loan", offer_id)))?;

        if self.ledger.has_credit_transaction(loan.id).await? {
            return Err(EngineError::Invariant(format!(
                "offer {} already has a disbursement",
                offer_id
            )));
        }

        if self
            .ledger
            .customer_has_active_loan(offer.customer_id, offer.id)
            .await?
        {
            return Err(EngineError::Invariant(format!(
                "customer {} already has a running loan",
                offer.customer_id
            )));
        }

        let txn = self
            .ledger
            .create_transaction(loan.id, offer.principal_amount, TransactionKind::Credit)
            .await?;

        let request = CreditRequest {
            customer_id: offer.customer_id,
            transaction_id: txn.id,
            amount: offer.principal_amount,
            currency: offer.currency.clone(),
            destination_account: loan.destination_account.clone(),
            destination_bank: loan.destination_bank.clone(),
        };

        let response = match self.gateway.credit(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    offer_id = %offer_id,
                    transaction_id = %txn.id,
                    error = %err,
                    "Credit call had no usable response; deferring to reconciliation"
                );
                self.scheduler.schedule(
                    ReconcileTask::new(txn.id, ReconcileKind::Credit),
                    self.policy.credit_requery_delay,
                );
                return Ok(CreditOutcome::Deferred);
            }
        };

        if response.is_success() {
            self.ledger
                .settle_credit(offer.id, &loan, txn.id, &response.outcome())
                .await?;

            tracing::info!(
                offer_id = %offer_id,
                amount = offer.principal_amount,
                "Loan disbursed"
            );

            self.notify_offer(
                &offer,
                notify::render_disbursed(&offer.currency, offer.principal_amount),
            )
            .await;

            Ok(CreditOutcome::Disbursed)
        } else {
            self.ledger
                .record_failure(txn.id, &response.outcome())
                .await?;

            tracing::warn!(
                offer_id = %offer_id,
                code = %response.response_code,
                "Disbursement declined; offer remains ACCEPTED"
            );

            self.notify_offer(
                &offer,
                notify::render_disbursement_failed(&offer.currency, offer.principal_amount),
            )
            .await;

            Ok(CreditOutcome::Declined {
                code: response.response_code,
            })
        }
    }

    // ===== Debit (collection) =====

    /// Collect the outstanding balance of an OPEN or OVERDUE offer, with a
    /// single partial-balance fallback attempt on decline.
    pub async fn debit_loan_offer(&self, offer_id: Uuid) -> Result<DebitOutcome, EngineError> {
        let offer = self
            .ledger
            .offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan offer {}", offer_id)))?;

        if !matches!(offer.status, OfferStatus::Open | OfferStatus::Overdue) {
            return Err(EngineError::Invariant(format!(
                "offer {} is not collectible in status {:?}",
                offer_id, offer.status
            )));
        }

        let loan = self
            .ledger
            .loan_for_offer(offer_id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("offer {} has no loan", offer_id)))?;

        if loan.outstanding() == 0 {
            return Err(EngineError::Invariant(format!(
                "loan {} is already fully covered",
                loan.id
            )));
        }

        let txn = self
            .ledger
            .create_transaction(loan.id, loan.outstanding(), TransactionKind::Debit)
            .await?;

        match self.run_debit(&offer, &loan, &txn).await {
            Ok(outcome) => Ok(outcome),
            // Money moved but the provider status is now inconsistent;
            // surfaced to operators rather than silently retried.
            Err(err @ EngineError::StatusUpdate { .. }) => Err(err),
            Err(err) => {
                tracing::error!(
                    offer_id = %offer_id,
                    transaction_id = %txn.id,
                    error = %err,
                    "Debit flow failed; deferring to reconciliation"
                );
                self.defer_debit(txn.id);
                Ok(DebitOutcome::Deferred)
            }
        }
    }

    async fn run_debit(
        &self,
        offer: &LoanOffer,
        loan: &Loan,
        txn: &LoanTransaction,
    ) -> Result<DebitOutcome, EngineError> {
        let amount = loan.outstanding();

        let request = DebitRequest {
            customer_id: offer.customer_id,
            loan_ref: loan.external_ref.clone(),
            transaction_id: txn.id,
            amount,
            take_available_balance: true,
        };

        let response = match self.gateway.debit(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %err,
                    "Debit call had no usable response; deferring to reconciliation"
                );
                self.defer_debit(txn.id);
                return Ok(DebitOutcome::Deferred);
            }
        };

        if response.is_success() {
            return self
                .settle_collection(offer, loan.clone(), txn.id, amount, &response)
                .await;
        }

        // Definitive decline on the full amount.
        self.ledger
            .record_failure(txn.id, &response.outcome())
            .await?;

        let deductible = match fallback_deductible(
            response.available_balance,
            self.policy.reserve_floor_minor,
            amount,
        ) {
            Some(deductible) => deductible,
            None => {
                tracing::info!(
                    offer_id = %offer.id,
                    code = %response.response_code,
                    balance = ?response.available_balance,
                    "Debit declined with no usable balance; abandoning until next sweep"
                );
                return Ok(DebitOutcome::Abandoned);
            }
        };

        // At most one fallback attempt, without the balance flag.
        let fallback_txn = self
            .ledger
            .create_transaction(loan.id, deductible, TransactionKind::Debit)
            .await?;

        let request = DebitRequest {
            customer_id: offer.customer_id,
            loan_ref: loan.external_ref.clone(),
            transaction_id: fallback_txn.id,
            amount: deductible,
            take_available_balance: false,
        };

        let response = match self.gateway.debit(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    transaction_id = %fallback_txn.id,
                    error = %err,
                    "Fallback debit had no usable response; deferring to reconciliation"
                );
                self.defer_debit(fallback_txn.id);
                return Ok(DebitOutcome::Deferred);
            }
        };

        if response.is_success() {
            self.settle_collection(offer, loan.clone(), fallback_txn.id, deductible, &response)
                .await
        } else {
            self.ledger
                .record_failure(fallback_txn.id, &response.outcome())
                .await?;
            tracing::info!(
                offer_id = %offer.id,
                code = %response.response_code,
                "Fallback debit declined; abandoning until next sweep"
            );
            Ok(DebitOutcome::Abandoned)
        }
    }

    /// Apply a confirmed deduction and run the closure check.
    async fn settle_collection(
        &self,
        offer: &LoanOffer,
        mut loan: Loan,
        txn_id: Uuid,
        amount: Minor,
        response: &GatewayResponse,
    ) -> Result<DebitOutcome, EngineError> {
        let deducted = loan.apply_debit(amount);
        self.ledger
            .settle_debit(&loan, txn_id, &response.outcome())
            .await?;

        tracing::info!(
            offer_id = %offer.id,
            deducted = deducted,
            outstanding = loan.outstanding(),
            "Debit applied"
        );

        if loan.is_fully_covered() {
            self.close_covered_loan(offer, &loan).await?;
            self.notify_offer(
                offer,
                notify::render_collected_full(&offer.currency, deducted),
            )
            .await;
            Ok(DebitOutcome::Collected {
                deducted,
                closed: true,
            })
        } else {
            self.notify_offer(
                offer,
                notify::render_collected_partial(&offer.currency, deducted, loan.outstanding()),
            )
            .await;
            Ok(DebitOutcome::Collected {
                deducted,
                closed: false,
            })
        }
    }

    /// Fully covered: provider status first, then offer + case closure.
    async fn close_covered_loan(&self, offer: &LoanOffer, loan: &Loan) -> Result<(), EngineError> {
        let loan_ref = provider_loan_ref(loan);
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

        tracing::info!(offer_id = %offer.id, loan_id = %loan.id, "Loan fully covered and closed");
        Ok(())
    }

    // ===== Refund =====

    /// Refund `amount` against a previously settled transaction. Settles on
    /// the gateway side only; loan balances are untouched.
    pub async fn refund_transaction(
        &self,
        transaction_id: Uuid,
        amount: Minor,
    ) -> Result<RefundOutcome, EngineError> {
        if amount <= 0 {
            return Err(EngineError::Invariant(
                "refund amount must be positive".to_string(),
            ));
        }

        let original = self
            .ledger
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("transaction {}", transaction_id)))?;

        let loan = self
            .ledger
            .loan(original.loan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan {}", original.loan_id)))?;

        let offer = self
            .ledger
            .offer(loan.offer_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("loan offer {}", loan.offer_id)))?;

        let txn = self
            .ledger
            .create_transaction(loan.id, amount, TransactionKind::Refund)
            .await?;

        let request = RefundRequest {
            customer_id: offer.customer_id,
            loan_ref: loan.external_ref.clone(),
            transaction_id: txn.id,
            amount,
        };

        let response = match self.gateway.refund(request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    transaction_id = %txn.id,
                    error = %err,
                    "Refund call had no usable response; deferring to reconciliation"
                );
                self.scheduler.schedule(
                    ReconcileTask::new(txn.id, ReconcileKind::Refund),
                    self.policy.debit_requery_delay,
                );
                return Ok(RefundOutcome::Deferred);
            }
        };

        if response.is_success() {
            self.ledger
                .record_outcome(txn.id, TransactionKind::Refund, &response.outcome())
                .await?;

            self.notify_offer(&offer, notify::render_refunded(&offer.currency, amount))
                .await;

            tracing::info!(transaction_id = %transaction_id, amount = amount, "Refund applied");
            Ok(RefundOutcome::Refunded)
        } else {
            self.ledger
                .record_failure(txn.id, &response.outcome())
                .await?;
            tracing::warn!(
                transaction_id = %transaction_id,
                code = %response.response_code,
                "Refund declined"
            );
            Ok(RefundOutcome::Declined {
                code: response.response_code,
            })
        }
    }

    fn defer_debit(&self, txn_id: Uuid) {
        self.scheduler.schedule(
            ReconcileTask::new(txn_id, ReconcileKind::Debit),
            self.policy.debit_requery_delay,
        );
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_deductible_worked_example() {
        // balance 120,000; reserve 100,000; owed 142,000 -> collect 20,000
        assert_eq!(
            fallback_deductible(Some(120_000), 100_000, 142_000),
            Some(20_000)
        );
    }

    #[test]
    fn test_fallback_deductible_capped_by_amount() {
        // Rich account, small debt: never take more than what is owed.
        assert_eq!(
            fallback_deductible(Some(1_000_000), 100_000, 30_000),
            Some(30_000)
        );
    }

    #[test]
    fn test_fallback_deductible_at_reserve() {
        // Balance at or below the reserve floor is unusable.
        assert_eq!(fallback_deductible(Some(100_000), 100_000, 50_000), None);
        assert_eq!(fallback_deductible(Some(99_999), 100_000, 50_000), None);
    }

    #[test]
    fn test_fallback_deductible_no_balance() {
        assert_eq!(fallback_deductible(None, 100_000, 50_000), None);
    }

    #[test]
    fn test_fallback_deductible_bound() {
        for balance in (0..500_000).step_by(17_321) {
            for amount in (1..400_000).step_by(23_459) {
                if let Some(d) = fallback_deductible(Some(balance), 100_000, amount) {
                    assert!(d <= balance - 100_000);
                    assert!(d <= amount);
                    assert!(d > 0);
                }
            }
        }
    }
}
