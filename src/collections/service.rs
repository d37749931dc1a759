//! Overdue accrual, collector assignment and rotation.
//!
//! The accrual sweep is not on the reconciliation path: a failed gateway
//! status update here surfaces loudly and the offer is skipped until the
//! next sweep.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::Policy;
use crate::error::EngineError;
use crate::gateway::{Gateway, GatewayLoanStatus};
use crate::ledger::{Collector, LedgerService, LoanOffer, OfferStatus};
use crate::notify::{self, Notification, NotificationSink};

/// Explicit round-robin cursor, scoped to one sweep so concurrent sweeps
/// cannot interleave their counters.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next collector in order, wrapping at the end of the list.
    pub fn pick<'a>(&mut self, collectors: &'a [Collector]) -> Option<&'a Collector> {
        if collectors.is_empty() {
            return None;
        }
        let picked = &collectors[self.next % collectors.len()];
        self.next = (self.next + 1) % collectors.len();
        Some(picked)
    }
}

/// The collector after `current` in the ordered list, wrapping to the
/// first. `None` when `current` is no longer in the list - such cases are
/// deliberately left untouched.
pub fn next_collector(collectors: &[Collector], current: Uuid) -> Option<&Collector> {
    let position = collectors.iter().position(|c| c.id == current)?;
    Some(&collectors[(position + 1) % collectors.len()])
}

pub struct CollectionsService {
    ledger: LedgerService,
    gateway: Arc<dyn Gateway>,
    notifier: Arc<dyn NotificationSink>,
    policy: Policy,
}

impl CollectionsService {
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

    /// One overdue accrual sweep. Returns the number of offers accrued.
    pub async fn run_accrual_sweep(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let offers = self.ledger.offers_for_accrual(now).await?;
        let collectors = self.ledger.collectors_ordered().await?;
        let mut cursor = RoundRobin::new();
        let mut accrued = 0;

        for offer in offers {
            match self.accrue_offer(&offer, &collectors, &mut cursor, now).await {
                Ok(()) => accrued += 1,
                Err(err) => {
                    tracing::error!(
                        offer_id = %offer.id,
                        error = %err,
                        "Overdue accrual failed for offer; continuing sweep"
                    );
                }
            }
        }

        Ok(accrued)
    }

    async fn accrue_offer(
        &self,
        offer: &LoanOffer,
        collectors: &[Collector],
        cursor: &mut RoundRobin,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut loan = self
            .ledger
            .loan_for_offer(offer.id)
            .await?
            .ok_or_else(|| EngineError::Invariant(format!("offer {} has no loan", offer.id)))?;

        let added = offer.accrual_amount(loan.due_date, self.policy.penalty_grace_days, now);
        loan.accrue_penalty(added, offer.default_fee_addition_days as i64, now);

        if offer.status != OfferStatus::Overdue {
            let loan_ref = loan
                .external_ref
                .clone()
                .unwrap_or_else(|| loan.id.to_string());

            let response = self
                .gateway
                .update_status(&loan_ref, GatewayLoanStatus::Overdue)
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
        }

        // Assign only unattended offers; the cursor advances per assignment.
        let assign_to = if self.ledger.open_case_for_offer(offer.id).await?.is_none() {
            cursor.pick(collectors).map(|c| c.id)
        } else {
            None
        };

        self.ledger
            .apply_accrual(offer, &loan, assign_to, now)
            .await?;

        tracing::info!(
            offer_id = %offer.id,
            added_penalty = added,
            defaults = loan.defaults,
            assigned = ?assign_to,
            "Overdue accrual applied"
        );

        notify::send_best_effort(
            self.notifier.as_ref(),
            Notification {
                recipient: offer.customer_msisdn.clone(),
                body: notify::render_overdue(&offer.currency, loan.outstanding(), added),
                loan_offer_id: Some(offer.id),
                best_effort: true,
            },
        )
        .await;

        Ok(())
    }

    /// Rotate long-held open cases to the next collector in sequence.
    /// Returns the number of cases reassigned.
    pub async fn run_rotation_sweep(&self) -> Result<usize, EngineError> {
        let now = Utc::now();
        let cutoff = now - Duration::days(self.policy.rotation_age_days);
        let cases = self.ledger.open_cases_assigned_before(cutoff).await?;
        let collectors = self.ledger.collectors_ordered().await?;
        let mut rotated = 0;

        for case in cases {
            match next_collector(&collectors, case.assigned_to) {
                Some(next) => {
                    self.ledger.reassign_case(case.id, next.id, now).await?;
                    rotated += 1;
                    tracing::info!(
                        case_id = %case.id,
                        offer_id = %case.offer_id,
                        from = %case.assigned_to,
                        to = %next.id,
                        "Collection case rotated"
                    );
                }
                None => {
                    // Assigned collector left the roster; the case stays put.
                    tracing::debug!(
                        case_id = %case.id,
                        collector = %case.assigned_to,
                        "Assigned collector not in roster; case left unchanged"
                    );
                }
            }
        }

        Ok(rotated)
    }
}
