//! Periodic sweep loops.
//!
//! Each sweep enumerates its candidates and processes offers sequentially;
//! a failure on one offer is logged and never aborts the batch. Loops run
//! on independent Tokio tasks with a shared interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::collections::CollectionsService;
use crate::error::EngineError;
use crate::ledger::LedgerService;
use crate::orchestrator::OrchestratorService;
use crate::reconciliation::ReconciliationService;

/// Everything the sweep loops need.
#[derive(Clone)]
pub struct SweepContext {
    pub ledger: LedgerService,
    pub orchestrator: Arc<OrchestratorService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub collections: Arc<CollectionsService>,
}

/// Spawn all engine sweeps on background tasks.
pub fn spawn_all(ctx: SweepContext, interval: Duration) {
    tokio::spawn(sweep_loop("credit-accepted", ctx.clone(), interval, |ctx| {
        Box::pin(run_credit_accepted(ctx))
    }));
    tokio::spawn(sweep_loop("debit-due", ctx.clone(), interval, |ctx| {
        Box::pin(run_debit_due(ctx))
    }));
    tokio::spawn(sweep_loop("debit-overdue", ctx.clone(), interval, |ctx| {
        Box::pin(run_debit_overdue(ctx))
    }));
    tokio::spawn(sweep_loop("overdue-accrual", ctx.clone(), interval, |ctx| {
        Box::pin(run_accrual(ctx))
    }));
    tokio::spawn(sweep_loop("requery", ctx.clone(), interval, |ctx| {
        Box::pin(run_requery(ctx))
    }));
    tokio::spawn(sweep_loop("unresolved-requery", ctx.clone(), interval, |ctx| {
        Box::pin(run_unresolved_requery(ctx))
    }));
    tokio::spawn(sweep_loop("rotation", ctx, interval, |ctx| {
        Box::pin(run_rotation(ctx))
    }));
}

type SweepFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>>;

async fn sweep_loop<F>(name: &'static str, ctx: SweepContext, interval: Duration, run: F)
where
    F: for<'a> Fn(&'a SweepContext) -> SweepFuture<'a>,
{
    tracing::info!(sweep = name, interval_secs = interval.as_secs(), "Sweep started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(err) = run(&ctx).await {
            tracing::error!(sweep = name, error = %err, "Sweep iteration failed");
        }
    }
}

/// Disburse every ACCEPTED offer.
async fn run_credit_accepted(ctx: &SweepContext) -> Result<(), EngineError> {
    for offer in ctx.ledger.offers_accepted().await? {
        match ctx.orchestrator.credit_loan_offer(offer.id).await {
            Ok(outcome) => {
                tracing::debug!(offer_id = %offer.id, outcome = ?outcome, "Credit sweep processed offer")
            }
            // Invariant rejections (e.g. another running loan) just skip.
            Err(EngineError::Invariant(reason)) => {
                tracing::debug!(offer_id = %offer.id, reason = %reason, "Credit sweep skipped offer")
            }
            Err(err) => {
                tracing::error!(offer_id = %offer.id, error = %err, "Credit sweep failed for offer")
            }
        }
    }
    Ok(())
}

/// Collect OPEN offers whose loan is due.
async fn run_debit_due(ctx: &SweepContext) -> Result<(), EngineError> {
    for offer in ctx.ledger.offers_due_for_debit(Utc::now()).await? {
        debit_one(ctx, offer.id).await;
    }
    Ok(())
}

/// Collect OVERDUE offers with anything outstanding.
async fn run_debit_overdue(ctx: &SweepContext) -> Result<(), EngineError> {
    for offer in ctx.ledger.offers_overdue_for_debit().await? {
        debit_one(ctx, offer.id).await;
    }
    Ok(())
}

async fn debit_one(ctx: &SweepContext, offer_id: uuid::Uuid) {
    match ctx.orchestrator.debit_loan_offer(offer_id).await {
        Ok(outcome) => {
            tracing::debug!(offer_id = %offer_id, outcome = ?outcome, "Debit sweep processed offer")
        }
        Err(EngineError::Invariant(reason)) => {
            tracing::debug!(offer_id = %offer_id, reason = %reason, "Debit sweep skipped offer")
        }
        Err(err) => {
            tracing::error!(offer_id = %offer_id, error = %err, "Debit sweep failed for offer")
        }
    }
}

async fn run_accrual(ctx: &SweepContext) -> Result<(), EngineError> {
    let accrued = ctx.collections.run_accrual_sweep().await?;
    if accrued > 0 {
        tracing::info!(accrued = accrued, "Overdue accrual sweep finished");
    }
    Ok(())
}

async fn run_requery(ctx: &SweepContext) -> Result<(), EngineError> {
    let examined = ctx.reconciliation.requery_stale_offers().await?;
    if examined > 0 {
        tracing::info!(examined = examined, "Stale offer requery sweep finished");
    }
    Ok(())
}

/// Recover reconciliations a previous process scheduled but never ran.
async fn run_unresolved_requery(ctx: &SweepContext) -> Result<(), EngineError> {
    let examined = ctx.reconciliation.requery_unresolved().await?;
    if examined > 0 {
        tracing::info!(examined = examined, "Unresolved transaction requery finished");
    }
    Ok(())
}

async fn run_rotation(ctx: &SweepContext) -> Result<(), EngineError> {
    let rotated = ctx.collections.run_rotation_sweep().await?;
    if rotated > 0 {
        tracing::info!(rotated = rotated, "Collector rotation sweep finished");
    }
    Ok(())
}
