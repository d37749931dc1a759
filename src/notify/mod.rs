//! Customer notification dispatch.
//!
//! The engine hands rendered messages to a [`NotificationSink`]; the
//! production sink writes an outbox row that the SMS delivery pipeline
//! (out of scope here) drains. Minor-to-major conversion happens in the
//! rendering functions and nowhere else.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::money::{format_major, Minor};

/// A rendered message awaiting dispatch.
#[derive(Debug, Clone)]
pub struct Notification {
    pub recipient: String,
    pub body: String,
    pub loan_offer_id: Option<Uuid>,
    /// Best-effort messages never fail the money path.
    pub best_effort: bool,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn dispatch(&self, note: Notification) -> anyhow::Result<()>;
}

/// Outbox sink: persist the message for the delivery pipeline.
pub struct OutboxNotifier {
    pool: PgPool,
}

impl OutboxNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for OutboxNotifier {
    async fn dispatch(&self, note: Notification) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient, body, loan_offer_id, best_effort, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&note.recipient)
        .bind(&note.body)
        .bind(note.loan_offer_id)
        .bind(note.best_effort)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            recipient = %note.recipient,
            loan_offer_id = ?note.loan_offer_id,
            "Notification queued"
        );

        Ok(())
    }
}

/// Dispatch a best-effort notification, logging failures instead of
/// propagating them.
pub async fn send_best_effort(sink: &dyn NotificationSink, note: Notification) {
    let recipient = note.recipient.clone();
    if let Err(e) = sink.dispatch(note).await {
        tracing::warn!(recipient = %recipient, error = %e, "Notification dispatch failed");
    }
}

// ===== Message rendering =====

pub fn render_disbursed(currency: &str, amount: Minor) -> String {
    format!(
        "Your loan of {} {} has been disbursed to your account.",
        currency,
        format_major(amount)
    )
}

pub fn render_disbursement_failed(currency: &str, amount: Minor) -> String {
    format!(
        "We could not disburse your loan of {} {}. Our team will retry shortly.",
        currency,
        format_major(amount)
    )
}

pub fn render_collected_full(currency: &str, amount: Minor) -> String {
    format!(
        "Payment of {} {} received. Your loan is fully repaid. Thank you.",
        currency,
        format_major(amount)
    )
}

pub fn render_collected_partial(currency: &str, deducted: Minor, outstanding: Minor) -> String {
    format!(
        "Partial payment of {} {} received. Outstanding balance: {} {}.",
        currency,
        format_major(deducted),
        currency,
        format_major(outstanding)
    )
}

pub fn render_overdue(currency: &str, outstanding: Minor, added_penalty: Minor) -> String {
    format!(
        "Your loan is overdue. A late fee of {} {} has been added. Total due: {} {}.",
        currency,
        format_major(added_penalty),
        currency,
        format_major(outstanding)
    )
}

pub fn render_refunded(currency: &str, amount: Minor) -> String {
    format!(
        "A refund of {} {} has been processed to your account.",
        currency,
        format_major(amount)
    )
}
