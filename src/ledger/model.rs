//! Loan ledger models and data structures.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::{deduct_clamped, Minor};

/// Loan offer status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "offer_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    None,
    Pending,
    Accepted,
    Open,
    Overdue,
    Closed,
    Failed,
}

/// Kind of money movement recorded on a transaction. `None` means the
/// gateway never confirmed an applied movement (pending or failed).
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    None,
    Credit,
    Debit,
    Refund,
    Payment,
    Manual,
}

/// Collection case status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "case_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Open,
    Closed,
}

/// A loan offer extended to a customer; one per collection cycle.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanOffer {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub customer_msisdn: String,
    pub principal_amount: Minor,
    pub currency: String,
    pub tenure_days: i32,
    pub default_interest_bps: i32,
    pub default_fee_addition_days: i32,
    pub status: OfferStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_requeried_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanOffer {
    /// Penalty accrued by one overdue sweep iteration: zero once the grace
    /// cutoff has passed, otherwise the default interest on the principal,
    /// floored by integer division.
    pub fn accrual_amount(&self, due_date: DateTime<Utc>, grace_days: i64, now: DateTime<Utc>) -> Minor {
        if due_date + Duration::days(grace_days) < now {
            0
        } else {
            self.principal_amount * self.default_interest_bps as i64 / 10_000
        }
    }
}

/// The disbursed instrument tied to one loan offer.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Loan {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub principal_amount: Minor,
    pub amount_payable: Minor,
    pub amount_remaining: Minor,
    pub penalty: Minor,
    pub penalty_remaining: Minor,
    pub due_date: DateTime<Utc>,
    pub next_due_date: Option<DateTime<Utc>>,
    pub defaults: i32,
    pub destination_account: String,
    pub destination_bank: String,
    pub external_ref: Option<String>,
    /// Optimistic-concurrency version; bumped on every balance mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Loan {
    /// Combined outstanding balance.
    pub fn outstanding(&self) -> Minor {
        self.amount_remaining + self.penalty_remaining
    }

    /// A loan is fully covered iff both remaining balances are zero.
    pub fn is_fully_covered(&self) -> bool {
        self.amount_remaining == 0 && self.penalty_remaining == 0
    }

    /// Open the loan after a confirmed disbursement: the full payable
    /// amount becomes outstanding.
    pub fn apply_credit(&mut self) {
        self.amount_remaining = self.amount_payable;
    }

    /// Apply a collected amount: principal first, then penalty, both
    /// clamped at zero. Returns the amount actually absorbed.
    pub fn apply_debit(&mut self, amount: Minor) -> Minor {
        let (remaining, absorbed) = deduct_clamped(self.amount_remaining, amount);
        self.amount_remaining = remaining;

        let (penalty_remaining, penalty_absorbed) =
            deduct_clamped(self.penalty_remaining, amount - absorbed);
        self.penalty_remaining = penalty_remaining;

        absorbed + penalty_absorbed
    }

    /// Accrue an overdue penalty and push out the next accrual date.
    pub fn accrue_penalty(&mut self, added: Minor, fee_addition_days: i64, now: DateTime<Utc>) {
        self.penalty += added;
        self.penalty_remaining += added;
        self.defaults += 1;
        self.next_due_date = Some(now + Duration::days(fee_addition_days));
    }
}

/// An attempted money movement against a loan. Created before the gateway
/// call, stamped exactly once with the final outcome, never deleted.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct LoanTransaction {
    pub id: Uuid,
    pub loan_id: Uuid,
    pub amount: Minor,
    pub kind: TransactionKind,
    pub intent: TransactionKind,
    pub gateway_code: Option<String>,
    pub gateway_message: Option<String>,
    pub gateway_ref: Option<String>,
    pub gateway_payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoanTransaction {
    /// True once a gateway outcome has been recorded.
    pub fn is_finalized(&self) -> bool {
        self.gateway_code.is_some()
    }
}

/// A debt collector who can be assigned overdue cases.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Collector {
    pub id: Uuid,
    pub name: String,
    pub msisdn: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A collector's assignment to an overdue loan offer.
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct CollectionCase {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub assigned_to: Uuid,
    pub status: CaseStatus,
    pub assigned_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
