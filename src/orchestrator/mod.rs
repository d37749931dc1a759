//! Transaction orchestration around gateway credit/debit/refund calls.

pub mod service;

pub use service::{
    fallback_deductible, CreditOutcome, DebitOutcome, OrchestratorService, RefundOutcome,
};
