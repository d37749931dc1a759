//! Loan ledger: data model and balance-mutation primitives.

pub mod model;
pub mod service;

pub use model::{
    CaseStatus, CollectionCase, Collector, Loan, LoanOffer, LoanTransaction, OfferStatus,
    TransactionKind,
};
pub use service::{LedgerService, TransactionOutcome};
