//! Asynchronous reconciliation of ambiguous gateway calls.

pub mod service;

pub use service::{ReconcileKind, ReconciliationService};
