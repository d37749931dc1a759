//! Koboloan backend library
//!
//! Loan lifecycle and payment reconciliation engine: disbursement,
//! scheduled collection, penalty accrual and reconciliation against an
//! unreliable payment gateway.

pub mod collections;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod money;
pub mod notify;
pub mod orchestrator;
pub mod reconciliation;
pub mod routes;
pub mod schedule;
pub mod state;
pub mod sweeps;
