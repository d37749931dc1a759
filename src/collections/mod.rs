//! Overdue penalty accrual and collector case management.

pub mod service;

pub use service::{next_collector, CollectionsService, RoundRobin};
