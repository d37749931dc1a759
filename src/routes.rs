//! Route definitions for the engine entry points.

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

pub fn engine_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/loan-offers/:id/credit",
            post(handlers::credit_loan_offer),
        )
        .route(
            "/api/loan-offers/:id/debit",
            post(handlers::debit_loan_offer),
        )
        .route(
            "/api/transactions/:id/refund",
            post(handlers::refund_transaction),
        )
        .route(
            "/api/transactions/:id/reconcile",
            post(handlers::reconcile_transaction),
        )
}
