//! HTTP handlers for the engine entry points.
//!
//! These are the calls schedules, admin actions and inbound gateway
//! webhooks land on. Webhook validation and routing happen upstream; only
//! the resulting orchestration call lives here.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::orchestrator::{CreditOutcome, DebitOutcome, RefundOutcome};
use crate::reconciliation::ReconcileKind;
use crate::state::AppState;

/// Standard response envelope
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match crate::db::check_health(&state.db).await {
        Ok(()) => "connected".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let status = if database == "connected" {
        "healthy"
    } else {
        "unhealthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        database,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Disburse an accepted loan offer
pub async fn credit_loan_offer(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<CreditOutcome>>> {
    let outcome = state.orchestrator.credit_loan_offer(offer_id).await?;
    Ok(ApiResponse::ok(outcome))
}

/// Collect an open or overdue loan offer
pub async fn debit_loan_offer(
    State(state): State<AppState>,
    Path(offer_id): Path<Uuid>,
) -> ApiResult<Json<ApiResponse<DebitOutcome>>> {
    let outcome = state.orchestrator.debit_loan_offer(offer_id).await?;
    Ok(ApiResponse::ok(outcome))
}

/// Refund request body
#[derive(Debug, Deserialize)]
pub struct RefundBody {
    /// Amount in minor units
    pub amount: i64,
}

impl RefundBody {
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= 0 {
            return Err("Amount must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Refund a settled transaction
pub async fn refund_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> ApiResult<Json<ApiResponse<RefundOutcome>>> {
    body.validate().map_err(ApiError::BadRequest)?;

    let outcome = state
        .orchestrator
        .refund_transaction(transaction_id, body.amount)
        .await?;
    Ok(ApiResponse::ok(outcome))
}

/// Reconcile request body
#[derive(Debug, Deserialize)]
pub struct ReconcileBody {
    pub kind: ReconcileKind,
}

/// Manually reconcile an ambiguous transaction
pub async fn reconcile_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    Json(body): Json<ReconcileBody>,
) -> ApiResult<Json<ApiResponse<()>>> {
    state
        .reconciliation
        .reconcile(transaction_id, body.kind)
        .await?;
    Ok(ApiResponse::ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refund_body_validation() {
        assert!(RefundBody { amount: 100 }.validate().is_ok());
        assert!(RefundBody { amount: 0 }.validate().is_err());
        assert!(RefundBody { amount: -5 }.validate().is_err());
    }

    #[test]
    fn test_reconcile_body_parses_kind() {
        let body: ReconcileBody = serde_json::from_str(r#"{"kind":"debit"}"#).unwrap();
        assert_eq!(body.kind, ReconcileKind::Debit);
    }
}
