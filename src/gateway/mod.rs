//! Payment gateway client boundary.
//!
//! The engine consumes the provider through the [`Gateway`] trait so the
//! orchestration and reconciliation paths can be exercised against a mock.
//! Transport failures are a distinct signal from application-level
//! declines: a decline is an answer, a transport failure is the absence of
//! one.

pub mod client;
pub mod model;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use client::HttpGateway;
pub use model::{
    CreditRequest, DebitRequest, GatewayLoanStatus, GatewayResponse, RefundRequest, SUCCESS_CODE,
};

/// Gateway call failures that carry no provider outcome.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Timeout, connect failure, or an uninterpretable response body.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Authentication failed; the dependent call never happened.
    #[error("authentication failure: {0}")]
    Auth(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Remote payment provider operations consumed by the core.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Disburse funds to the customer.
    async fn credit(&self, request: CreditRequest) -> Result<GatewayResponse, GatewayError>;

    /// Collect funds from the customer.
    async fn debit(&self, request: DebitRequest) -> Result<GatewayResponse, GatewayError>;

    /// Refund a prior settlement.
    async fn refund(&self, request: RefundRequest) -> Result<GatewayResponse, GatewayError>;

    /// Idempotent status lookup for a previously submitted transaction.
    async fn query(&self, transaction_id: Uuid) -> Result<GatewayResponse, GatewayError>;

    /// Update the provider-side loan status.
    async fn update_status(
        &self,
        loan_ref: &str,
        status: GatewayLoanStatus,
    ) -> Result<GatewayResponse, GatewayError>;
}
