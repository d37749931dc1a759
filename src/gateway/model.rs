//! Payment gateway wire types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::TransactionOutcome;
use crate::money::Minor;

/// The provider's success response code.
pub const SUCCESS_CODE: &str = "00";

/// Loan status values understood by the provider.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum GatewayLoanStatus {
    Open,
    Overdue,
    Closed,
}

/// A response carrying a provider response code. Transport failures never
/// produce this type; they surface as [`super::GatewayError`].
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub response_code: String,
    #[serde(default)]
    pub response_message: Option<String>,
    /// Provider transaction reference, globally unique when present.
    #[serde(default)]
    pub transaction_ref: Option<String>,
    #[serde(default)]
    pub payment_ref: Option<String>,
    /// Customer's available balance in minor units; returned on declined
    /// debits made in take-available-balance mode.
    #[serde(default)]
    pub available_balance: Option<Minor>,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
    }

    /// Convert to the outcome recorded on a ledger transaction.
    pub fn outcome(&self) -> TransactionOutcome {
        TransactionOutcome {
            code: self.response_code.clone(),
            message: self.response_message.clone(),
            reference: self.transaction_ref.clone(),
            payment_reference: self.payment_ref.clone(),
        }
    }
}

/// Disbursement request: fund the customer from the provider float.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CreditRequest {
    pub customer_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Minor,
    pub currency: String,
    pub destination_account: String,
    pub destination_bank: String,
}

/// Collection request against the customer's account.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DebitRequest {
    pub customer_id: Uuid,
    pub loan_ref: Option<String>,
    pub transaction_id: Uuid,
    pub amount: Minor,
    /// When set, a declined debit also reports the customer's available
    /// balance so the caller can attempt a partial collection.
    pub take_available_balance: bool,
}

/// Refund request against a prior settlement.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub customer_id: Uuid,
    pub loan_ref: Option<String>,
    pub transaction_id: Uuid,
    pub amount: Minor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_classification() {
        let resp: GatewayResponse = serde_json::from_str(
            r#"{"responseCode":"00","responseMessage":"Approved","transactionRef":"GW-1"}"#,
        )
        .unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.transaction_ref.as_deref(), Some("GW-1"));
        assert_eq!(resp.available_balance, None);
    }

    #[test]
    fn test_declined_with_balance() {
        let resp: GatewayResponse = serde_json::from_str(
            r#"{"responseCode":"51","responseMessage":"Insufficient funds","availableBalance":120000}"#,
        )
        .unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.available_balance, Some(120000));
    }

    #[test]
    fn test_outcome_conversion() {
        let resp: GatewayResponse = serde_json::from_str(
            r#"{"responseCode":"00","transactionRef":"GW-9","paymentRef":"PAY-9"}"#,
        )
        .unwrap();
        let outcome = resp.outcome();
        assert_eq!(outcome.code, "00");
        assert_eq!(outcome.reference.as_deref(), Some("GW-9"));
        assert_eq!(outcome.payment_reference.as_deref(), Some("PAY-9"));
    }
}
