//! Shared fixtures for the integration tests: a scriptable gateway, a
//! recording notifier/scheduler, and database seeding helpers.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use koboloan_server::config::Policy;
use koboloan_server::gateway::{
    CreditRequest, DebitRequest, Gateway, GatewayError, GatewayLoanStatus, GatewayResponse,
    RefundRequest,
};
use koboloan_server::notify::{Notification, NotificationSink};
use koboloan_server::schedule::{ReconcileScheduler, ReconcileTask};

/// Build a successful gateway response with the given reference.
pub fn approved(reference: &str) -> GatewayResponse {
    serde_json::from_value(serde_json::json!({
        "responseCode": "00",
        "responseMessage": "Approved",
        "transactionRef": reference,
        "paymentRef": format!("PAY-{}", reference),
    }))
    .unwrap()
}

/// Build a declined response, optionally carrying an available balance.
pub fn declined(code: &str, balance: Option<i64>) -> GatewayResponse {
    serde_json::from_value(serde_json::json!({
        "responseCode": code,
        "responseMessage": "Declined",
        "availableBalance": balance,
    }))
    .unwrap()
}

/// Gateway double fed from per-method response queues. An empty queue
/// means the call was unexpected and fails the test loudly.
#[derive(Default)]
pub struct MockGateway {
    pub credit_responses: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    pub debit_responses: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    pub refund_responses: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    pub query_responses: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    pub status_updates: Mutex<Vec<(String, GatewayLoanStatus)>>,
    pub debit_requests: Mutex<Vec<DebitRequest>>,
}

impl MockGateway {
    pub fn push_debit(&self, response: Result<GatewayResponse, GatewayError>) {
        self.debit_responses.lock().unwrap().push_back(response);
    }

    pub fn push_credit(&self, response: Result<GatewayResponse, GatewayError>) {
        self.credit_responses.lock().unwrap().push_back(response);
    }

    pub fn push_refund(&self, response: Result<GatewayResponse, GatewayError>) {
        self.refund_responses.lock().unwrap().push_back(response);
    }

    pub fn push_query(&self, response: Result<GatewayResponse, GatewayError>) {
        self.query_responses.lock().unwrap().push_back(response);
    }

    fn pop(
        queue: &Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
        method: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected gateway {} call", method))
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn credit(&self, _request: CreditRequest) -> Result<GatewayResponse, GatewayError> {
        Self::pop(&self.credit_responses, "credit")
    }

    async fn debit(&self, request: DebitRequest) -> Result<GatewayResponse, GatewayError> {
        self.debit_requests.lock().unwrap().push(request);
        Self::pop(&self.debit_responses, "debit")
    }

    async fn refund(&self, _request: RefundRequest) -> Result<GatewayResponse, GatewayError> {
        Self::pop(&self.refund_responses, "refund")
    }

    async fn query(&self, _transaction_id: Uuid) -> Result<GatewayResponse, GatewayError> {
        Self::pop(&self.query_responses, "query")
    }

    async fn update_status(
        &self,
        loan_ref: &str,
        status: GatewayLoanStatus,
    ) -> Result<GatewayResponse, GatewayError> {
        self.status_updates
            .lock()
            .unwrap()
            .push((loan_ref.to_string(), status));
        Ok(approved(&format!("STATUS-{}", loan_ref)))
    }
}

/// Notification sink that records instead of delivering.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn dispatch(&self, note: Notification) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(note);
        Ok(())
    }
}

/// Scheduler that records instead of sleeping.
#[derive(Default)]
pub struct RecordingScheduler {
    pub tasks: Mutex<Vec<(ReconcileTask, Duration)>>,
}

impl ReconcileScheduler for RecordingScheduler {
    fn schedule(&self, task: ReconcileTask, delay: Duration) {
        self.tasks.lock().unwrap().push((task, delay));
    }
}

/// Policy with the default production constants, short enough for tests.
pub fn test_policy() -> Policy {
    Policy {
        reserve_floor_minor: 100_000,
        debit_requery_delay: Duration::from_secs(300),
        credit_requery_delay: Duration::from_secs(7200),
        requery_age_hours: 2,
        penalty_grace_days: 30,
        rotation_age_days: 7,
        reconcile_max_attempts: 3,
    }
}

/// Connect to the test database and ensure the schema is current.
pub async fn setup_test_db() -> PgPool {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/koboloan_test".to_string());

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Sweep-driven tests scan whole tables; start each test from empty so
    // rows seeded by another test are never swept up.
    sqlx::query(
        "TRUNCATE notifications, collection_cases, collectors, loan_transactions, loans, loan_offers",
    )
    .execute(&pool)
    .await
    .expect("Failed to reset test tables");

    pool
}

/// Insert a loan offer in the given status; returns its id.
pub async fn seed_offer(pool: &PgPool, status: &str, principal: i64) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO loan_offers (
            id, customer_id, customer_msisdn, principal_amount, currency,
            tenure_days, default_interest_bps, default_fee_addition_days, status
        )
        VALUES ($1, $2, $3, $4, 'NGN', 14, 250, 3, $5::offer_status)
        "#,
    )
    .bind(id)
    .bind(Uuid::new_v4())
    .bind("+2348012345678")
    .bind(principal)
    .bind(status)
    .execute(pool)
    .await
    .expect("Failed to seed loan offer");
    id
}

/// Insert the loan backing an offer; returns its id.
pub async fn seed_loan(
    pool: &PgPool,
    offer_id: Uuid,
    amount_remaining: i64,
    penalty_remaining: i64,
    due_date: DateTime<Utc>,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO loans (
            id, offer_id, principal_amount, amount_payable, amount_remaining,
            penalty, penalty_remaining, due_date, destination_account, destination_bank
        )
        VALUES ($1, $2, $3, $4, $5, $6, $6, $7, '0123456789', '044')
        "#,
    )
    .bind(id)
    .bind(offer_id)
    .bind(amount_remaining)
    .bind(amount_remaining)
    .bind(amount_remaining)
    .bind(penalty_remaining)
    .bind(due_date)
    .execute(pool)
    .await
    .expect("Failed to seed loan");
    id
}

/// Insert a collector; returns its id.
pub async fn seed_collector(pool: &PgPool, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO collectors (id, name, msisdn) VALUES ($1, $2, '+2348000000000')")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .expect("Failed to seed collector");
    id
}
