//! HTTP gateway client.
//!
//! Wraps the provider's REST API behind the [`Gateway`] trait. The bearer
//! token from `authenticate` is cached with a TTL and shared read-only
//! across concurrent callers; any call finding the cache expired refreshes
//! it before proceeding.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::model::{
    CreditRequest, DebitRequest, GatewayLoanStatus, GatewayResponse, RefundRequest,
};
use super::{Gateway, GatewayError};

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateBody {
    status: GatewayLoanStatus,
}

/// Reqwest-backed gateway client.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token_ttl: Duration,
    token: RwLock<Option<CachedToken>>,
}

impl HttpGateway {
    pub fn new(
        base_url: String,
        client_id: String,
        client_secret: String,
        token_ttl_seconds: i64,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            client_id,
            client_secret,
            token_ttl: Duration::seconds(token_ttl_seconds),
            token: RwLock::new(None),
        })
    }

    /// Return a valid bearer token, refreshing the cache when expired.
    async fn token(&self) -> Result<String, GatewayError> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut cached = self.token.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let token = self.authenticate().await?;
        *cached = Some(CachedToken {
            value: token.clone(),
            expires_at: Utc::now() + self.token_ttl,
        });

        tracing::debug!("Gateway token refreshed");
        Ok(token)
    }

    async fn authenticate(&self) -> Result<String, GatewayError> {
        let response = self
            .http
            .post(format!("{}/auth/token", self.base_url))
            .json(&TokenRequest {
                client_id: &self.client_id,
                client_secret: &self.client_secret,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayError::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;

        Ok(body.access_token)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<GatewayResponse, GatewayError> {
        let token = self.token().await?;

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        // Declines come back with a response code in the body; only a body
        // we cannot interpret counts as transport failure.
        response
            .json::<GatewayResponse>()
            .await
            .map_err(|e| GatewayError::Transport(format!("uninterpretable response: {}", e)))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn credit(&self, request: CreditRequest) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!(
            transaction_id = %request.transaction_id,
            amount = request.amount,
            "Gateway credit call"
        );
        self.post_json("/transfers/credit", &request).await
    }

    async fn debit(&self, request: DebitRequest) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!(
            transaction_id = %request.transaction_id,
            amount = request.amount,
            take_available_balance = request.take_available_balance,
            "Gateway debit call"
        );
        self.post_json("/transfers/debit", &request).await
    }

    async fn refund(&self, request: RefundRequest) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!(
            transaction_id = %request.transaction_id,
            amount = request.amount,
            "Gateway refund call"
        );
        self.post_json("/transfers/refund", &request).await
    }

    async fn query(&self, transaction_id: Uuid) -> Result<GatewayResponse, GatewayError> {
        let token = self.token().await?;

        let response = self
            .http
            .get(format!("{}/transactions/{}", self.base_url, transaction_id))
            .bearer_auth(token)
            .send()
            .await?;

        response
            .json::<GatewayResponse>()
            .await
            .map_err(|e| GatewayError::Transport(format!("uninterpretable response: {}", e)))
    }

    async fn update_status(
        &self,
        loan_ref: &str,
        status: GatewayLoanStatus,
    ) -> Result<GatewayResponse, GatewayError> {
        tracing::debug!(loan_ref = %loan_ref, status = ?status, "Gateway status update");
        self.post_json(
            &format!("/loans/{}/status", loan_ref),
            &StatusUpdateBody { status },
        )
        .await
    }
}
