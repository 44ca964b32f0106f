use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{
    AccessToken, ChargeRequest, ChargeSession, ChargeStatus, ChargeVerification, PaymentProvider,
    ProviderBalance, ProviderError, ProviderResult, RefundReceipt, RefundRequest, RefundStatus,
    TransferReceipt, TransferRequest, TransferStatus,
};
use crate::config::ProviderConfig;

/// Tokens are refreshed this long before the provider says they expire.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

/// Standard provider response wrapper.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: Option<String>,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    id: Option<serde_json::Value>,
    status: String,
    reference: String,
    amount: BigDecimal,
    paid_at: Option<DateTime<Utc>>,
    gateway_response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    reference: String,
    transfer_code: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    currency: String,
    balance: BigDecimal,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    reference: Option<String>,
    status: String,
}

/// Provider-assigned ids arrive as numbers or strings.
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

fn charge_status(raw: &str) -> ChargeStatus {
    match raw {
        "success" => ChargeStatus::Success,
        "failed" | "reversed" => ChargeStatus::Failed,
        "abandoned" => ChargeStatus::Abandoned,
        _ => ChargeStatus::Pending,
    }
}

fn transfer_status(raw: &str) -> TransferStatus {
    match raw {
        "success" => TransferStatus::Success,
        "otp" => TransferStatus::OtpRequired,
        "failed" | "abandoned" | "rejected" => TransferStatus::Failed,
        "reversed" => TransferStatus::Reversed,
        _ => TransferStatus::Pending,
    }
}

fn refund_status(raw: &str) -> RefundStatus {
    match raw {
        "processed" => RefundStatus::Processed,
        "failed" => RefundStatus::Failed,
        _ => RefundStatus::Pending,
    }
}

/// Unwraps the envelope. 5xx is transient, 4xx or `status: false` is a
/// rejection, and an unreadable 2xx leaves the outcome unknown.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> ProviderResult<T> {
    let status = response.status();
    if status.is_server_error() {
        return Err(ProviderError::Unavailable(format!("provider returned {}", status)));
    }

    let body = response.text().await.map_err(transport_error)?;
    let envelope = serde_json::from_str::<Envelope<T>>(&body);

    if status.is_client_error() {
        let message = match serde_json::from_str::<Envelope<serde_json::Value>>(&body) {
            Ok(envelope) if !envelope.message.is_empty() => envelope.message,
            _ => status.to_string(),
        };
        return Err(ProviderError::Rejected(message));
    }

    let envelope = envelope.map_err(|e| {
        ProviderError::Timeout(format!("unreadable provider response: {}", e))
    })?;
    if !envelope.status {
        return Err(ProviderError::Rejected(envelope.message));
    }
    envelope
        .data
        .ok_or_else(|| ProviderError::Rejected("response carried no data".to_string()))
}

/// HTTP client for the payment provider, behind a circuit breaker.
#[derive(Clone)]
pub struct HttpProvider {
    client: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Arc<ArcSwapOption<AccessToken>>,
    circuit_breaker: Breaker,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(config.circuit_reset, config.circuit_reset * 2);
        let policy = failure_policy::consecutive_failures(config.circuit_failures, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HttpProvider {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id.clone(),
            client_secret: config.secret_key.clone(),
            token: Arc::new(ArcSwapOption::empty()),
            circuit_breaker,
        }
    }

    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Cached token, refreshed when it is about to expire.
    async fn access_token(&self) -> ProviderResult<Arc<AccessToken>> {
        let margin = ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS);
        if let Some(token) = self.token.load_full() {
            if token.expires_at - margin > Utc::now() {
                return Ok(token);
            }
        }

        let fresh = Arc::new(self.authenticate().await.map_err(|e| {
            tracing::warn!(error = %e, "Provider token refresh failed");
            ProviderError::Unavailable(format!("token refresh failed: {}", e))
        })?);
        self.token.store(Some(fresh.clone()));
        Ok(fresh)
    }

    async fn call<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        bearer: Option<String>,
    ) -> ProviderResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = self.endpoint(path);
        let client = self.client.clone();
        let token_cache = self.token.clone();

        let result = self
            .circuit_breaker
            .call_with(
                |e: &ProviderError| e.is_transient(),
                async move {
                    let mut request = client.request(method, &url);
                    if let Some(bearer) = bearer {
                        request = request.bearer_auth(bearer);
                    }
                    if let Some(body) = body {
                        request = request.json(&body);
                    }

                    let response = request.send().await.map_err(transport_error)?;
                    if response.status() == StatusCode::UNAUTHORIZED {
                        token_cache.store(None);
                        return Err(ProviderError::Unavailable(
                            "access token rejected".to_string(),
                        ));
                    }
                    decode::<T>(response).await
                },
            )
            .await;

        match result {
            Ok(data) => Ok(data),
            Err(FailsafeError::Rejected) => Err(ProviderError::Unavailable(
                "provider circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    async fn authorized<T>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProviderResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let token = self.access_token().await?;
        self.call(method, path, body, Some(token.token.clone())).await
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ProviderResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ProviderError::Rejected(e.to_string()))
}

#[async_trait]
impl PaymentProvider for HttpProvider {
    async fn authenticate(&self) -> ProviderResult<AccessToken> {
        let body = json!({
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        });
        let data: TokenData = self.call(Method::POST, "/auth/token", Some(body), None).await?;

        Ok(AccessToken {
            token: data.access_token,
            expires_at: Utc::now() + ChronoDuration::seconds(data.expires_in),
        })
    }

    async fn initialize_charge(&self, request: &ChargeRequest) -> ProviderResult<ChargeSession> {
        let data: InitializeData = self
            .authorized(Method::POST, "/transaction/initialize", Some(to_json(request)?))
            .await?;

        Ok(ChargeSession {
            authorization_url: data.authorization_url,
            access_code: data.access_code,
            reference: data.reference,
        })
    }

    async fn verify_charge(&self, reference: &str) -> ProviderResult<ChargeVerification> {
        let path = format!("/transaction/verify/{}", reference);
        let data: VerifyData = self.authorized(Method::GET, &path, None).await?;

        Ok(ChargeVerification {
            provider_id: data.id.as_ref().and_then(id_to_string),
            status: charge_status(&data.status),
            reference: data.reference,
            amount: data.amount,
            paid_at: data.paid_at,
            gateway_response: data.gateway_response,
        })
    }

    async fn initiate_transfer(&self, request: &TransferRequest) -> ProviderResult<TransferReceipt> {
        let data: TransferData = self
            .authorized(Method::POST, "/transfer", Some(to_json(request)?))
            .await?;

        Ok(TransferReceipt {
            status: transfer_status(&data.status),
            reference: data.reference,
            transfer_code: data.transfer_code,
            message: None,
        })
    }

    async fn validate_transfer_otp(
        &self,
        transfer_code: &str,
        otp: &str,
    ) -> ProviderResult<TransferReceipt> {
        let body = json!({ "transfer_code": transfer_code, "otp": otp });
        let data: TransferData = self
            .authorized(Method::POST, "/transfer/finalize_transfer", Some(body))
            .await?;

        Ok(TransferReceipt {
            status: transfer_status(&data.status),
            reference: data.reference,
            transfer_code: data.transfer_code.or_else(|| Some(transfer_code.to_string())),
            message: None,
        })
    }

    async fn query_balance(&self) -> ProviderResult<Vec<ProviderBalance>> {
        let data: Vec<BalanceData> = self.authorized(Method::GET, "/balance", None).await?;

        Ok(data
            .into_iter()
            .map(|b| ProviderBalance {
                currency: b.currency,
                balance: b.balance,
            })
            .collect())
    }

    async fn initiate_refund(&self, request: &RefundRequest) -> ProviderResult<RefundReceipt> {
        let data: RefundData = self
            .authorized(Method::POST, "/refund", Some(to_json(request)?))
            .await?;

        Ok(RefundReceipt {
            reference: data.reference.unwrap_or_else(|| request.reference.clone()),
            status: refund_status(&data.status),
        })
    }
}
