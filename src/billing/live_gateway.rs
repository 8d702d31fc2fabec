//! Live payment gateway client.
//!
//! Production client for a Razorpay-style REST gateway with secure key
//! handling, bounded timeouts, retry on transient failures, and error
//! mapping into [`BillingError`].

use crate::error::Result;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

use super::error::BillingError;
use super::gateway::{
    BillingGateway, CreatePlanRequest, CreateSubscriptionRequest, GatewayPlan, GatewaySubscription,
};

/// Configuration for the live gateway client.
#[derive(Debug, Clone)]
pub struct LiveGatewayConfig {
    /// Base URL of the gateway REST API.
    pub base_url: String,
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.razorpay.com/v1".to_string(),
            max_retries: 3,
            base_delay_ms: 500,
            timeout_seconds: 10,
        }
    }
}

impl LiveGatewayConfig {
    /// Create a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gateway base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay for exponential backoff.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set request timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Error returned when gateway key validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidGatewayKeyError {
    /// Description of why the key is invalid.
    pub reason: String,
}

impl std::fmt::Display for InvalidGatewayKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid gateway key: {}", self.reason)
    }
}

impl std::error::Error for InvalidGatewayKeyError {}

/// Validate a gateway key id format.
///
/// Valid formats:
/// - `rzp_test_*` - Test mode key
/// - `rzp_live_*` - Live mode key
fn validate_key_id(key: &str) -> std::result::Result<(), InvalidGatewayKeyError> {
    const MIN_KEY_LENGTH: usize = 14;

    if key.is_empty() {
        return Err(InvalidGatewayKeyError {
            reason: "key id cannot be empty".to_string(),
        });
    }

    if key.len() < MIN_KEY_LENGTH {
        return Err(InvalidGatewayKeyError {
            reason: format!("key id too short (minimum {} characters)", MIN_KEY_LENGTH),
        });
    }

    if !key.starts_with("rzp_test_") && !key.starts_with("rzp_live_") {
        return Err(InvalidGatewayKeyError {
            reason: "key id must start with rzp_test_ or rzp_live_".to_string(),
        });
    }

    Ok(())
}

/// Live gateway client for production use.
///
/// The key secret is held in a `SecretString` and never appears in debug
/// output. Requests authenticate with HTTP basic auth (key id / key secret)
/// as the gateway expects.
#[derive(Clone)]
pub struct LiveGateway {
    http: reqwest::Client,
    config: LiveGatewayConfig,
    key_id: String,
    key_secret: SecretString,
}

impl LiveGateway {
    /// Create a new live gateway client.
    ///
    /// # Errors
    ///
    /// Returns an error if the key id format is invalid or the HTTP client
    /// cannot be constructed.
    pub fn new(
        key_id: impl Into<String>,
        key_secret: impl Into<SecretString>,
        config: LiveGatewayConfig,
    ) -> std::result::Result<Self, InvalidGatewayKeyError> {
        let key_id = key_id.into();
        validate_key_id(&key_id)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| InvalidGatewayKeyError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            key_id,
            key_secret: key_secret.into(),
        })
    }

    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the key id format is invalid.
    pub fn with_default_config(
        key_id: impl Into<String>,
        key_secret: impl Into<SecretString>,
    ) -> std::result::Result<Self, InvalidGatewayKeyError> {
        Self::new(key_id, key_secret, LiveGatewayConfig::default())
    }

    /// Check if the client is using a test mode key.
    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.key_id.starts_with("rzp_test_")
    }

    /// Get the configured timeout duration.
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Issue a request with retry on 429/5xx and timeouts, then decode the
    /// JSON body.
    async fn execute<T, F>(&self, operation: &str, build: F) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempts = 0;

        loop {
            let request = build()
                .basic_auth(&self.key_id, Some(self.key_secret.expose_secret()))
                .send()
                .await;

            match request {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            BillingError::GatewayApi {
                                operation: operation.to_string(),
                                message: format!("failed to decode response: {e}"),
                                http_status: Some(status.as_u16()),
                            }
                            .into()
                        });
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempts >= self.config.max_retries {
                        let message = response
                            .json::<GatewayErrorBody>()
                            .await
                            .ok()
                            .and_then(|b| b.error.map(|e| e.description))
                            .unwrap_or_else(|| status.to_string());
                        return Err(BillingError::GatewayApi {
                            operation: operation.to_string(),
                            message,
                            http_status: Some(status.as_u16()),
                        }
                        .into());
                    }

                    tracing::warn!(
                        target: "countdeck::billing::gateway",
                        operation = operation,
                        attempt = attempts + 1,
                        status = status.as_u16(),
                        "Retrying gateway call after transient error"
                    );
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    if !retryable || attempts >= self.config.max_retries {
                        return Err(BillingError::GatewayApi {
                            operation: operation.to_string(),
                            message: e.to_string(),
                            http_status: e.status().map(|s| s.as_u16()),
                        }
                        .into());
                    }

                    tracing::warn!(
                        target: "countdeck::billing::gateway",
                        operation = operation,
                        attempt = attempts + 1,
                        error = %e,
                        "Retrying gateway call after transport error"
                    );
                }
            }

            let delay = self
                .config
                .base_delay_ms
                .saturating_mul(2_u64.saturating_pow(attempts));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempts += 1;
        }
    }
}

// Debug implementation that doesn't expose the key secret
impl std::fmt::Debug for LiveGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveGateway")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct WireSubscription {
    id: String,
    plan_id: String,
    status: String,
    // Start of the current billing period; the freshest state timestamp
    // the subscription entity carries.
    current_start: Option<u64>,
    short_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePlan {
    id: String,
    period: String,
    interval: u32,
    item: WirePlanItem,
}

#[derive(Debug, Deserialize)]
struct WirePlanItem {
    name: String,
    amount: i64,
    currency: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePlanList {
    items: Vec<WirePlan>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: Option<GatewayErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    description: String,
}

impl From<WireSubscription> for GatewaySubscription {
    fn from(w: WireSubscription) -> Self {
        Self {
            id: w.id,
            plan_id: w.plan_id,
            status: w.status,
            status_changed_at: w.current_start,
            short_url: w.short_url,
        }
    }
}

impl From<WirePlan> for GatewayPlan {
    fn from(w: WirePlan) -> Self {
        Self {
            id: w.id,
            name: w.item.name,
            amount: w.item.amount,
            currency: w.item.currency,
            period: w.period,
            interval: w.interval,
            description: w.item.description,
        }
    }
}

// ============================================================================
// BillingGateway implementation
// ============================================================================

#[async_trait]
impl BillingGateway for LiveGateway {
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<GatewaySubscription> {
        let url = self.url("subscriptions");
        let wire: WireSubscription = self
            .execute("create_subscription", || {
                self.http.post(&url).json(&request)
            })
            .await?;
        Ok(wire.into())
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
        let url = self.url(&format!("subscriptions/{subscription_id}"));
        let wire: WireSubscription = self
            .execute("fetch_subscription", || self.http.get(&url))
            .await?;
        Ok(wire.into())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
        let url = self.url(&format!("subscriptions/{subscription_id}/cancel"));
        let _: WireSubscription = self
            .execute("cancel_subscription", || self.http.post(&url))
            .await?;
        Ok(())
    }

    async fn create_plan(&self, request: CreatePlanRequest) -> Result<GatewayPlan> {
        let url = self.url("plans");
        let body = serde_json::json!({
            "period": request.period,
            "interval": request.interval,
            "item": {
                "name": request.name,
                "amount": request.amount,
                "currency": request.currency,
                "description": request.description,
            },
        });
        let wire: WirePlan = self
            .execute("create_plan", || self.http.post(&url).json(&body))
            .await?;
        Ok(wire.into())
    }

    async fn fetch_plan(&self, plan_id: &str) -> Result<GatewayPlan> {
        let url = self.url(&format!("plans/{plan_id}"));
        let wire: WirePlan = self.execute("fetch_plan", || self.http.get(&url)).await?;
        Ok(wire.into())
    }

    async fn list_plans(&self) -> Result<Vec<GatewayPlan>> {
        let url = self.url("plans");
        let wire: WirePlanList = self.execute("list_plans", || self.http.get(&url)).await?;
        Ok(wire.items.into_iter().map(GatewayPlan::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_id_valid() {
        assert!(validate_key_id("rzp_test_1234567890").is_ok());
        assert!(validate_key_id("rzp_live_1234567890").is_ok());
    }

    #[test]
    fn test_validate_key_id_invalid() {
        assert!(validate_key_id("").is_err());
        assert!(validate_key_id("rzp_test_x").is_err());
        assert!(validate_key_id("sk_test_1234567890abcdef").is_err());
    }

    #[test]
    fn test_is_test_mode() {
        let client =
            LiveGateway::with_default_config("rzp_test_1234567890", "secret_value").unwrap();
        assert!(client.is_test_mode());

        let client =
            LiveGateway::with_default_config("rzp_live_1234567890", "secret_value").unwrap();
        assert!(!client.is_test_mode());
    }

    #[test]
    fn test_config_builder() {
        let config = LiveGatewayConfig::new()
            .base_url("https://gateway.example/v1/")
            .max_retries(5)
            .base_delay_ms(100)
            .timeout_seconds(20);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.timeout_seconds, 20);

        let client = LiveGateway::new("rzp_test_1234567890", "secret_value", config).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(20));
        assert_eq!(client.url("plans"), "https://gateway.example/v1/plans");
    }

    #[test]
    fn test_debug_does_not_expose_secret() {
        let client =
            LiveGateway::with_default_config("rzp_test_1234567890", "very_secret_value").unwrap();
        let debug_output = format!("{:?}", client);

        assert!(!debug_output.contains("very_secret_value"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn test_wire_plan_mapping() {
        let wire: WirePlan = serde_json::from_value(serde_json::json!({
            "id": "plan_abc",
            "period": "monthly",
            "interval": 1,
            "item": {
                "name": "CountingPro",
                "amount": 120000,
                "currency": "INR",
                "description": "Pro counting tier"
            }
        }))
        .unwrap();

        let plan = GatewayPlan::from(wire);
        assert_eq!(plan.id, "plan_abc");
        assert_eq!(plan.name, "CountingPro");
        assert_eq!(plan.amount, 120000);
        assert_eq!(plan.interval, 1);
    }
}
