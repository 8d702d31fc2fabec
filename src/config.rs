use secrecy::SecretString;
use std::time::Duration;

use crate::billing::{ReconcilerConfig, RevokePolicy, SyncGrants};

/// Billing configuration for the countdeck backend.
///
/// Credentials are held in `SecretString` and never serialized or printed.
#[derive(Clone)]
pub struct BillingConfig {
    /// Gateway key id (`rzp_test_*` or `rzp_live_*`).
    pub gateway_key_id: String,
    /// Gateway key secret.
    pub gateway_key_secret: SecretString,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: SecretString,
    /// Base URL of the gateway REST API.
    pub gateway_base_url: String,
    /// Reconciler policies and timeouts.
    pub reconciler: ReconcilerConfig,
}

impl std::fmt::Debug for BillingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingConfig")
            .field("gateway_key_id", &self.gateway_key_id)
            .field("gateway_base_url", &self.gateway_base_url)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`BillingConfig`] with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct BillingConfigBuilder {
    gateway_key_id: String,
    gateway_key_secret: SecretString,
    webhook_secret: SecretString,
    gateway_base_url: String,
    reconciler: ReconcilerConfig,
}

impl BillingConfigBuilder {
    pub fn new() -> Self {
        Self {
            gateway_key_id: String::new(),
            gateway_key_secret: SecretString::from(String::new()),
            webhook_secret: SecretString::from(String::new()),
            gateway_base_url: "https://api.razorpay.com/v1".to_string(),
            reconciler: ReconcilerConfig::default(),
        }
    }

    /// Load settings from `COUNTDECK_*` environment variables.
    ///
    /// Recognized variables:
    /// - `COUNTDECK_GATEWAY_KEY_ID`
    /// - `COUNTDECK_GATEWAY_KEY_SECRET`
    /// - `COUNTDECK_WEBHOOK_SECRET`
    /// - `COUNTDECK_GATEWAY_BASE_URL`
    /// - `COUNTDECK_SYNC_GRANTS` ("status-only" | "grant-on-activate")
    /// - `COUNTDECK_REVOKE_POLICY` ("keep-if-shared" | "always")
    /// - `COUNTDECK_WEBHOOK_LOCK_TIMEOUT_MS`
    /// - `COUNTDECK_GATEWAY_TIMEOUT_SECONDS`
    /// - `COUNTDECK_CURRENCY`
    pub fn from_env(mut self) -> Self {
        if let Ok(v) = std::env::var("COUNTDECK_GATEWAY_KEY_ID") {
            self.gateway_key_id = v;
        }
        if let Ok(v) = std::env::var("COUNTDECK_GATEWAY_KEY_SECRET") {
            self.gateway_key_secret = SecretString::from(v);
        }
        if let Ok(v) = std::env::var("COUNTDECK_WEBHOOK_SECRET") {
            self.webhook_secret = SecretString::from(v);
        }
        if let Ok(v) = std::env::var("COUNTDECK_GATEWAY_BASE_URL") {
            self.gateway_base_url = v;
        }
        if let Ok(v) = std::env::var("COUNTDECK_SYNC_GRANTS") {
            if v == "grant-on-activate" {
                self.reconciler.sync_grants = SyncGrants::GrantOnActivate;
            }
        }
        if let Ok(v) = std::env::var("COUNTDECK_REVOKE_POLICY") {
            if v == "always" {
                self.reconciler.revoke_policy = RevokePolicy::Always;
            }
        }
        if let Ok(v) = std::env::var("COUNTDECK_WEBHOOK_LOCK_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                self.reconciler.webhook_lock_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("COUNTDECK_GATEWAY_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.reconciler.gateway_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("COUNTDECK_CURRENCY") {
            self.reconciler.currency = v;
        }
        self
    }

    pub fn with_gateway_credentials(
        mut self,
        key_id: impl Into<String>,
        key_secret: impl Into<SecretString>,
    ) -> Self {
        self.gateway_key_id = key_id.into();
        self.gateway_key_secret = key_secret.into();
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<SecretString>) -> Self {
        self.webhook_secret = secret.into();
        self
    }

    pub fn with_gateway_base_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_base_url = url.into();
        self
    }

    pub fn with_reconciler(mut self, reconciler: ReconcilerConfig) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn build(self) -> BillingConfig {
        BillingConfig {
            gateway_key_id: self.gateway_key_id,
            gateway_key_secret: self.gateway_key_secret,
            webhook_secret: self.webhook_secret,
            gateway_base_url: self.gateway_base_url,
            reconciler: self.reconciler,
        }
    }
}

impl Default for BillingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_builder_defaults() {
        let config = BillingConfigBuilder::new().build();
        assert_eq!(config.gateway_base_url, "https://api.razorpay.com/v1");
        assert_eq!(config.reconciler.sync_grants, SyncGrants::StatusOnly);
        assert_eq!(config.reconciler.revoke_policy, RevokePolicy::KeepIfShared);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BillingConfigBuilder::new()
            .with_gateway_credentials("rzp_test_1234567890", "secret_value")
            .with_webhook_secret("whsec_value")
            .with_gateway_base_url("https://gateway.example/v1")
            .with_reconciler(ReconcilerConfig {
                revoke_policy: RevokePolicy::Always,
                ..ReconcilerConfig::default()
            })
            .build();

        assert_eq!(config.gateway_key_id, "rzp_test_1234567890");
        assert_eq!(config.gateway_key_secret.expose_secret(), "secret_value");
        assert_eq!(config.reconciler.revoke_policy, RevokePolicy::Always);
    }

    #[test]
    fn test_debug_does_not_expose_secrets() {
        let config = BillingConfigBuilder::new()
            .with_gateway_credentials("rzp_test_1234567890", "secret_value")
            .with_webhook_secret("whsec_value")
            .build();

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("secret_value"));
        assert!(!debug_output.contains("whsec_value"));
        assert!(debug_output.contains("rzp_test_1234567890"));
    }
}
