//! Gateway webhook ingestion.
//!
//! Verifies the delivery signature over the raw body, parses the event
//! envelope, and hands status changes to the reconciler. Verification fails
//! closed: nothing is parsed, logged from the payload, or applied until the
//! signature checks out.

use crate::error::Result;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use super::error::BillingError;
use super::gateway::BillingGateway;
use super::reconciler::{ApplyOutcome, Reconciler};
use super::storage::{BillingStore, SubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "X-Razorpay-Signature";

/// Outcome of a webhook delivery.
///
/// Both variants are acknowledged with 200 so the provider stops retrying.
/// A lock that cannot be acquired in time surfaces as
/// [`BillingError::WebhookDeferred`] instead, which maps to 503 and triggers
/// provider redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// The event was dispatched to the reconciler.
    Processed(ApplyOutcome),
    /// The event carried nothing for this system to act on.
    Ignored { reason: &'static str },
}

/// Verify an HMAC-SHA256 hex signature over the raw request body.
///
/// Comparison is constant time. Any malformed input is treated as a bad
/// signature.
pub fn verify_signature(secret: &SecretString, body: &[u8], signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes().to_vec();

    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };

    if computed.len() != provided.len() {
        return false;
    }
    computed.as_slice().ct_eq(provided.as_slice()).into()
}

/// Webhook handler wired to a reconciler.
pub struct WebhookHandler<S, G> {
    reconciler: Arc<Reconciler<S, G>>,
    secret: SecretString,
}

impl<S, G> WebhookHandler<S, G>
where
    S: BillingStore,
    G: BillingGateway,
{
    /// Create a handler with the shared webhook secret.
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler<S, G>>, secret: SecretString) -> Self {
        Self { reconciler, secret }
    }

    /// Process a raw webhook delivery.
    ///
    /// `signature` is the value of the [`SIGNATURE_HEADER`] header; a missing
    /// header is rejected the same as a wrong one.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome> {
        let Some(signature) = signature else {
            return Err(BillingError::InvalidWebhookSignature.into());
        };
        if !verify_signature(&self.secret, raw_body, signature) {
            tracing::warn!(
                target: "countdeck::billing::webhook",
                "Rejected webhook with invalid signature"
            );
            return Err(BillingError::InvalidWebhookSignature.into());
        }

        let envelope: WebhookEnvelope = serde_json::from_slice(raw_body).map_err(|e| {
            BillingError::InvalidWebhookPayload {
                message: e.to_string(),
            }
        })?;

        self.dispatch(envelope).await
    }

    async fn dispatch(&self, envelope: WebhookEnvelope) -> Result<WebhookOutcome> {
        let event_ts = envelope.created_at;

        let (subscription_id, new_status, grant) = match envelope.event.as_str() {
            "subscription.activated" => {
                let Some(id) = envelope.subscription_id() else {
                    return Ok(Self::ignored("subscription entity missing"));
                };
                (id, SubscriptionStatus::Active, true)
            }
            "subscription.completed" => {
                let Some(id) = envelope.subscription_id() else {
                    return Ok(Self::ignored("subscription entity missing"));
                };
                (id, SubscriptionStatus::Completed, true)
            }
            "subscription.halted" => {
                let Some(id) = envelope.subscription_id() else {
                    return Ok(Self::ignored("subscription entity missing"));
                };
                (id, SubscriptionStatus::Halted, false)
            }
            "payment.failed" => {
                // One-off payment failures carry no subscription linkage.
                let Some(id) = envelope.payment_subscription_id() else {
                    return Ok(Self::ignored("payment not linked to a subscription"));
                };
                (id, SubscriptionStatus::PaymentFailed, false)
            }
            "payment.captured" => {
                // Capture for a linked subscription is covered by the
                // subscription.* events; nothing to apply here.
                return Ok(Self::ignored("payment capture acknowledged"));
            }
            other => {
                tracing::debug!(
                    target: "countdeck::billing::webhook",
                    event = other,
                    "Acknowledging unrecognized webhook event"
                );
                return Ok(Self::ignored("unrecognized event"));
            }
        };

        let outcome = self
            .reconciler
            .try_apply_remote_status(
                &subscription_id,
                new_status,
                grant,
                event_ts,
                self.reconciler.config().webhook_lock_timeout,
            )
            .await?;

        tracing::info!(
            target: "countdeck::billing::webhook",
            event = %envelope.event,
            subscription_id = %subscription_id,
            outcome = ?outcome,
            "Webhook processed"
        );

        Ok(WebhookOutcome::Processed(outcome))
    }

    fn ignored(reason: &'static str) -> WebhookOutcome {
        WebhookOutcome::Ignored { reason }
    }
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event: String,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    payload: WebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    subscription: Option<EntityWrapper<SubscriptionEntity>>,
    #[serde(default)]
    payment: Option<EntityWrapper<PaymentEntity>>,
}

#[derive(Debug, Deserialize)]
struct EntityWrapper<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEntity {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    #[serde(default)]
    subscription_id: Option<String>,
}

impl WebhookEnvelope {
    fn subscription_id(&self) -> Option<String> {
        self.payload
            .subscription
            .as_ref()
            .map(|w| w.entity.id.clone())
    }

    fn payment_subscription_id(&self) -> Option<String> {
        self.payload
            .payment
            .as_ref()
            .and_then(|w| w.entity.subscription_id.clone())
    }
}
