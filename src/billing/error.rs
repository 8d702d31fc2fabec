//! Billing-specific error types.
//!
//! Provides granular error types for billing operations, enabling better
//! error handling and more informative error messages for API consumers.

use std::fmt;

/// Billing-specific errors.
///
/// These errors carry more context than generic errors and can be converted
/// to `CountdeckError` for HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// The subscription type string is not one of the supported cadences.
    InvalidSubscriptionType { value: String },

    // Plan errors
    /// The specified plan was not found.
    PlanNotFound { plan_id: String },

    // Subscription errors
    /// No subscription record matches the id (scoped to the calling user
    /// on user-facing paths).
    SubscriptionNotFound { subscription_id: String },
    /// The user already holds an active subscription to this plan.
    DuplicateActiveSubscription { user_id: String, plan_id: String },

    // Webhook errors
    /// Webhook signature is invalid or missing.
    InvalidWebhookSignature,
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },
    /// The per-subscription lock could not be acquired in time; the caller
    /// should ask the provider to redeliver.
    WebhookDeferred { subscription_id: String },

    // Gateway API errors
    /// The gateway returned an error or the call timed out.
    GatewayApi {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    // General errors
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSubscriptionType { value } => {
                write!(f, "Invalid subscription type: {}", value)
            }
            Self::PlanNotFound { plan_id } => {
                write!(f, "Plan not found: {}", plan_id)
            }
            Self::SubscriptionNotFound { subscription_id } => {
                write!(f, "Subscription not found: {}", subscription_id)
            }
            Self::DuplicateActiveSubscription { user_id, plan_id } => {
                write!(
                    f,
                    "User '{}' already has an active subscription to plan '{}'",
                    user_id, plan_id
                )
            }
            Self::InvalidWebhookSignature => {
                write!(f, "Invalid webhook signature")
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::WebhookDeferred { subscription_id } => {
                write!(
                    f,
                    "Webhook for subscription '{}' deferred, retry later",
                    subscription_id
                )
            }
            Self::GatewayApi {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Gateway error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => {
                write!(f, "Internal billing error: {}", message)
            }
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::CountdeckError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::PlanNotFound { .. } | BillingError::SubscriptionNotFound { .. } => {
                crate::error::CountdeckError::NotFound(err.to_string())
            }

            BillingError::DuplicateActiveSubscription { .. } => {
                crate::error::CountdeckError::Conflict(err.to_string())
            }

            BillingError::InvalidSubscriptionType { .. }
            | BillingError::InvalidWebhookPayload { .. } => {
                crate::error::CountdeckError::BadRequest(err.to_string())
            }

            // Fail closed: an unverifiable webhook is rejected outright.
            BillingError::InvalidWebhookSignature => {
                crate::error::CountdeckError::Unauthorized(err.to_string())
            }

            // 503 so the provider retries delivery.
            BillingError::WebhookDeferred { .. } => {
                crate::error::CountdeckError::ServiceUnavailable(err.to_string())
            }

            BillingError::GatewayApi { http_status, .. } => match http_status {
                Some(400..=499) => crate::error::CountdeckError::BadRequest(err.to_string()),
                _ => crate::error::CountdeckError::Gateway(err.to_string()),
            },

            BillingError::Internal { .. } => {
                crate::error::CountdeckError::Internal(err.to_string())
            }
        }
    }
}

impl BillingError {
    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidSubscriptionType { .. }
            | Self::PlanNotFound { .. }
            | Self::SubscriptionNotFound { .. }
            | Self::DuplicateActiveSubscription { .. }
            | Self::InvalidWebhookSignature
            | Self::InvalidWebhookPayload { .. } => true,
            Self::GatewayApi { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            _ => false,
        }
    }

    /// Check if this error is retryable by the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WebhookDeferred { .. } => true,
            Self::GatewayApi { http_status, .. } => {
                matches!(http_status, Some(429) | Some(500..=599) | None)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CountdeckError;

    #[test]
    fn test_error_display() {
        let err = BillingError::PlanNotFound {
            plan_id: "plan_basic".to_string(),
        };
        assert_eq!(err.to_string(), "Plan not found: plan_basic");

        let err = BillingError::GatewayApi {
            operation: "fetch_subscription".to_string(),
            message: "timed out".to_string(),
            http_status: Some(504),
        };
        assert_eq!(
            err.to_string(),
            "Gateway error during 'fetch_subscription': timed out [HTTP 504]"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::DuplicateActiveSubscription {
            user_id: "u1".to_string(),
            plan_id: "plan_a".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        let err = BillingError::WebhookDeferred {
            subscription_id: "sub_1".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_convert_to_countdeck_error() {
        let err = BillingError::SubscriptionNotFound {
            subscription_id: "sub_1".to_string(),
        };
        let converted: CountdeckError = err.into();
        assert!(matches!(converted, CountdeckError::NotFound(_)));

        let err = BillingError::InvalidWebhookSignature;
        let converted: CountdeckError = err.into();
        assert!(matches!(converted, CountdeckError::Unauthorized(_)));

        let err = BillingError::DuplicateActiveSubscription {
            user_id: "u1".to_string(),
            plan_id: "plan_a".to_string(),
        };
        let converted: CountdeckError = err.into();
        assert!(matches!(converted, CountdeckError::Conflict(_)));

        let err = BillingError::WebhookDeferred {
            subscription_id: "sub_1".to_string(),
        };
        let converted: CountdeckError = err.into();
        assert!(matches!(converted, CountdeckError::ServiceUnavailable(_)));
    }
}
