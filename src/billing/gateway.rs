//! Payment gateway client traits.
//!
//! The reconciler talks to the gateway exclusively through [`BillingGateway`],
//! so production code and tests swap implementations freely. A mock
//! implementation lives in the `test` module.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trait for payment gateway operations.
///
/// Implementations must be safe to call concurrently. All calls are issued by
/// the reconciler outside of its per-subscription locks, wrapped in bounded
/// timeouts.
#[async_trait]
pub trait BillingGateway: Send + Sync {
    /// Create a subscription at the gateway.
    async fn create_subscription(
        &self,
        request: CreateSubscriptionRequest,
    ) -> Result<GatewaySubscription>;

    /// Fetch the current remote state of a subscription.
    async fn fetch_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription>;

    /// Cancel a subscription at the gateway.
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()>;

    /// Create a plan at the gateway, returning its assigned id.
    async fn create_plan(&self, request: CreatePlanRequest) -> Result<GatewayPlan>;

    /// Fetch a single plan.
    async fn fetch_plan(&self, plan_id: &str) -> Result<GatewayPlan>;

    /// List all plans known to the gateway.
    async fn list_plans(&self) -> Result<Vec<GatewayPlan>>;
}

/// Request to create a subscription at the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSubscriptionRequest {
    /// Gateway plan id.
    pub plan_id: String,
    /// Number of billing cycles to charge.
    pub total_count: u32,
    /// Whether the gateway should notify the customer directly.
    pub customer_notify: bool,
    /// Free-form notes attached to the subscription (user id, email).
    pub notes: HashMap<String, String>,
}

/// A subscription as reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySubscription {
    /// Gateway-assigned subscription id.
    pub id: String,
    /// Gateway plan id.
    pub plan_id: String,
    /// Raw gateway status string ("created", "active", "halted", ...).
    pub status: String,
    /// When the reported status took effect, unix seconds. Feeds the same
    /// ordering guard as webhook event timestamps so a polled fetch can
    /// never roll back a newer webhook-applied state.
    pub status_changed_at: Option<u64>,
    /// Hosted payment page for the subscriber.
    pub short_url: Option<String>,
}

/// Request to create a plan at the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePlanRequest {
    /// Billing period ("monthly", "yearly", ...).
    pub period: String,
    /// Billing interval within the period.
    pub interval: u32,
    /// Display name.
    pub name: String,
    /// Per-cycle amount in minor currency units (paise/cents).
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Optional description.
    pub description: Option<String>,
}

/// A plan as reported by the gateway.
///
/// Amounts come back in minor currency units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPlan {
    /// Gateway-assigned plan id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Per-cycle amount in minor currency units.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Billing period.
    pub period: String,
    /// Billing interval within the period.
    pub interval: u32,
    /// Optional description.
    pub description: Option<String>,
}

/// Mock gateway for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, RwLock};

    /// Mock gateway with scriptable remote state.
    ///
    /// Remote subscription statuses can be set per id, individual operations
    /// can be forced to fail, and every call is recorded for assertions.
    #[derive(Default, Clone)]
    pub struct MockGateway {
        inner: Arc<MockInner>,
    }

    #[derive(Default)]
    struct MockInner {
        subscriptions: RwLock<HashMap<String, GatewaySubscription>>,
        plans: RwLock<HashMap<String, GatewayPlan>>,
        fail_ops: RwLock<std::collections::HashSet<String>>,
        calls: Mutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl MockGateway {
        /// Create a new mock gateway.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Set the remote status for a subscription id, stamped with now.
        pub fn set_remote_status(&self, subscription_id: &str, status: &str) {
            self.set_remote_status_at(subscription_id, status, crate::billing::storage::unix_now());
        }

        /// Set the remote status with an explicit change timestamp.
        pub fn set_remote_status_at(&self, subscription_id: &str, status: &str, changed_at: u64) {
            let mut subs = self.inner.subscriptions.write().unwrap();
            match subs.get_mut(subscription_id) {
                Some(sub) => {
                    sub.status = status.to_string();
                    sub.status_changed_at = Some(changed_at);
                }
                None => {
                    subs.insert(
                        subscription_id.to_string(),
                        GatewaySubscription {
                            id: subscription_id.to_string(),
                            plan_id: "plan_mock".to_string(),
                            status: status.to_string(),
                            status_changed_at: Some(changed_at),
                            short_url: None,
                        },
                    );
                }
            }
        }

        /// Seed a plan into the mock gateway.
        pub fn seed_plan(&self, plan: GatewayPlan) {
            self.inner
                .plans
                .write()
                .unwrap()
                .insert(plan.id.clone(), plan);
        }

        /// Drop a subscription from the remote state, so fetches fail.
        pub fn remove_subscription(&self, subscription_id: &str) {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .remove(subscription_id);
        }

        /// Make the named operation fail until cleared.
        pub fn fail_operation(&self, operation: &str) {
            self.inner
                .fail_ops
                .write()
                .unwrap()
                .insert(operation.to_string());
        }

        /// Clear a forced failure.
        pub fn clear_failure(&self, operation: &str) {
            self.inner.fail_ops.write().unwrap().remove(operation);
        }

        /// Recorded calls, in order, as "operation:argument".
        pub fn calls(&self) -> Vec<String> {
            self.inner.calls.lock().unwrap().clone()
        }

        fn record(&self, operation: &str, arg: &str) -> Result<()> {
            self.inner
                .calls
                .lock()
                .unwrap()
                .push(format!("{operation}:{arg}"));
            if self.inner.fail_ops.read().unwrap().contains(operation) {
                return Err(BillingError::GatewayApi {
                    operation: operation.to_string(),
                    message: "forced failure".to_string(),
                    http_status: Some(500),
                }
                .into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BillingGateway for MockGateway {
        async fn create_subscription(
            &self,
            request: CreateSubscriptionRequest,
        ) -> Result<GatewaySubscription> {
            self.record("create_subscription", &request.plan_id)?;
            let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let sub = GatewaySubscription {
                id: format!("sub_mock_{n}"),
                plan_id: request.plan_id,
                status: "created".to_string(),
                status_changed_at: Some(crate::billing::storage::unix_now()),
                short_url: Some(format!("https://pay.example/{n}")),
            };
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(sub.id.clone(), sub.clone());
            Ok(sub)
        }

        async fn fetch_subscription(&self, subscription_id: &str) -> Result<GatewaySubscription> {
            self.record("fetch_subscription", subscription_id)?;
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::SubscriptionNotFound {
                        subscription_id: subscription_id.to_string(),
                    }
                    .into()
                })
        }

        async fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
            self.record("cancel_subscription", subscription_id)?;
            let mut subs = self.inner.subscriptions.write().unwrap();
            match subs.get_mut(subscription_id) {
                Some(sub) => {
                    sub.status = "cancelled".to_string();
                    sub.status_changed_at = Some(crate::billing::storage::unix_now());
                    Ok(())
                }
                None => Err(BillingError::SubscriptionNotFound {
                    subscription_id: subscription_id.to_string(),
                }
                .into()),
            }
        }

        async fn create_plan(&self, request: CreatePlanRequest) -> Result<GatewayPlan> {
            self.record("create_plan", &request.name)?;
            let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
            let plan = GatewayPlan {
                id: format!("plan_mock_{n}"),
                name: request.name,
                amount: request.amount,
                currency: request.currency,
                period: request.period,
                interval: request.interval,
                description: request.description,
            };
            self.inner
                .plans
                .write()
                .unwrap()
                .insert(plan.id.clone(), plan.clone());
            Ok(plan)
        }

        async fn fetch_plan(&self, plan_id: &str) -> Result<GatewayPlan> {
            self.record("fetch_plan", plan_id)?;
            self.inner
                .plans
                .read()
                .unwrap()
                .get(plan_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::PlanNotFound {
                        plan_id: plan_id.to_string(),
                    }
                    .into()
                })
        }

        async fn list_plans(&self) -> Result<Vec<GatewayPlan>> {
            self.record("list_plans", "")?;
            let mut plans: Vec<GatewayPlan> =
                self.inner.plans.read().unwrap().values().cloned().collect();
            plans.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(plans)
        }
    }
}
