//! Storage traits for billing data.
//!
//! Implement [`BillingStore`] to persist billing state to your database.
//! The store covers three collections: subscription records (keyed by the
//! gateway-assigned subscription id), plans, and per-user entitlement sets.
//! An in-memory implementation is provided for testing.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Trait for storing billing data.
///
/// Subscription status is mutated exclusively by the reconciler; records are
/// never deleted (cancelled records are retained for history).
#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscription records

    /// Get a subscription record by its gateway subscription id.
    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<SubscriptionRecord>>;

    /// Insert a newly created subscription record.
    async fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<()>;

    /// Update the status fields of a subscription record.
    ///
    /// Returns `Ok(true)` if a record was modified, `Ok(false)` if no record
    /// with that id exists.
    async fn update_subscription_status(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
        updated_at: u64,
        cancelled_at: Option<u64>,
    ) -> Result<bool>;

    /// List all subscription records for a user, newest first.
    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>>;

    /// Find an Active record for `(user_id, plan_id)`, if one exists.
    async fn find_active_subscription(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<Option<SubscriptionRecord>>;

    // Plans

    /// Get a plan by its gateway plan id.
    async fn get_plan(&self, plan_id: &str) -> Result<Option<StoredPlan>>;

    /// Insert or replace a plan.
    async fn upsert_plan(&self, plan: &StoredPlan) -> Result<()>;

    /// List all known plans.
    async fn list_plans(&self) -> Result<Vec<StoredPlan>>;

    // Entitlements

    /// Add a service name to the user's entitlement set (set-union, safe to repeat).
    async fn grant_service(&self, user_id: &str, service: &str) -> Result<()>;

    /// Remove a service name from the user's entitlement set (safe to repeat).
    async fn revoke_service(&self, user_id: &str, service: &str) -> Result<()>;

    /// The user's current entitlement set.
    async fn subscribed_services(&self, user_id: &str) -> Result<BTreeSet<String>>;
}

/// A persisted subscription document.
///
/// Created by the lifecycle API in `Pending` status; thereafter mutated only
/// by the reconciler. All timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionRecord {
    /// Gateway-assigned subscription id (unique key).
    pub subscription_id: String,
    /// Owning user id.
    pub user_id: String,
    /// Gateway plan id.
    pub plan_id: String,
    /// Current status.
    pub status: SubscriptionStatus,
    /// Total amount charged over the subscription, in major currency units.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Email of the subscribing user at creation time.
    pub customer_email: String,
    /// Billing cadence chosen at creation.
    pub subscription_type: SubscriptionType,
    /// Hosted payment link returned by the gateway, if any.
    pub payment_link: Option<String>,
    /// Creation timestamp.
    pub created_at: u64,
    /// Set on every status mutation. Carries the gateway event timestamp
    /// when one was supplied, which drives the monotonic ordering guard.
    pub updated_at: u64,
    /// Set once, on transition into Cancelled.
    pub cancelled_at: Option<u64>,
    /// Computed at creation from the subscription type.
    pub start_date: u64,
    /// Computed at creation from the subscription type.
    pub end_date: u64,
}

impl SubscriptionRecord {
    /// Check if the subscription is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Check if the subscription is in the terminal state.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status == SubscriptionStatus::Cancelled
    }
}

/// Subscription status.
///
/// `Cancelled` is terminal. `Halted` and `PaymentFailed` may return to
/// `Active` when the gateway reports a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created locally, awaiting first payment.
    Pending,
    /// Active and paid.
    Active,
    /// Ran its full billing cycle count.
    Completed,
    /// Halted by the gateway after repeated payment failures.
    Halted,
    /// A payment attempt failed; the gateway may retry.
    PaymentFailed,
    /// Cancelled; no transitions leave this state.
    Cancelled,
}

impl SubscriptionStatus {
    /// Parse from a gateway-reported status string.
    ///
    /// Returns `None` for status values this system does not track, so that
    /// callers can log and skip them rather than guessing.
    #[must_use]
    pub fn from_gateway(status: &str) -> Option<Self> {
        match status {
            "created" | "authenticated" | "pending" => Some(Self::Pending),
            "active" | "resumed" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "halted" => Some(Self::Halted),
            "payment_failed" => Some(Self::PaymentFailed),
            "cancelled" | "expired" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Convert to the stored/string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Halted => "halted",
            Self::PaymentFailed => "payment_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status carries entitlement-granting semantics.
    #[must_use]
    pub fn grants_entitlement(&self) -> bool {
        matches!(self, Self::Active | Self::Completed)
    }

    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        *self == Self::Cancelled
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing cadence for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionType {
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
}

impl SubscriptionType {
    /// Parse from the wire form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "half-yearly" => Some(Self::HalfYearly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// Convert to the wire form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::HalfYearly => "half-yearly",
            Self::Yearly => "yearly",
        }
    }

    /// Number of plan billing cycles covered by this cadence.
    #[must_use]
    pub fn cycle_count(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Quarterly => 3,
            Self::HalfYearly => 6,
            Self::Yearly => 12,
        }
    }

    /// Subscription duration in days.
    #[must_use]
    pub fn duration_days(&self) -> u64 {
        match self {
            Self::Monthly => 30,
            Self::Quarterly => 90,
            Self::HalfYearly => 180,
            Self::Yearly => 365,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A plan stored locally, mirroring a gateway plan.
///
/// The plan `name` doubles as the entitlement/service name granted to users
/// while a subscription to it is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredPlan {
    /// Gateway plan id.
    pub plan_id: String,
    /// Display name; also the entitlement/service name.
    pub name: String,
    /// Per-cycle amount in major currency units.
    pub amount: i64,
    /// Billing period ("monthly", "yearly", ...).
    pub period: String,
    /// Billing interval within the period.
    pub interval: u32,
    /// Optional description.
    pub description: Option<String>,
    /// Name of the admin who created the plan, when created locally.
    pub created_by: Option<String>,
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// In-memory billing store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory billing store for testing.
    ///
    /// Wraps data in `Arc` for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        subscriptions: RwLock<HashMap<String, SubscriptionRecord>>,
        plans: RwLock<HashMap<String, StoredPlan>>,
        services: RwLock<HashMap<String, BTreeSet<String>>>,
    }

    impl InMemoryBillingStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed plans for testing.
        pub fn seed_plans(&self, plans: Vec<StoredPlan>) {
            let mut map = self.inner.plans.write().unwrap();
            for plan in plans {
                map.insert(plan.plan_id.clone(), plan);
            }
        }

        /// Snapshot of all subscription records (for assertions).
        pub fn all_subscriptions(&self) -> Vec<SubscriptionRecord> {
            self.inner
                .subscriptions
                .read()
                .unwrap()
                .values()
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {
        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<Option<SubscriptionRecord>> {
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .get(subscription_id)
                .cloned())
        }

        async fn insert_subscription(&self, record: &SubscriptionRecord) -> Result<()> {
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(record.subscription_id.clone(), record.clone());
            Ok(())
        }

        async fn update_subscription_status(
            &self,
            subscription_id: &str,
            status: SubscriptionStatus,
            updated_at: u64,
            cancelled_at: Option<u64>,
        ) -> Result<bool> {
            let mut subs = self.inner.subscriptions.write().unwrap();
            match subs.get_mut(subscription_id) {
                Some(record) => {
                    record.status = status;
                    record.updated_at = updated_at;
                    if cancelled_at.is_some() {
                        record.cancelled_at = cancelled_at;
                    }
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>> {
            let subs = self.inner.subscriptions.read().unwrap();
            let mut records: Vec<SubscriptionRecord> = subs
                .values()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect();
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(records)
        }

        async fn find_active_subscription(
            &self,
            user_id: &str,
            plan_id: &str,
        ) -> Result<Option<SubscriptionRecord>> {
            let subs = self.inner.subscriptions.read().unwrap();
            Ok(subs
                .values()
                .find(|r| {
                    r.user_id == user_id
                        && r.plan_id == plan_id
                        && r.status == SubscriptionStatus::Active
                })
                .cloned())
        }

        async fn get_plan(&self, plan_id: &str) -> Result<Option<StoredPlan>> {
            Ok(self.inner.plans.read().unwrap().get(plan_id).cloned())
        }

        async fn upsert_plan(&self, plan: &StoredPlan) -> Result<()> {
            self.inner
                .plans
                .write()
                .unwrap()
                .insert(plan.plan_id.clone(), plan.clone());
            Ok(())
        }

        async fn list_plans(&self) -> Result<Vec<StoredPlan>> {
            let mut plans: Vec<StoredPlan> =
                self.inner.plans.read().unwrap().values().cloned().collect();
            plans.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
            Ok(plans)
        }

        async fn grant_service(&self, user_id: &str, service: &str) -> Result<()> {
            self.inner
                .services
                .write()
                .unwrap()
                .entry(user_id.to_string())
                .or_default()
                .insert(service.to_string());
            Ok(())
        }

        async fn revoke_service(&self, user_id: &str, service: &str) -> Result<()> {
            if let Some(set) = self.inner.services.write().unwrap().get_mut(user_id) {
                set.remove(service);
            }
            Ok(())
        }

        async fn subscribed_services(&self, user_id: &str) -> Result<BTreeSet<String>> {
            Ok(self
                .inner
                .services
                .read()
                .unwrap()
                .get(user_id)
                .cloned()
                .unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_gateway() {
        assert_eq!(
            SubscriptionStatus::from_gateway("active"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            SubscriptionStatus::from_gateway("created"),
            Some(SubscriptionStatus::Pending)
        );
        assert_eq!(
            SubscriptionStatus::from_gateway("halted"),
            Some(SubscriptionStatus::Halted)
        );
        assert_eq!(
            SubscriptionStatus::from_gateway("cancelled"),
            Some(SubscriptionStatus::Cancelled)
        );
        assert_eq!(SubscriptionStatus::from_gateway("paused"), None);
    }

    #[test]
    fn test_status_properties() {
        assert!(SubscriptionStatus::Active.grants_entitlement());
        assert!(SubscriptionStatus::Completed.grants_entitlement());
        assert!(!SubscriptionStatus::Halted.grants_entitlement());
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(!SubscriptionStatus::PaymentFailed.is_terminal());
    }

    #[test]
    fn test_subscription_type_parse() {
        assert_eq!(
            SubscriptionType::parse("half-yearly"),
            Some(SubscriptionType::HalfYearly)
        );
        assert_eq!(SubscriptionType::parse("weekly"), None);
        assert_eq!(SubscriptionType::Quarterly.cycle_count(), 3);
        assert_eq!(SubscriptionType::Yearly.duration_days(), 365);
    }

    fn record(id: &str, user: &str, plan: &str, status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord {
            subscription_id: id.to_string(),
            user_id: user.to_string(),
            plan_id: plan.to_string(),
            status,
            amount: 1200,
            currency: "INR".to_string(),
            customer_email: "u@example.com".to_string(),
            subscription_type: SubscriptionType::Monthly,
            payment_link: None,
            created_at: 100,
            updated_at: 100,
            cancelled_at: None,
            start_date: 100,
            end_date: 100 + 30 * 86400,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        use test::InMemoryBillingStore;

        let store = InMemoryBillingStore::new();
        assert!(store.get_subscription("sub_1").await.unwrap().is_none());

        store
            .insert_subscription(&record("sub_1", "u1", "plan_a", SubscriptionStatus::Pending))
            .await
            .unwrap();

        let loaded = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SubscriptionStatus::Pending);

        let modified = store
            .update_subscription_status("sub_1", SubscriptionStatus::Active, 200, None)
            .await
            .unwrap();
        assert!(modified);

        let loaded = store.get_subscription("sub_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SubscriptionStatus::Active);
        assert_eq!(loaded.updated_at, 200);
        assert!(loaded.cancelled_at.is_none());

        // Unknown id is reported, not an error.
        let modified = store
            .update_subscription_status("sub_x", SubscriptionStatus::Active, 200, None)
            .await
            .unwrap();
        assert!(!modified);
    }

    #[tokio::test]
    async fn test_find_active_subscription() {
        use test::InMemoryBillingStore;

        let store = InMemoryBillingStore::new();
        store
            .insert_subscription(&record(
                "sub_1",
                "u1",
                "plan_a",
                SubscriptionStatus::Cancelled,
            ))
            .await
            .unwrap();
        store
            .insert_subscription(&record("sub_2", "u1", "plan_a", SubscriptionStatus::Active))
            .await
            .unwrap();

        let active = store
            .find_active_subscription("u1", "plan_a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.subscription_id, "sub_2");

        assert!(store
            .find_active_subscription("u2", "plan_a")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_entitlement_set_semantics() {
        use test::InMemoryBillingStore;

        let store = InMemoryBillingStore::new();
        store.grant_service("u1", "CountingPro").await.unwrap();
        store.grant_service("u1", "CountingPro").await.unwrap();

        let services = store.subscribed_services("u1").await.unwrap();
        assert_eq!(services.len(), 1);
        assert!(services.contains("CountingPro"));

        store.revoke_service("u1", "CountingPro").await.unwrap();
        store.revoke_service("u1", "CountingPro").await.unwrap();
        assert!(store.subscribed_services("u1").await.unwrap().is_empty());
    }
}
