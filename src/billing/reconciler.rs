//! Subscription state reconciler.
//!
//! Single owner of subscription status transitions. Remote state arrives from
//! two independent paths (webhook delivery and sync-on-demand polling) plus
//! the explicit user cancel; all three converge here and are serialized per
//! subscription id. Entitlement side-effects are applied together with the
//! status change, under the same lock.
//!
//! Locking discipline: one `tokio::sync::Mutex` per subscription id held in a
//! `DashMap`. Gateway calls are never issued while a lock is held; the cancel
//! path re-checks the record after the gateway confirms.

use crate::error::Result;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::error::BillingError;
use super::gateway::{BillingGateway, CreateSubscriptionRequest};
use super::storage::{
    unix_now, BillingStore, SubscriptionRecord, SubscriptionStatus, SubscriptionType,
};

/// Outcome of applying a remotely observed status to a local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The stored status was changed.
    Updated,
    /// The stored status already matched; nothing to do.
    AlreadyCurrent,
    /// The event timestamp predates the last applied update; dropped.
    Stale,
    /// The record is Cancelled; no transition leaves that state.
    Terminal,
    /// No local record exists for this subscription id.
    UnknownSubscription,
}

/// Whether the polling sync path may grant entitlements.
///
/// Webhook activation always grants. Sync observing an Active status cannot
/// tell whether the corresponding grant already happened through a webhook
/// that was later rolled back by an operator, so granting there is a policy
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncGrants {
    /// Sync only overwrites status; entitlements move on webhooks and cancel.
    #[default]
    StatusOnly,
    /// Sync grants when it observes a transition into Active or Completed.
    GrantOnActivate,
}

/// How cancellation treats the entitlement when another subscription of the
/// same user may still grant the same service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RevokePolicy {
    /// Revoke only if no other Active subscription of the user resolves to
    /// the same service name.
    #[default]
    KeepIfShared,
    /// Always revoke on cancel.
    Always,
}

/// Tuning knobs for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Policy for entitlement grants on the sync path.
    pub sync_grants: SyncGrants,
    /// Policy for entitlement revocation on cancel.
    pub revoke_policy: RevokePolicy,
    /// How long the webhook path waits for a per-subscription lock before
    /// deferring the event to provider redelivery.
    pub webhook_lock_timeout: Duration,
    /// Upper bound on any single gateway call.
    pub gateway_timeout: Duration,
    /// Currency used for new subscriptions.
    pub currency: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_grants: SyncGrants::default(),
            revoke_policy: RevokePolicy::default(),
            webhook_lock_timeout: Duration::from_secs(2),
            gateway_timeout: Duration::from_secs(10),
            currency: "INR".to_string(),
        }
    }
}

/// The subscription state reconciler.
///
/// Generic over the store and gateway so tests can run fully in memory.
pub struct Reconciler<S, G> {
    store: S,
    gateway: G,
    config: ReconcilerConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S, G> Reconciler<S, G>
where
    S: BillingStore,
    G: BillingGateway,
{
    /// Create a new reconciler.
    #[must_use]
    pub fn new(store: S, gateway: G, config: ReconcilerConfig) -> Self {
        Self {
            store,
            gateway,
            config,
            locks: DashMap::new(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Direct access to the store, for read-only collaborators.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn lock_for(&self, subscription_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(subscription_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn gateway_call<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.gateway_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::GatewayApi {
                operation: operation.to_string(),
                message: format!(
                    "request timed out after {}s",
                    self.config.gateway_timeout.as_secs()
                ),
                http_status: None,
            }
            .into()),
        }
    }

    // ========================================================================
    // Status reconciliation
    // ========================================================================

    /// Apply a remotely observed status to the local record.
    ///
    /// Waits for the per-subscription lock. `event_ts` is the gateway's event
    /// timestamp when the caller has one; events strictly older than the last
    /// applied update are dropped as [`ApplyOutcome::Stale`]. When `grant` is
    /// set and the new status is entitlement-bearing, the plan's service name
    /// is added to the user's entitlement set under the same lock.
    pub async fn apply_remote_status(
        &self,
        subscription_id: &str,
        new_status: SubscriptionStatus,
        grant: bool,
        event_ts: Option<u64>,
    ) -> Result<ApplyOutcome> {
        let lock = self.lock_for(subscription_id);
        let outcome = {
            let _guard = lock.lock().await;
            self.apply_locked(subscription_id, new_status, grant, event_ts)
                .await
        };
        if matches!(outcome, Ok(ApplyOutcome::UnknownSubscription)) {
            self.discard_lock_if_unused(subscription_id, &lock);
        }
        outcome
    }

    /// Like [`apply_remote_status`](Self::apply_remote_status) but gives up
    /// on the lock after `wait`, returning `WebhookDeferred`.
    ///
    /// Used by the webhook path so a stuck or slow holder cannot pile up
    /// provider deliveries; the provider retries on the resulting 503.
    pub async fn try_apply_remote_status(
        &self,
        subscription_id: &str,
        new_status: SubscriptionStatus,
        grant: bool,
        event_ts: Option<u64>,
        wait: Duration,
    ) -> Result<ApplyOutcome> {
        let lock = self.lock_for(subscription_id);
        let guard = tokio::time::timeout(wait, lock.lock()).await;
        match guard {
            Ok(guard) => {
                let outcome = self
                    .apply_locked(subscription_id, new_status, grant, event_ts)
                    .await;
                drop(guard);
                if matches!(outcome, Ok(ApplyOutcome::UnknownSubscription)) {
                    self.discard_lock_if_unused(subscription_id, &lock);
                }
                outcome
            }
            Err(_) => Err(BillingError::WebhookDeferred {
                subscription_id: subscription_id.to_string(),
            }
            .into()),
        }
    }

    /// Drop the lock entry for ids with no backing record, so forged or
    /// mistargeted webhooks cannot grow the registry without bound.
    fn discard_lock_if_unused(&self, subscription_id: &str, lock: &Arc<Mutex<()>>) {
        // Two handles means map entry plus ours; a concurrent waiter holds
        // a third and keeps the entry alive.
        self.locks.remove_if(subscription_id, |_, entry| {
            Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) <= 2
        });
    }

    /// Core transition logic. Caller must hold the per-subscription lock.
    async fn apply_locked(
        &self,
        subscription_id: &str,
        new_status: SubscriptionStatus,
        grant: bool,
        event_ts: Option<u64>,
    ) -> Result<ApplyOutcome> {
        let Some(record) = self.store.get_subscription(subscription_id).await? else {
            tracing::warn!(
                target: "countdeck::billing",
                subscription_id = subscription_id,
                status = %new_status,
                "Status update for unknown subscription"
            );
            return Ok(ApplyOutcome::UnknownSubscription);
        };

        if record.status.is_terminal() {
            tracing::debug!(
                target: "countdeck::billing",
                subscription_id = subscription_id,
                status = %new_status,
                "Dropping status update for cancelled subscription"
            );
            return Ok(ApplyOutcome::Terminal);
        }

        if let Some(ts) = event_ts {
            if ts < record.updated_at {
                tracing::debug!(
                    target: "countdeck::billing",
                    subscription_id = subscription_id,
                    event_ts = ts,
                    last_applied = record.updated_at,
                    "Dropping out-of-order status update"
                );
                return Ok(ApplyOutcome::Stale);
            }
        }

        if record.status == new_status {
            return Ok(ApplyOutcome::AlreadyCurrent);
        }

        let updated_at = event_ts.unwrap_or_else(unix_now);
        let cancelled_at = if new_status.is_terminal() {
            Some(updated_at)
        } else {
            None
        };
        self.store
            .update_subscription_status(subscription_id, new_status, updated_at, cancelled_at)
            .await?;

        tracing::info!(
            target: "countdeck::billing",
            subscription_id = subscription_id,
            from = %record.status,
            to = %new_status,
            "Subscription status updated"
        );

        if grant && new_status.grants_entitlement() {
            self.grant_for_plan(&record.user_id, &record.plan_id).await?;
        }

        Ok(ApplyOutcome::Updated)
    }

    /// Add the plan's service name to the user's entitlement set.
    ///
    /// A missing plan is a data inconsistency, not a reason to lose the
    /// status update; it is logged and the grant skipped.
    async fn grant_for_plan(&self, user_id: &str, plan_id: &str) -> Result<()> {
        match self.store.get_plan(plan_id).await? {
            Some(plan) => {
                self.store.grant_service(user_id, &plan.name).await?;
                tracing::info!(
                    target: "countdeck::billing",
                    user_id = user_id,
                    service = %plan.name,
                    "Entitlement granted"
                );
            }
            None => {
                tracing::warn!(
                    target: "countdeck::billing",
                    user_id = user_id,
                    plan_id = plan_id,
                    "Plan missing during entitlement grant"
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Create a new subscription for a user.
    ///
    /// Rejects with a conflict when the user already holds an Active
    /// subscription to the plan. The gateway subscription is created first;
    /// the local record is inserted in `Pending` only after the gateway
    /// confirms, so no orphan local records are ever produced.
    pub async fn create_subscription(
        &self,
        user_id: &str,
        customer_email: &str,
        plan_id: &str,
        subscription_type: SubscriptionType,
    ) -> Result<SubscriptionRecord> {
        let plan = self.store.get_plan(plan_id).await?.ok_or_else(|| {
            BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            }
        })?;

        if self
            .store
            .find_active_subscription(user_id, plan_id)
            .await?
            .is_some()
        {
            return Err(BillingError::DuplicateActiveSubscription {
                user_id: user_id.to_string(),
                plan_id: plan_id.to_string(),
            }
            .into());
        }

        let mut notes = HashMap::new();
        notes.insert("user_id".to_string(), user_id.to_string());
        notes.insert("email".to_string(), customer_email.to_string());

        let remote = self
            .gateway_call(
                "create_subscription",
                self.gateway.create_subscription(CreateSubscriptionRequest {
                    plan_id: plan_id.to_string(),
                    total_count: subscription_type.cycle_count(),
                    customer_notify: true,
                    notes,
                }),
            )
            .await?;

        let now = unix_now();
        let record = SubscriptionRecord {
            subscription_id: remote.id,
            user_id: user_id.to_string(),
            plan_id: plan_id.to_string(),
            status: SubscriptionStatus::Pending,
            amount: plan.amount * i64::from(subscription_type.cycle_count()),
            currency: self.config.currency.clone(),
            customer_email: customer_email.to_string(),
            subscription_type,
            payment_link: remote.short_url,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            start_date: now,
            end_date: now + subscription_type.duration_days() * 86_400,
        };
        self.store.insert_subscription(&record).await?;

        tracing::info!(
            target: "countdeck::billing",
            subscription_id = %record.subscription_id,
            user_id = user_id,
            plan_id = plan_id,
            subscription_type = %subscription_type,
            "Subscription created"
        );

        Ok(record)
    }

    /// Cancel a user's active subscription.
    ///
    /// Gateway first, local second: the gateway cancel must succeed before
    /// any local state changes, so a gateway failure leaves the record
    /// untouched and the user can retry. The record is re-read under the
    /// lock after the gateway confirms, because a webhook may have finished
    /// the cancellation in the meantime.
    pub async fn cancel(&self, user_id: &str, subscription_id: &str) -> Result<SubscriptionRecord> {
        // The lookup key is (owner, id, Active); anything else reads as
        // not-found so foreign and inactive records are indistinguishable.
        self.store
            .get_subscription(subscription_id)
            .await?
            .filter(|r| r.user_id == user_id && r.is_active())
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;

        self.gateway_call(
            "cancel_subscription",
            self.gateway.cancel_subscription(subscription_id),
        )
        .await?;

        let lock = self.lock_for(subscription_id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            })?;

        if !current.is_cancelled() {
            let now = unix_now();
            self.store
                .update_subscription_status(
                    subscription_id,
                    SubscriptionStatus::Cancelled,
                    now,
                    Some(now),
                )
                .await?;
        }

        self.revoke_for_plan(user_id, &current.plan_id, subscription_id)
            .await?;

        tracing::info!(
            target: "countdeck::billing",
            subscription_id = subscription_id,
            user_id = user_id,
            "Subscription cancelled"
        );

        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal {
                    message: format!("record vanished during cancel: {subscription_id}"),
                }
                .into()
            })
    }

    /// Remove the plan's service from the user's entitlement set, subject to
    /// the configured [`RevokePolicy`].
    async fn revoke_for_plan(
        &self,
        user_id: &str,
        plan_id: &str,
        cancelling_id: &str,
    ) -> Result<()> {
        let Some(plan) = self.store.get_plan(plan_id).await? else {
            tracing::warn!(
                target: "countdeck::billing",
                user_id = user_id,
                plan_id = plan_id,
                "Plan missing during entitlement revoke"
            );
            return Ok(());
        };

        if self.config.revoke_policy == RevokePolicy::KeepIfShared {
            for other in self.store.list_subscriptions(user_id).await? {
                if other.subscription_id == cancelling_id || !other.is_active() {
                    continue;
                }
                let shares_service = match self.store.get_plan(&other.plan_id).await? {
                    Some(other_plan) => other_plan.name == plan.name,
                    None => false,
                };
                if shares_service {
                    tracing::info!(
                        target: "countdeck::billing",
                        user_id = user_id,
                        service = %plan.name,
                        kept_by = %other.subscription_id,
                        "Entitlement kept, still granted by another subscription"
                    );
                    return Ok(());
                }
            }
        }

        self.store.revoke_service(user_id, &plan.name).await?;
        tracing::info!(
            target: "countdeck::billing",
            user_id = user_id,
            service = %plan.name,
            "Entitlement revoked"
        );
        Ok(())
    }

    /// Reconcile all of a user's subscriptions against the gateway.
    ///
    /// Read-path semantics: every failure is logged and the record skipped,
    /// so one bad fetch never blocks the rest. Cancelled records are not
    /// polled. The gateway's status-change timestamp goes through the same
    /// ordering guard as webhook timestamps, so a fetch racing a newer
    /// webhook cannot roll the record back. Returns the number of records
    /// whose status changed.
    pub async fn sync_all(&self, user_id: &str) -> Result<usize> {
        let records = self.store.list_subscriptions(user_id).await?;
        let grant = self.config.sync_grants == SyncGrants::GrantOnActivate;
        let mut changed = 0;

        for record in records {
            if record.is_cancelled() {
                continue;
            }

            let remote = match self
                .gateway_call(
                    "fetch_subscription",
                    self.gateway.fetch_subscription(&record.subscription_id),
                )
                .await
            {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(
                        target: "countdeck::billing",
                        subscription_id = %record.subscription_id,
                        error = %e,
                        "Skipping subscription during sync, gateway fetch failed"
                    );
                    continue;
                }
            };

            let Some(remote_status) = SubscriptionStatus::from_gateway(&remote.status) else {
                tracing::warn!(
                    target: "countdeck::billing",
                    subscription_id = %record.subscription_id,
                    remote_status = %remote.status,
                    "Skipping subscription during sync, unrecognized gateway status"
                );
                continue;
            };

            if remote_status == record.status {
                continue;
            }

            let outcome = self
                .apply_remote_status(
                    &record.subscription_id,
                    remote_status,
                    grant,
                    remote.status_changed_at,
                )
                .await?;
            if outcome == ApplyOutcome::Updated {
                changed += 1;
            }
        }

        Ok(changed)
    }

    /// List a user's subscriptions, freshly reconciled against the gateway.
    pub async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<SubscriptionRecord>> {
        self.sync_all(user_id).await?;
        self.store.list_subscriptions(user_id).await
    }
}
