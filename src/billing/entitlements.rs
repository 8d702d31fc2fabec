//! Entitlement queries and access guards.
//!
//! Entitlements are a per-user set of service names, mutated only by the
//! reconciler. This module is the read side: feature routes ask it whether
//! a user may use a service.

use crate::error::{CountdeckError, Result};
use std::collections::BTreeSet;

use super::storage::BillingStore;

/// Read-side view over a user's entitlements.
pub struct EntitlementsManager<S> {
    store: S,
}

impl<S> EntitlementsManager<S>
where
    S: BillingStore,
{
    /// Create a new entitlements manager.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The user's current entitlement set.
    pub async fn subscribed_services(&self, user_id: &str) -> Result<BTreeSet<String>> {
        self.store.subscribed_services(user_id).await
    }

    /// Whether the user is entitled to a service.
    pub async fn has_service(&self, user_id: &str, service: &str) -> Result<bool> {
        Ok(self.store.subscribed_services(user_id).await?.contains(service))
    }

    /// Gate an operation on an entitlement.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` when the user does not hold the service.
    pub async fn require_service(&self, user_id: &str, service: &str) -> Result<()> {
        if self.has_service(user_id, service).await? {
            return Ok(());
        }
        tracing::debug!(
            target: "countdeck::billing",
            user_id = user_id,
            service = service,
            "Access denied, service not in entitlement set"
        );
        Err(CountdeckError::Forbidden(format!(
            "An active subscription to '{service}' is required"
        )))
    }
}
