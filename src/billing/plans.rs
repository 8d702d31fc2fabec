//! Plan administration.
//!
//! Plans are created at the gateway first and mirrored locally; the local
//! copy keeps amounts in major currency units while the gateway deals in
//! minor units. Listing reconciles the local mirror with the gateway but
//! degrades to the mirror when the gateway is unreachable.

use crate::error::Result;
use std::time::Duration;

use super::error::BillingError;
use super::gateway::{BillingGateway, CreatePlanRequest};
use super::storage::{BillingStore, StoredPlan};

/// Request to create a plan, amounts in major currency units.
#[derive(Debug, Clone)]
pub struct NewPlan {
    /// Display name; also the entitlement/service name.
    pub name: String,
    /// Per-cycle amount in major currency units.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Billing period ("monthly", "yearly", ...).
    pub period: String,
    /// Billing interval within the period.
    pub interval: u32,
    /// Optional description.
    pub description: Option<String>,
}

/// Plan administration over a store and gateway.
pub struct PlanManager<S, G> {
    store: S,
    gateway: G,
    gateway_timeout: Duration,
}

impl<S, G> PlanManager<S, G>
where
    S: BillingStore,
    G: BillingGateway,
{
    /// Create a new plan manager.
    #[must_use]
    pub fn new(store: S, gateway: G, gateway_timeout: Duration) -> Self {
        Self {
            store,
            gateway,
            gateway_timeout,
        }
    }

    async fn gateway_call<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.gateway_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BillingError::GatewayApi {
                operation: operation.to_string(),
                message: format!("request timed out after {}s", self.gateway_timeout.as_secs()),
                http_status: None,
            }
            .into()),
        }
    }

    /// Create a plan at the gateway and mirror it locally.
    ///
    /// Write-path semantics: a gateway failure aborts the whole operation
    /// and nothing is persisted.
    pub async fn create_plan(&self, created_by: &str, plan: NewPlan) -> Result<StoredPlan> {
        if plan.amount <= 0 {
            return Err(crate::error::CountdeckError::BadRequest(
                "plan amount must be positive".to_string(),
            ));
        }

        let remote = self
            .gateway_call(
                "create_plan",
                self.gateway.create_plan(CreatePlanRequest {
                    period: plan.period.clone(),
                    interval: plan.interval,
                    name: plan.name.clone(),
                    // Gateway expects minor currency units.
                    amount: plan.amount * 100,
                    currency: plan.currency,
                    description: plan.description.clone(),
                }),
            )
            .await?;

        let stored = StoredPlan {
            plan_id: remote.id,
            name: plan.name,
            amount: plan.amount,
            period: plan.period,
            interval: plan.interval,
            description: plan.description,
            created_by: Some(created_by.to_string()),
        };
        self.store.upsert_plan(&stored).await?;

        tracing::info!(
            target: "countdeck::billing",
            plan_id = %stored.plan_id,
            name = %stored.name,
            created_by = created_by,
            "Plan created"
        );

        Ok(stored)
    }

    /// List plans, refreshing the local mirror from the gateway.
    ///
    /// Plans the gateway knows but the mirror does not are upserted. When
    /// the gateway is unreachable the mirror is served as-is.
    pub async fn list_plans(&self) -> Result<Vec<StoredPlan>> {
        match self
            .gateway_call("list_plans", self.gateway.list_plans())
            .await
        {
            Ok(remote_plans) => {
                for remote in remote_plans {
                    if self.store.get_plan(&remote.id).await?.is_none() {
                        let stored = StoredPlan {
                            plan_id: remote.id,
                            name: remote.name,
                            amount: remote.amount / 100,
                            period: remote.period,
                            interval: remote.interval,
                            description: remote.description,
                            created_by: None,
                        };
                        self.store.upsert_plan(&stored).await?;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "countdeck::billing",
                    error = %e,
                    "Serving local plan mirror, gateway listing failed"
                );
            }
        }

        self.store.list_plans().await
    }

    /// Get a single plan from the local mirror.
    pub async fn get_plan(&self, plan_id: &str) -> Result<StoredPlan> {
        self.store.get_plan(plan_id).await?.ok_or_else(|| {
            BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            }
            .into()
        })
    }
}
