//! HTTP surface for the billing subsystem.
//!
//! Thin handlers only: authentication goes through the [`Authenticator`]
//! seam, everything else is delegated to the billing managers. The webhook
//! endpoint reads the raw body because the signature covers the exact bytes.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::auth::{Authenticator, CurrentUser, bearer_token};
use crate::billing::{
    BillingGateway, BillingStore, EntitlementsManager, NewPlan, PlanManager, Reconciler,
    StoredPlan, SubscriptionRecord, SubscriptionType, WebhookHandler, WebhookOutcome,
    SIGNATURE_HEADER,
};
use crate::error::{CountdeckError, Result};

/// Shared state for the billing routes.
pub struct AppState<S, G> {
    pub reconciler: Arc<Reconciler<S, G>>,
    pub webhook: Arc<WebhookHandler<S, G>>,
    pub plans: Arc<PlanManager<S, G>>,
    pub entitlements: Arc<EntitlementsManager<S>>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl<S, G> Clone for AppState<S, G> {
    fn clone(&self) -> Self {
        Self {
            reconciler: Arc::clone(&self.reconciler),
            webhook: Arc::clone(&self.webhook),
            plans: Arc::clone(&self.plans),
            entitlements: Arc::clone(&self.entitlements),
            authenticator: Arc::clone(&self.authenticator),
        }
    }
}

/// Build the billing router.
pub fn router<S, G>(state: AppState<S, G>) -> Router
where
    S: BillingStore + 'static,
    G: BillingGateway + 'static,
{
    Router::new()
        .route("/subscriptions", post(create_subscription::<S, G>))
        .route("/subscriptions", get(list_subscriptions::<S, G>))
        .route(
            "/subscriptions/:id/cancel",
            post(cancel_subscription::<S, G>),
        )
        .route("/me/services", get(my_services::<S, G>))
        .route("/plans", get(list_plans::<S, G>))
        .route("/plans", post(create_plan::<S, G>))
        .route("/webhooks/billing", post(billing_webhook::<S, G>))
        .with_state(state)
}

async fn authenticate<S, G>(state: &AppState<S, G>, headers: &HeaderMap) -> Result<CurrentUser> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = bearer_token(header)?;
    state.authenticator.authenticate(token).await
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateSubscriptionBody {
    plan_id: String,
    subscription_type: String,
}

async fn create_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<(StatusCode, Json<SubscriptionRecord>)>
where
    S: BillingStore,
    G: BillingGateway,
{
    let user = authenticate(&state, &headers).await?;
    let subscription_type = SubscriptionType::parse(&body.subscription_type).ok_or_else(|| {
        CountdeckError::bad_request(format!(
            "Invalid subscription type: {}",
            body.subscription_type
        ))
    })?;

    let record = state
        .reconciler
        .create_subscription(&user.id, &user.email, &body.plan_id, subscription_type)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_subscriptions<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SubscriptionRecord>>>
where
    S: BillingStore,
    G: BillingGateway,
{
    let user = authenticate(&state, &headers).await?;
    let records = state.reconciler.list_subscriptions(&user.id).await?;
    Ok(Json(records))
}

async fn cancel_subscription<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SubscriptionRecord>>
where
    S: BillingStore,
    G: BillingGateway,
{
    let user = authenticate(&state, &headers).await?;
    let record = state.reconciler.cancel(&user.id, &id).await?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct ServicesResponse {
    subscribed_services: BTreeSet<String>,
}

async fn my_services<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
) -> Result<Json<ServicesResponse>>
where
    S: BillingStore,
    G: BillingGateway,
{
    let user = authenticate(&state, &headers).await?;
    let subscribed_services = state.entitlements.subscribed_services(&user.id).await?;
    Ok(Json(ServicesResponse {
        subscribed_services,
    }))
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreatePlanBody {
    name: String,
    amount: i64,
    #[serde(default = "default_currency")]
    currency: String,
    period: String,
    interval: u32,
    #[serde(default)]
    description: Option<String>,
}

fn default_currency() -> String {
    "INR".to_string()
}

async fn create_plan<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    Json(body): Json<CreatePlanBody>,
) -> Result<(StatusCode, Json<StoredPlan>)>
where
    S: BillingStore,
    G: BillingGateway,
{
    let user = authenticate(&state, &headers).await?;
    if !user.is_admin {
        return Err(CountdeckError::forbidden("Admin access required"));
    }

    let plan = state
        .plans
        .create_plan(
            &user.name,
            NewPlan {
                name: body.name,
                amount: body.amount,
                currency: body.currency,
                period: body.period,
                interval: body.interval,
                description: body.description,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn list_plans<S, G>(
    State(state): State<AppState<S, G>>,
) -> Result<Json<Vec<StoredPlan>>>
where
    S: BillingStore,
    G: BillingGateway,
{
    Ok(Json(state.plans.list_plans().await?))
}

// ============================================================================
// Webhook
// ============================================================================

#[derive(Debug, Serialize)]
struct WebhookAck {
    status: &'static str,
}

async fn billing_webhook<S, G>(
    State(state): State<AppState<S, G>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse>
where
    S: BillingStore,
    G: BillingGateway,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.webhook.handle(&body, signature).await?;
    let status = match outcome {
        WebhookOutcome::Processed(_) => "processed",
        WebhookOutcome::Ignored { .. } => "ignored",
    };
    Ok(Json(WebhookAck { status }))
}
