//! Subscription billing against an external payment gateway.
//!
//! The centerpiece is the [`Reconciler`]: the single owner of subscription
//! status transitions and their entitlement side-effects. Remote state
//! reaches it through signed webhooks ([`WebhookHandler`]) and on-demand
//! polling; user actions reach it through the lifecycle operations.
//!
//! Storage and gateway access sit behind traits so the whole module runs
//! in-process for tests (`test-billing` feature exposes the doubles to
//! downstream crates).

pub mod entitlements;
pub mod error;
pub mod gateway;
pub mod live_gateway;
pub mod plans;
pub mod reconciler;
pub mod storage;
pub mod webhook;

pub use entitlements::EntitlementsManager;
pub use error::BillingError;
pub use gateway::{
    BillingGateway, CreatePlanRequest, CreateSubscriptionRequest, GatewayPlan, GatewaySubscription,
};
pub use live_gateway::{InvalidGatewayKeyError, LiveGateway, LiveGatewayConfig};
pub use plans::{NewPlan, PlanManager};
pub use reconciler::{ApplyOutcome, Reconciler, ReconcilerConfig, RevokePolicy, SyncGrants};
pub use storage::{
    BillingStore, StoredPlan, SubscriptionRecord, SubscriptionStatus, SubscriptionType,
};
pub use webhook::{verify_signature, WebhookHandler, WebhookOutcome, SIGNATURE_HEADER};
