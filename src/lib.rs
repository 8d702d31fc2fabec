//! Countdeck - subscription billing and entitlement backend
//!
//! Backend core for the countdeck counting services: subscription lifecycle
//! against an external payment gateway, webhook-driven status reconciliation,
//! and the per-user entitlement sets that gate access to the paid services.
//!
//! # Features
//!
//! - **Reconciler**: idempotent, ordered subscription status transitions
//!   serialized per subscription id
//! - **Webhooks**: HMAC-verified gateway event ingestion with fail-closed
//!   semantics and deferred redelivery under contention
//! - **Entitlements**: set-based service grants with pluggable revoke policy
//! - **Plans**: admin plan creation mirrored between gateway and store
//! - **HTTP**: thin Axum routes over an injectable authenticator
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use countdeck::{BillingConfigBuilder, init_tracing};
//!
//! #[tokio::main]
//! async fn main() {
//!     init_tracing();
//!
//!     let config = BillingConfigBuilder::new().from_env().build();
//!     // Wire a store, LiveGateway, and authenticator, then serve
//!     // countdeck::routes::router(state).
//! }
//! ```

pub mod auth;
pub mod billing;
mod config;
mod error;
pub mod routes;

// Re-exports for public API
pub use auth::{Authenticator, CurrentUser};
pub use billing::{
    ApplyOutcome, BillingError, BillingGateway, BillingStore, EntitlementsManager, LiveGateway,
    LiveGatewayConfig, PlanManager, Reconciler, ReconcilerConfig, RevokePolicy, StoredPlan,
    SubscriptionRecord, SubscriptionStatus, SubscriptionType, SyncGrants, WebhookHandler,
    WebhookOutcome,
};
pub use config::{BillingConfig, BillingConfigBuilder};
pub use error::{CountdeckError, ErrorResponse, Result};
pub use routes::{AppState, router};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "countdeck=debug")
/// - `COUNTDECK_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("COUNTDECK_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
