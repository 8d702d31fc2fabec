//! End-to-end billing flow through the HTTP surface.
//!
//! Drives the full lifecycle a paying user goes through: plan creation,
//! subscribe, webhook activation, entitlement checks, payment trouble,
//! recovery, cancel, and the guarantees around stale or forged input.

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use countdeck::auth::test::StaticAuthenticator;
use countdeck::billing::gateway::test::MockGateway;
use countdeck::billing::storage::test::InMemoryBillingStore;
use countdeck::{
    AppState, CurrentUser, EntitlementsManager, PlanManager, Reconciler, ReconcilerConfig,
    WebhookHandler, router,
};

const WEBHOOK_SECRET: &str = "whsec_integration_secret";
const USER_TOKEN: &str = "tok_user";
const ADMIN_TOKEN: &str = "tok_admin";

struct Harness {
    app: Router,
    gateway: MockGateway,
}

fn harness() -> Harness {
    let store = InMemoryBillingStore::new();
    let gateway = MockGateway::new();

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        gateway.clone(),
        ReconcilerConfig::default(),
    ));
    let webhook = Arc::new(WebhookHandler::new(
        Arc::clone(&reconciler),
        SecretString::from(WEBHOOK_SECRET),
    ));
    let plans = Arc::new(PlanManager::new(
        store.clone(),
        gateway.clone(),
        Duration::from_secs(5),
    ));
    let entitlements = Arc::new(EntitlementsManager::new(store.clone()));

    let authenticator = StaticAuthenticator::new();
    authenticator.add_user(
        USER_TOKEN,
        CurrentUser {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            name: "User One".to_string(),
            is_admin: false,
        },
    );
    authenticator.add_user(
        ADMIN_TOKEN,
        CurrentUser {
            id: "admin".to_string(),
            email: "admin@example.com".to_string(),
            name: "Admin".to_string(),
            is_admin: true,
        },
    );

    let app = router(AppState {
        reconciler,
        webhook,
        plans,
        entitlements,
        authenticator: Arc::new(authenticator),
    });

    Harness { app, gateway }
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn authed_json(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn webhook_request(body: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/billing")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(sig) = signature {
        builder = builder.header("X-Razorpay-Signature", sig);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

fn subscription_event(event: &str, subscription_id: &str, created_at: u64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "event": event,
        "created_at": created_at,
        "payload": {
            "subscription": { "entity": { "id": subscription_id } }
        }
    }))
    .unwrap()
}

async fn create_plan(h: &Harness) -> String {
    let (status, plan) = send(
        &h.app,
        authed_json(
            "POST",
            "/plans",
            ADMIN_TOKEN,
            json!({
                "name": "CountingPro",
                "amount": 1200,
                "period": "monthly",
                "interval": 1,
                "description": "Pro counting tier"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    plan["plan_id"].as_str().unwrap().to_string()
}

async fn subscribe(h: &Harness, plan_id: &str) -> String {
    let (status, record) = send(
        &h.app,
        authed_json(
            "POST",
            "/subscriptions",
            USER_TOKEN,
            json!({ "plan_id": plan_id, "subscription_type": "monthly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(record["status"], "pending");
    record["subscription_id"].as_str().unwrap().to_string()
}

async fn services(h: &Harness) -> Vec<String> {
    let (status, body) = send(&h.app, authed_get("/me/services", USER_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    body["subscribed_services"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

#[tokio::test]
async fn full_subscription_lifecycle() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;
    let base = now() + 10;

    // Activation webhook grants the entitlement.
    let body = subscription_event("subscription.activated", &sub_id, base);
    let (status, ack) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "processed");
    assert_eq!(services(&h).await, vec!["CountingPro".to_string()]);

    // Redelivery of the same event changes nothing.
    let (status, _) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(services(&h).await, vec!["CountingPro".to_string()]);

    // Payment trouble: failed then halted, entitlement untouched.
    let body = serde_json::to_vec(&json!({
        "event": "payment.failed",
        "created_at": base + 10,
        "payload": { "payment": { "entity": { "id": "pay_1", "subscription_id": sub_id } } }
    }))
    .unwrap();
    let (status, _) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);

    let body = subscription_event("subscription.halted", &sub_id, base + 20);
    let (status, _) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);

    // A delayed duplicate of the old activation must not undo the halt.
    let stale = subscription_event("subscription.activated", &sub_id, base);
    let (status, _) = send(&h.app, webhook_request(&stale, Some(&sign(&stale)))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(subs[0]["status"], "halted");

    // Recovery reported by the gateway.
    let body = subscription_event("subscription.activated", &sub_id, base + 30);
    let (status, _) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);

    // Cancel: gateway first, then local terminal state and revoke.
    let (status, cancelled) = send(
        &h.app,
        authed_json(
            "POST",
            &format!("/subscriptions/{sub_id}/cancel"),
            USER_TOKEN,
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");
    assert!(cancelled["cancelled_at"].as_u64().is_some());
    assert!(services(&h).await.is_empty());

    // Late webhook after cancel is acknowledged but cannot resurrect.
    let body = subscription_event("subscription.activated", &sub_id, base + 40);
    let (status, _) = send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(subs[0]["status"], "cancelled");
    assert!(services(&h).await.is_empty());
}

#[tokio::test]
async fn webhook_is_rejected_without_valid_signature() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;

    let body = subscription_event("subscription.activated", &sub_id, now() + 10);

    let (status, _) = send(&h.app, webhook_request(&body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&h.app, webhook_request(&body, Some("deadbeef"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // No state was touched.
    let (_, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(subs[0]["status"], "pending");
    assert!(services(&h).await.is_empty());
}

#[tokio::test]
async fn duplicate_active_subscription_conflicts() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;

    let body = subscription_event("subscription.activated", &sub_id, now() + 10);
    send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;

    let (status, _) = send(
        &h.app,
        authed_json(
            "POST",
            "/subscriptions",
            USER_TOKEN,
            json!({ "plan_id": plan_id, "subscription_type": "yearly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn listing_syncs_against_gateway_state() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;

    // Missed webhook: the gateway knows the subscription went active.
    h.gateway.set_remote_status(&sub_id, "active");
    let (status, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(subs[0]["status"], "active");

    // Repeated listing converges with no further changes.
    let (_, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(subs[0]["status"], "active");
}

#[tokio::test]
async fn listing_degrades_when_gateway_is_down() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;

    h.gateway.fail_operation("fetch_subscription");
    let (status, subs) = send(&h.app, authed_get("/subscriptions", USER_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(subs[0]["subscription_id"], sub_id.as_str());
    assert_eq!(subs[0]["status"], "pending");
}

#[tokio::test]
async fn cancel_requires_gateway_confirmation() {
    let h = harness();
    let plan_id = create_plan(&h).await;
    let sub_id = subscribe(&h, &plan_id).await;

    let body = subscription_event("subscription.activated", &sub_id, now() + 10);
    send(&h.app, webhook_request(&body, Some(&sign(&body)))).await;

    h.gateway.fail_operation("cancel_subscription");
    let (status, _) = send(
        &h.app,
        authed_json(
            "POST",
            &format!("/subscriptions/{sub_id}/cancel"),
            USER_TOKEN,
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    // Local state and entitlements untouched; retry succeeds.
    assert_eq!(services(&h).await, vec!["CountingPro".to_string()]);
    h.gateway.clear_failure("cancel_subscription");
    let (status, _) = send(
        &h.app,
        authed_json(
            "POST",
            &format!("/subscriptions/{sub_id}/cancel"),
            USER_TOKEN,
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(services(&h).await.is_empty());
}

#[tokio::test]
async fn plan_creation_is_admin_only() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        authed_json(
            "POST",
            "/plans",
            USER_TOKEN,
            json!({ "name": "Sneaky", "amount": 1, "period": "monthly", "interval": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&h.app, authed_get("/subscriptions", "tok_unknown")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn plans_are_listed_publicly_with_mirror() {
    let h = harness();
    let plan_id = create_plan(&h).await;

    let request = Request::builder()
        .method("GET")
        .uri("/plans")
        .body(Body::empty())
        .unwrap();
    let (status, plans) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans[0]["plan_id"], plan_id.as_str());
    // Mirror stores major units even though the gateway deals in minor ones.
    assert_eq!(plans[0]["amount"], 1200);
}
