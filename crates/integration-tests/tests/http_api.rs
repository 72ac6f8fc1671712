//! HTTP surface tests: the real router over in-memory fakes.

#![allow(clippy::unwrap_used)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use template_store_core::{OrderStatus, UserRole};
use template_store_integration_tests::{
    ADMIN_ID, CUSTOMER_ID, CUSTOMER_SUBJECT, OTHER_CUSTOMER_ID, TestHarness, bearer,
    session_event,
};
use template_store_server::routes::{self, WEBHOOK_BODY_LIMIT};

fn app(h: &TestHarness) -> Router {
    routes::router(h.state.clone())
}

fn customer_token() -> String {
    bearer(CUSTOMER_ID, CUSTOMER_SUBJECT, UserRole::User)
}

fn admin_token() -> String {
    bearer(ADMIN_ID, "auth0|admin-1", UserRole::Admin)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn webhook(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/stripe")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len());
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn checkout(h: &TestHarness) -> Value {
    let (status, body) = send(
        app(h),
        post_json(
            "/api/v1/checkout",
            Some(&customer_token()),
            &json!({ "template_id": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

async fn pay(h: &TestHarness) {
    let session = h.pay_session("cs_test_1", "pi_http");
    let (body, signature) = h.sign(&session_event("checkout.session.completed", &session));
    let (status, _) = send(app(h), webhook(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoints() {
    let h = TestHarness::new();

    let response = app(&h).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");

    let (status, _) = send(app(&h), get("/health/ready", None)).await;
    assert_eq!(status, StatusCode::OK);
}

// =============================================================================
// Checkout and redirects
// =============================================================================

#[tokio::test]
async fn test_checkout_requires_auth() {
    let h = TestHarness::new();
    let (status, _) = send(
        app(&h),
        post_json("/api/v1/checkout", None, &json!({ "template_id": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.orders.count(), 0);
}

#[tokio::test]
async fn test_checkout_returns_hosted_page() {
    let h = TestHarness::new();
    let body = checkout(&h).await;

    assert_eq!(body["external_reference"], "cs_test_1");
    assert!(body["checkout_url"].as_str().unwrap().contains("cs_test_1"));
    assert!(body.get("client_secret").is_none());
    assert_eq!(h.orders.all()[0].status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_checkout_unknown_template_is_404() {
    let h = TestHarness::new();
    let (status, body) = send(
        app(&h),
        post_json(
            "/api/v1/checkout",
            Some(&customer_token()),
            &json!({ "template_id": 404, "flow": "payment_intent" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
    assert_eq!(h.orders.count(), 0);
}

#[tokio::test]
async fn test_checkout_gateway_failure_is_502() {
    let h = TestHarness::new();
    h.gateway.set_failing(true);
    let (status, body) = send(
        app(&h),
        post_json(
            "/api/v1/checkout",
            Some(&customer_token()),
            &json!({ "template_id": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Payment provider error");
    assert_eq!(h.orders.count(), 0);
}

#[tokio::test]
async fn test_success_redirect_reports_state() {
    let h = TestHarness::new();
    checkout(&h).await;

    let (status, _) = send(app(&h), get("/api/v1/payment/success", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        app(&h),
        get("/api/v1/payment/success?session_id=cs_test_1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");

    pay(&h).await;

    let (_, body) = send(
        app(&h),
        get("/api/v1/payment/success?session_id=cs_test_1", None),
    )
    .await;
    assert_eq!(body["status"], "paid");
    assert_eq!(body["message"], "Payment successful!");
    assert_eq!(body["order_id"], 1);
}

#[tokio::test]
async fn test_success_redirect_rejects_path_like_session_id() {
    let h = TestHarness::new();
    checkout(&h).await;
    let calls = h.orders.calls();

    let (status, body) = send(
        app(&h),
        get("/api/v1/payment/success?session_id=../../customers/cus_1", None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert_eq!(h.orders.calls(), calls);
}

#[tokio::test]
async fn test_cancel_redirect() {
    let h = TestHarness::new();
    let (status, body) = send(app(&h), get("/api/v1/payment/cancel", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Payment canceled.");
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_acknowledges_applied_and_duplicate() {
    let h = TestHarness::new();
    checkout(&h).await;
    let session = h.pay_session("cs_test_1", "pi_http");
    let (body, signature) = h.sign(&session_event("checkout.session.completed", &session));

    let (status, first) = send(app(&h), webhook(body.clone(), Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, json!({ "received": true, "outcome": "applied" }));

    let (status, second) = send(app(&h), webhook(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "already_settled");
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let h = TestHarness::new();
    checkout(&h).await;
    let calls = h.orders.calls();
    let session = h.pay_session("cs_test_1", "pi_http");
    let (body, _) = h.sign(&session_event("checkout.session.completed", &session));

    let (status, _) = send(app(&h), webhook(body.clone(), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app(&h), webhook(body, Some("t=1,v1=deadbeef"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(h.orders.calls(), calls);
}

#[tokio::test]
async fn test_webhook_body_limit() {
    let h = TestHarness::new();
    let body = vec![b' '; WEBHOOK_BODY_LIMIT + 1];
    let response = app(&h).oneshot(webhook(body, Some("t=1,v1=00"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(h.orders.calls(), 0);
}

// =============================================================================
// Profile
// =============================================================================

#[tokio::test]
async fn test_profile_lists_only_own_orders() {
    let h = TestHarness::new();
    checkout(&h).await;

    let (status, body) = send(app(&h), get("/api/v1/profile/orders", Some(&customer_token()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, body) = send(
        app(&h),
        get("/api/v1/profile/orders/1", Some(&customer_token())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["amount_minor"], 4999);

    let other = bearer(OTHER_CUSTOMER_ID, "auth0|customer-8", UserRole::User);
    let (status, _) = send(app(&h), get("/api/v1/profile/orders/1", Some(&other))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(app(&h), get("/api/v1/profile/orders", Some(&other))).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}

// =============================================================================
// Admin
// =============================================================================

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let h = TestHarness::new();

    let (status, _) = send(app(&h), get("/api/v1/admin/orders", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(app(&h), get("/api/v1/admin/orders", Some(&customer_token()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(app(&h), get("/api/v1/admin/orders?limit=500", Some(&admin_token()))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_admin_deliver_and_refund() {
    let h = TestHarness::new();
    checkout(&h).await;

    let (status, _) = send(
        app(&h),
        post_json("/api/v1/admin/orders/1/deliver", Some(&admin_token()), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    pay(&h).await;

    let (status, body) = send(
        app(&h),
        post_json("/api/v1/admin/orders/1/deliver", Some(&admin_token()), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "delivered");

    let (status, body) = send(
        app(&h),
        post_json(
            "/api/v1/admin/orders/1/refund",
            Some(&admin_token()),
            &json!({ "reason": "customer request" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "refunded");
    assert_eq!(h.gateway.refunds(), vec!["pi_http".to_string()]);

    let (status, _) = send(
        app(&h),
        post_json("/api/v1/admin/orders/99/deliver", Some(&admin_token()), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
