//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! GET  /health                              - Liveness
//! GET  /health/ready                        - Readiness (order store reachable)
//!
//! # Payments
//! POST /api/v1/checkout                     - Start a checkout (user)
//! GET  /api/v1/payment/success?session_id=  - Success redirect target
//! GET  /api/v1/payment/cancel               - Cancel redirect target
//! POST /api/v1/webhooks/stripe              - Gateway webhooks (signed)
//!
//! # Profile (requires auth)
//! GET  /api/v1/profile/orders               - Caller's orders
//! GET  /api/v1/profile/orders/{id}          - One of the caller's orders
//!
//! # Admin (requires admin role)
//! GET  /api/v1/admin/orders                 - Paginated order list
//! POST /api/v1/admin/orders/{id}/deliver    - paid -> delivered
//! POST /api/v1/admin/orders/{id}/refund     - Gateway refund, -> refunded
//! ```

pub mod admin;
pub mod orders;
pub mod payments;

use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultOnResponse, OnResponse, TraceLayer};
use tracing::Span;

use crate::state::AppState;

/// Largest webhook body accepted.
pub const WEBHOOK_BODY_LIMIT: usize = 64 * 1024;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .nest("/api/v1", api_routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri().path(),
                        status = tracing::field::Empty,
                        latency_ms = tracing::field::Empty,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: Duration, span: &Span| {
                        span.record("status", response.status().as_u16());
                        span.record(
                            "latency_ms",
                            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                        );
                        DefaultOnResponse::default().on_response(response, latency, span);
                    },
                ),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(payments::start_checkout))
        .route("/payment/success", get(payments::payment_success))
        .route("/payment/cancel", get(payments::payment_cancel))
        .route(
            "/webhooks/stripe",
            post(payments::stripe_webhook).layer(RequestBodyLimitLayer::new(WEBHOOK_BODY_LIMIT)),
        )
        .route("/profile/orders", get(orders::list))
        .route("/profile/orders/{id}", get(orders::show))
        .route("/admin/orders", get(admin::list_orders))
        .route("/admin/orders/{id}/deliver", post(admin::deliver))
        .route("/admin/orders/{id}/refund", post(admin::refund))
}

/// Liveness health check. Does not check dependencies.
async fn health() -> &'static str {
    "ok"
}

/// Readiness health check.
///
/// Returns 503 Service Unavailable if the order store is not reachable.
async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.orders().health_check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
