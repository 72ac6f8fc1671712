//! Checkout, redirect and webhook handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use template_store_core::{OrderId, TemplateId};

use crate::error::AppError;
use crate::models::AuthUser;
use crate::payments::{CheckoutFlow, SIGNATURE_HEADER};
use crate::services::{CheckoutStarted, ConfirmationStatus};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub template_id: TemplateId,
    #[serde(default)]
    pub flow: CheckoutFlow,
}

/// Start a checkout for one template.
pub async fn start_checkout(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutStarted>), AppError> {
    let started = state
        .checkout()
        .start(&user, request.template_id, request.flow)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

#[derive(Debug, Deserialize)]
pub struct SuccessQuery {
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub status: ConfirmationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    pub message: &'static str,
}

/// Success redirect target. Reports, never assumes, the payment state.
pub async fn payment_success(
    State(state): State<AppState>,
    Query(query): Query<SuccessQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    let session_id = query
        .session_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("session_id is required".to_string()))?;

    let confirmation = state.reconciler().confirm_checkout(&session_id).await?;

    Ok(Json(SuccessResponse {
        status: confirmation.status,
        order_id: confirmation.order_id,
        message: confirmation.message(),
    }))
}

/// Cancel redirect target.
pub async fn payment_cancel() -> Json<Value> {
    Json(json!({ "message": "Payment canceled." }))
}

/// Gateway webhook endpoint. The body is verified as received, byte for byte.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let receipt = state.reconciler().handle_webhook(&body, signature).await?;

    info!(
        event_id = %receipt.event_id,
        event_type = %receipt.event_type,
        outcome = receipt.label(),
        "Webhook processed"
    );

    Ok(Json(json!({ "received": true, "outcome": receipt.label() })))
}
