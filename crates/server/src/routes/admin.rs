//! Admin order management.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use tracing::info;

use template_store_core::OrderId;

use crate::db::Page;
use crate::error::AppError;
use crate::middleware::RequireAdmin;
use crate::models::Order;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// All orders, newest first.
pub async fn list_orders(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let page = Page::new(query.limit, query.offset);
    Ok(Json(state.orders().list(page).await?))
}

/// Mark a paid order as delivered.
pub async fn deliver(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    let order = state.reconciler().mark_delivered(id).await?;
    info!(order_id = %id, admin = %admin.subject, "Admin delivered order");
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: Option<String>,
}

/// Refund a paid or delivered order.
pub async fn refund(
    State(state): State<AppState>,
    RequireAdmin(admin): RequireAdmin,
    Path(id): Path<OrderId>,
    body: Option<Json<RefundRequest>>,
) -> Result<Json<Order>, AppError> {
    let reason = body.and_then(|Json(r)| r.reason);
    let order = state.reconciler().refund(id, reason.as_deref()).await?;
    info!(order_id = %id, admin = %admin.subject, "Admin refunded order");
    Ok(Json(order))
}
