//! Customer order history.

use axum::{
    Json,
    extract::{Path, State},
};

use template_store_core::{OrderId, UserId};

use crate::db::RepositoryError;
use crate::error::AppError;
use crate::models::{AuthUser, Order};
use crate::state::AppState;

/// Map the caller to a local user ID.
async fn caller_id(state: &AppState, user: &AuthUser) -> Result<UserId, AppError> {
    if let Some(id) = user.user_id {
        return Ok(id);
    }
    state
        .users()
        .get_by_subject(&user.subject)
        .await?
        .map(|u| u.id)
        .ok_or_else(|| AppError::Forbidden("no store account for this caller".to_string()))
}

/// The caller's orders, newest first.
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<Order>>, AppError> {
    let user_id = caller_id(&state, &user).await?;
    Ok(Json(state.orders().list_by_user(user_id).await?))
}

/// One of the caller's orders. Other users' orders are reported as missing.
pub async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<OrderId>,
) -> Result<Json<Order>, AppError> {
    let user_id = caller_id(&state, &user).await?;
    let not_found = || AppError::NotFound(format!("order {id}"));

    let order = match state.orders().get(id).await {
        Ok(order) => order,
        Err(RepositoryError::NotFound) => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };

    if order.user_id != user_id {
        return Err(not_found());
    }
    Ok(Json(order))
}
