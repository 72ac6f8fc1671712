//! Unified error handling for the HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::services::{CheckoutError, ReconcileError};

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    #[error("Checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Database(RepositoryError::NotFound) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Database(RepositoryError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Checkout(e) => match e {
                CheckoutError::TemplateNotFound(_) => StatusCode::NOT_FOUND,
                CheckoutError::UnknownUser => StatusCode::FORBIDDEN,
                CheckoutError::DuplicateReference(_) => StatusCode::CONFLICT,
                CheckoutError::Gateway(_) => StatusCode::BAD_GATEWAY,
                CheckoutError::InvalidPrice(_) | CheckoutError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Reconcile(e) => match e {
                ReconcileError::Signature(_) | ReconcileError::MalformedEvent(_) => {
                    StatusCode::BAD_REQUEST
                }
                ReconcileError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                ReconcileError::OrderNotFound(_) => StatusCode::NOT_FOUND,
                ReconcileError::InvalidTransition { .. }
                | ReconcileError::NoPaymentReference(_) => StatusCode::CONFLICT,
                ReconcileError::Gateway(_) => StatusCode::BAD_GATEWAY,
                ReconcileError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        }

        // Don't expose internal error details to clients
        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            StatusCode::BAD_GATEWAY => "Payment provider error".to_string(),
            StatusCode::SERVICE_UNAVAILABLE => "Temporarily unavailable, retry later".to_string(),
            _ => self.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use template_store_core::{OrderId, OrderStatus, TemplateId};

    use super::*;
    use crate::payments::{GatewayError, SignatureError};

    fn get_status(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_app_error_display() {
        let err = AppError::NotFound("order 123".to_string());
        assert_eq!(err.to_string(), "Not found: order 123");
    }

    #[test]
    fn test_webhook_error_status_codes() {
        assert_eq!(
            get_status(ReconcileError::Signature(SignatureError::Mismatch).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_status(ReconcileError::MalformedEvent("bad json".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_status(ReconcileError::Timeout("database").into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            get_status(ReconcileError::Store(RepositoryError::DataCorruption("x".into())).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_admin_error_status_codes() {
        assert_eq!(
            get_status(ReconcileError::OrderNotFound(OrderId::new(9)).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_status(
                ReconcileError::InvalidTransition {
                    id: OrderId::new(9),
                    from: OrderStatus::Pending,
                    to: OrderStatus::Delivered,
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            get_status(ReconcileError::Gateway(GatewayError::Request("down".into())).into()),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_checkout_error_status_codes() {
        assert_eq!(
            get_status(CheckoutError::TemplateNotFound(TemplateId::new(3)).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_status(CheckoutError::DuplicateReference("cs_1".into()).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            get_status(AppError::Forbidden("admin only".into())),
            StatusCode::FORBIDDEN
        );
    }
}
