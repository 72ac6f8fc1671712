//! Order administration commands.
//!
//! These go through the same reconciler as the HTTP admin routes, so the
//! status guards and the gateway refund behave identically.
//!
//! # Environment Variables
//!
//! The full server configuration (database, Stripe, JWT) is required; see
//! `template_store_server::config`.

use thiserror::Error;

use template_store_core::OrderId;
use template_store_server::{
    config::{ConfigError, ServerConfig},
    db::{self, Page, RepositoryError},
    services::ReconcileError,
    state::{AppState, StateError},
};

#[derive(Debug, Error)]
pub enum OrderCommandError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Initialization error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

async fn connect() -> Result<AppState, OrderCommandError> {
    let config = ServerConfig::from_env()?;
    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;
    Ok(AppState::from_config(&config, pool)?)
}

/// Print orders as JSON, newest first.
pub async fn list(limit: Option<i64>, offset: Option<i64>) -> Result<(), OrderCommandError> {
    let state = connect().await?;
    let orders = state.orders().list(Page::new(limit, offset)).await?;

    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string_pretty(&orders)?);
    }
    Ok(())
}

/// Move a paid order to delivered.
pub async fn deliver(id: OrderId) -> Result<(), OrderCommandError> {
    let state = connect().await?;
    let order = state.reconciler().mark_delivered(id).await?;
    tracing::info!("Order {} is now {}", order.id, order.status);
    Ok(())
}

/// Refund an order at the gateway and mark it refunded.
pub async fn refund(id: OrderId, reason: Option<&str>) -> Result<(), OrderCommandError> {
    let state = connect().await?;
    let order = state.reconciler().refund(id, reason).await?;
    tracing::info!("Order {} is now {}: {}", order.id, order.status, order.status_detail);
    Ok(())
}
