//! Persistence for orders and the read-only catalog/user lookups.
//!
//! # Schema: `store`
//!
//! - `users` - customers and administrators (read only here)
//! - `templates` - catalog entries with a flat price (read only here)
//! - `orders` - one row per purchase attempt, keyed for reconciliation by
//!   the unique `external_reference` column
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p template-store-cli -- migrate
//! ```
//!
//! Services depend on the traits below rather than on `PgPool`, so every
//! collaborator can be swapped for an in-memory fake in tests.

pub mod orders;
pub mod templates;
pub mod users;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use template_store_core::{ExternalReference, OrderId, OrderStatus, TemplateId, UserId};

use crate::models::{NewOrder, Order, Template, User};

pub use orders::PgOrderStore;
pub use templates::PgTemplateCatalog;
pub use users::PgUserDirectory;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., duplicate external reference).
    #[error("constraint violation: {0}")]
    Conflict(String),
}

/// Limit/offset window for admin listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    /// Build a page, clamping `limit` to `1..=100` and `offset` to `>= 0`.
    #[must_use]
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Order persistence.
///
/// `transition` is the only way an existing order's status changes. It must
/// be a single conditional write so that, of several concurrent callers,
/// exactly one observes `Some`.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a new order.
    ///
    /// Returns `RepositoryError::Conflict` if `external_reference` is taken.
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError>;

    /// Returns `RepositoryError::NotFound` if absent or soft-deleted.
    async fn get(&self, id: OrderId) -> Result<Order, RepositoryError>;

    /// Exact-match lookup on `external_reference`.
    async fn get_by_reference(
        &self,
        reference: &ExternalReference,
    ) -> Result<Order, RepositoryError>;

    /// Exact-match lookup on the recorded payment-intent ID.
    async fn get_by_payment_reference(&self, reference: &str) -> Result<Order, RepositoryError>;

    /// Orders of one user, newest first.
    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError>;

    /// All orders, newest first.
    async fn list(&self, page: Page) -> Result<Vec<Order>, RepositoryError>;

    /// Move `id` to `to` if its current status is one of `from`.
    ///
    /// `payment_reference` is recorded only if none is stored yet. Returns
    /// the updated order when this call applied the change, `None` otherwise.
    async fn transition(
        &self,
        id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        detail: &str,
        payment_reference: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError>;

    /// Cheap connectivity check for readiness.
    async fn health_check(&self) -> Result<(), RepositoryError>;
}

/// Read access to the template catalog.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError>;
}

/// Read access to users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError>;

    /// Resolve an identity-provider subject to a local user.
    async fn get_by_subject(&self, subject: &str) -> Result<Option<User>, RepositoryError>;
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Map a unique-constraint violation to `Conflict`, everything else to `Database`.
fn map_unique_violation(e: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return RepositoryError::Conflict(format!("{what} already exists"));
    }
    RepositoryError::Database(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_defaults() {
        assert_eq!(Page::default(), Page { limit: 20, offset: 0 });
    }

    #[test]
    fn test_page_clamps() {
        assert_eq!(Page::new(Some(500), Some(-3)), Page { limit: 100, offset: 0 });
        assert_eq!(Page::new(Some(0), Some(40)), Page { limit: 1, offset: 40 });
    }
}
