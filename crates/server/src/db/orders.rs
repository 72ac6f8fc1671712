//! Postgres order store.
//!
//! Queries use runtime-checked `query_as` so the crate builds without a live
//! database; row types convert into domain types and report bad rows as
//! `DataCorruption`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use template_store_core::{
    CurrencyCode, ExternalReference, OrderId, OrderStatus, TemplateId, UserId,
};

use super::{OrderStore, Page, RepositoryError, map_unique_violation};
use crate::models::{NewOrder, Order};

// =============================================================================
// Internal Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: i32,
    user_id: i32,
    template_id: i32,
    external_reference: String,
    payment_reference: Option<String>,
    status: String,
    status_detail: String,
    amount_minor: i64,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let external_reference = ExternalReference::parse(&row.external_reference).map_err(|e| {
            RepositoryError::DataCorruption(format!("order {}: invalid reference: {e}", row.id))
        })?;
        let status = row.status.parse::<OrderStatus>().map_err(|e| {
            RepositoryError::DataCorruption(format!("order {}: {e}", row.id))
        })?;
        let currency = row.currency.parse::<CurrencyCode>().map_err(|e| {
            RepositoryError::DataCorruption(format!("order {}: {e}", row.id))
        })?;

        Ok(Self {
            id: OrderId::new(row.id),
            user_id: UserId::new(row.user_id),
            template_id: TemplateId::new(row.template_id),
            external_reference,
            payment_reference: row.payment_reference,
            status,
            status_detail: row.status_detail,
            amount_minor: row.amount_minor,
            currency,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn one(row: Option<OrderRow>) -> Result<Order, RepositoryError> {
    row.ok_or(RepositoryError::NotFound)?.try_into()
}

fn many(rows: Vec<OrderRow>) -> Result<Vec<Order>, RepositoryError> {
    rows.into_iter().map(TryInto::try_into).collect()
}

// =============================================================================
// Store
// =============================================================================

/// `OrderStore` backed by the `store.orders` table.
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self, order), fields(reference = %order.external_reference))]
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            INSERT INTO store.orders
                (user_id, template_id, external_reference, payment_reference,
                 status, status_detail, amount_minor, currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, user_id, template_id, external_reference, payment_reference,
                      status, status_detail, amount_minor, currency, created_at, updated_at
            ",
        )
        .bind(order.user_id)
        .bind(order.template_id)
        .bind(order.external_reference.as_str())
        .bind(order.payment_reference.as_deref())
        .bind(order.status.as_str())
        .bind(&order.status_detail)
        .bind(order.amount_minor)
        .bind(order.currency.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, "external reference"))?;

        row.try_into()
    }

    async fn get(&self, id: OrderId) -> Result<Order, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, user_id, template_id, external_reference, payment_reference,
                   status, status_detail, amount_minor, currency, created_at, updated_at
            FROM store.orders
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        one(row)
    }

    async fn get_by_reference(
        &self,
        reference: &ExternalReference,
    ) -> Result<Order, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, user_id, template_id, external_reference, payment_reference,
                   status, status_detail, amount_minor, currency, created_at, updated_at
            FROM store.orders
            WHERE external_reference = $1 AND deleted_at IS NULL
            ",
        )
        .bind(reference.as_str())
        .fetch_optional(&self.pool)
        .await?;

        one(row)
    }

    async fn get_by_payment_reference(&self, reference: &str) -> Result<Order, RepositoryError> {
        // Not unique: a retried intent could in theory be attached twice; take the newest.
        let row = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, user_id, template_id, external_reference, payment_reference,
                   status, status_detail, amount_minor, currency, created_at, updated_at
            FROM store.orders
            WHERE payment_reference = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        one(row)
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, user_id, template_id, external_reference, payment_reference,
                   status, status_detail, amount_minor, currency, created_at, updated_at
            FROM store.orders
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        many(rows)
    }

    async fn list(&self, page: Page) -> Result<Vec<Order>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT id, user_id, template_id, external_reference, payment_reference,
                   status, status_detail, amount_minor, currency, created_at, updated_at
            FROM store.orders
            WHERE deleted_at IS NULL
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            ",
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        many(rows)
    }

    #[instrument(skip(self, detail), fields(order_id = %id, to = %to))]
    async fn transition(
        &self,
        id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        detail: &str,
        payment_reference: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError> {
        let from: Vec<&str> = from.iter().map(OrderStatus::as_str).collect();

        let row = sqlx::query_as::<_, OrderRow>(
            r"
            UPDATE store.orders
            SET status = $3,
                status_detail = $4,
                payment_reference = COALESCE(payment_reference, $5),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2) AND deleted_at IS NULL
            RETURNING id, user_id, template_id, external_reference, payment_reference,
                      status, status_detail, amount_minor, currency, created_at, updated_at
            ",
        )
        .bind(id)
        .bind(from)
        .bind(to.as_str())
        .bind(detail)
        .bind(payment_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
