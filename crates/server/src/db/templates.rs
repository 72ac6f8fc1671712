//! Template catalog lookups.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;

use template_store_core::TemplateId;

use super::{RepositoryError, TemplateCatalog};
use crate::models::Template;

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    id: i32,
    name: String,
    price: Decimal,
}

impl From<TemplateRow> for Template {
    fn from(row: TemplateRow) -> Self {
        Self {
            id: TemplateId::new(row.id),
            name: row.name,
            price: row.price,
        }
    }
}

/// `TemplateCatalog` backed by `store.templates`.
#[derive(Debug, Clone)]
pub struct PgTemplateCatalog {
    pool: PgPool,
}

impl PgTemplateCatalog {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateCatalog for PgTemplateCatalog {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r"
            SELECT id, name, price
            FROM store.templates
            WHERE id = $1 AND deleted_at IS NULL
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}
