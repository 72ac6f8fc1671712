//! Catalog template, as seen by checkout.

use rust_decimal::Decimal;
use serde::Serialize;

use template_store_core::TemplateId;

/// A purchasable document template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    /// Flat price in the store currency's standard unit.
    pub price: Decimal,
}
