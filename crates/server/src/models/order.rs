//! Order domain types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use template_store_core::{CurrencyCode, ExternalReference, OrderId, OrderStatus, TemplateId, UserId};

/// One purchase attempt of one template by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: OrderId,
    /// Owning user. Never changes after creation.
    pub user_id: UserId,
    /// Purchased template. Never changes after creation.
    pub template_id: TemplateId,
    /// Gateway session or payment-intent ID this order was created for.
    pub external_reference: ExternalReference,
    /// Payment-intent ID learned once a hosted checkout completes.
    pub payment_reference: Option<String>,
    pub status: OrderStatus,
    /// Last payment message or failure reason. Overwritten on every transition.
    pub status_detail: String,
    /// Charged amount in the currency's smallest unit.
    pub amount_minor: i64,
    pub currency: CurrencyCode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Payment-intent ID usable for refunds, if one is known locally.
    #[must_use]
    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_reference.as_deref().or_else(|| {
            self.external_reference
                .is_payment_intent()
                .then(|| self.external_reference.as_str())
        })
    }
}

/// Fields for inserting a new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: UserId,
    pub template_id: TemplateId,
    pub external_reference: ExternalReference,
    pub payment_reference: Option<String>,
    /// `pending` from checkout; `paid` only when reconstructed from a gateway event.
    pub status: OrderStatus,
    pub status_detail: String,
    pub amount_minor: i64,
    pub currency: CurrencyCode,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn order(external: &str, payment: Option<&str>) -> Order {
        let now = Utc::now();
        Order {
            id: OrderId::new(1),
            user_id: UserId::new(7),
            template_id: TemplateId::new(3),
            external_reference: ExternalReference::parse(external).unwrap(),
            payment_reference: payment.map(String::from),
            status: OrderStatus::Paid,
            status_detail: String::new(),
            amount_minor: 4999,
            currency: CurrencyCode::Usd,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_payment_intent_prefers_recorded_reference() {
        assert_eq!(
            order("cs_test_1", Some("pi_1")).payment_intent_id(),
            Some("pi_1")
        );
    }

    #[test]
    fn test_payment_intent_falls_back_to_intent_reference() {
        assert_eq!(order("pi_9", None).payment_intent_id(), Some("pi_9"));
        assert_eq!(order("cs_test_1", None).payment_intent_id(), None);
    }
}
