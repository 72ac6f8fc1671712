//! Checkout initiation.
//!
//! Opens a gateway checkout for one template and records the matching
//! `pending` order. The order is written only after the gateway call
//! succeeds, so a gateway failure never leaves an orphaned pending row.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use template_store_core::{
    CurrencyCode, ExternalReference, OrderId, OrderStatus, Price, PriceError, TemplateId,
};

use crate::db::{OrderStore, RepositoryError, TemplateCatalog, UserDirectory};
use crate::models::{AuthUser, NewOrder, User};
use crate::payments::{
    CheckoutFlow, GatewayError, META_FLOW, META_TEMPLATE_ID, META_USER_ID, META_USER_SUBJECT,
    PaymentGateway, PaymentRequest,
};

/// Errors that can occur when starting a checkout.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("caller does not resolve to a store user")]
    UnknownUser,

    #[error("invalid template price: {0}")]
    InvalidPrice(#[from] PriceError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(RepositoryError),

    /// The gateway returned a reference that is already attached to an order.
    #[error("external reference {0} already recorded")]
    DuplicateReference(String),
}

/// Deployment-wide checkout settings.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    /// Public base URL, without trailing slash.
    pub base_url: String,
    pub currency: CurrencyCode,
}

impl CheckoutSettings {
    fn success_url(&self) -> String {
        format!(
            "{}/api/v1/payment/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.base_url
        )
    }

    fn cancel_url(&self) -> String {
        format!("{}/api/v1/payment/cancel", self.base_url)
    }
}

/// Result of a started checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutStarted {
    pub order_id: OrderId,
    pub external_reference: ExternalReference,
    /// Hosted checkout page (checkout flow).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_url: Option<String>,
    /// Client secret for client-side confirmation (payment-intent flow).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Starts checkouts.
#[derive(Clone)]
pub struct CheckoutService {
    orders: Arc<dyn OrderStore>,
    templates: Arc<dyn TemplateCatalog>,
    users: Arc<dyn UserDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    settings: CheckoutSettings,
}

impl CheckoutService {
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        templates: Arc<dyn TemplateCatalog>,
        users: Arc<dyn UserDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            orders,
            templates,
            users,
            gateway,
            settings,
        }
    }

    /// Open a checkout for `template_id` on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// See [`CheckoutError`]. No order exists after any error.
    #[instrument(skip(self, caller), fields(subject = %caller.subject, template_id = %template_id, flow = %flow))]
    pub async fn start(
        &self,
        caller: &AuthUser,
        template_id: TemplateId,
        flow: CheckoutFlow,
    ) -> Result<CheckoutStarted, CheckoutError> {
        let template = self
            .templates
            .get(template_id)
            .await
            .map_err(CheckoutError::Store)?
            .ok_or(CheckoutError::TemplateNotFound(template_id))?;

        let amount_minor = Price::new(template.price, self.settings.currency).minor_units()?;
        let user = self.resolve_user(caller).await?;

        let mut metadata = BTreeMap::from([
            (META_TEMPLATE_ID.to_string(), template.id.to_string()),
            (META_USER_ID.to_string(), user.id.to_string()),
            (META_FLOW.to_string(), flow.as_str().to_string()),
        ]);
        if let Some(subject) = &user.identity_subject {
            metadata.insert(META_USER_SUBJECT.to_string(), subject.clone());
        }

        let request = PaymentRequest {
            amount_minor,
            currency: self.settings.currency,
            description: template.name.clone(),
            metadata,
            success_url: self.settings.success_url(),
            cancel_url: self.settings.cancel_url(),
        };

        let (reference, checkout_url, client_secret) = match flow {
            CheckoutFlow::Checkout => {
                let session = self.gateway.create_checkout_session(&request).await?;
                (session.id, session.url, None)
            }
            CheckoutFlow::PaymentIntent => {
                let intent = self.gateway.create_payment_intent(&request).await?;
                (intent.id, None, intent.client_secret)
            }
        };

        let external_reference = ExternalReference::parse(&reference).map_err(|e| {
            GatewayError::Response(format!("gateway returned unusable id {reference:?}: {e}"))
        })?;

        let order = self
            .orders
            .create(NewOrder {
                user_id: user.id,
                template_id: template.id,
                external_reference: external_reference.clone(),
                payment_reference: None,
                status: OrderStatus::Pending,
                status_detail: "Awaiting payment.".to_string(),
                amount_minor,
                currency: self.settings.currency,
            })
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict(_) => CheckoutError::DuplicateReference(reference.clone()),
                other => CheckoutError::Store(other),
            })?;

        info!(order_id = %order.id, reference = %external_reference, "Checkout started");

        Ok(CheckoutStarted {
            order_id: order.id,
            external_reference,
            checkout_url,
            client_secret,
        })
    }

    async fn resolve_user(&self, caller: &AuthUser) -> Result<User, CheckoutError> {
        let user = match caller.user_id {
            Some(id) => self.users.get_by_id(id).await,
            None => self.users.get_by_subject(&caller.subject).await,
        }
        .map_err(CheckoutError::Store)?;

        user.ok_or(CheckoutError::UnknownUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_urls() {
        let settings = CheckoutSettings {
            base_url: "https://store.test".to_string(),
            currency: CurrencyCode::Usd,
        };
        assert_eq!(
            settings.success_url(),
            "https://store.test/api/v1/payment/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(settings.cancel_url(), "https://store.test/api/v1/payment/cancel");
    }
}
