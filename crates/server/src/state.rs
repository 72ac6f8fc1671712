//! Application state shared across handlers.

use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::config::ServerConfig;
use crate::db::{OrderStore, PgOrderStore, PgTemplateCatalog, PgUserDirectory, UserDirectory};
use crate::middleware::JwtVerifier;
use crate::payments::{GatewayError, StripeClient, WebhookVerifier};
use crate::services::{
    CheckoutService, CheckoutSettings, EmailNotifier, NoopNotifier, OrderNotifier,
    OrderReconciler, ReconcileTimeouts,
};

/// Error assembling application state from configuration.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("payment gateway client: {0}")]
    Gateway(#[from] GatewayError),
    #[error("SMTP transport: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Application state shared across all handlers.
///
/// Cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orders: Arc<dyn OrderStore>,
    users: Arc<dyn UserDirectory>,
    checkout: CheckoutService,
    reconciler: OrderReconciler,
    jwt: JwtVerifier,
}

impl AppState {
    /// Assemble state from already-built collaborators.
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        users: Arc<dyn UserDirectory>,
        checkout: CheckoutService,
        reconciler: OrderReconciler,
        jwt: JwtVerifier,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orders,
                users,
                checkout,
                reconciler,
                jwt,
            }),
        }
    }

    /// Build the production state: Postgres stores, Stripe, and SMTP if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or the SMTP transport cannot be built.
    pub fn from_config(config: &ServerConfig, pool: PgPool) -> Result<Self, StateError> {
        let orders: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(pool.clone()));
        let templates = Arc::new(PgTemplateCatalog::new(pool.clone()));
        let users: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(pool));

        let gateway = Arc::new(StripeClient::new(
            config.stripe.secret_key.clone(),
            config.stripe.api_base.clone(),
            config.timeouts.gateway,
        )?);

        let notifier: Arc<dyn OrderNotifier> = match &config.email {
            Some(email) => Arc::new(EmailNotifier::new(
                email,
                config.base_url.clone(),
                users.clone(),
                templates.clone(),
            )?),
            None => {
                info!("SMTP_HOST not set, order confirmation emails disabled");
                Arc::new(NoopNotifier)
            }
        };

        let checkout = CheckoutService::new(
            orders.clone(),
            templates.clone(),
            users.clone(),
            gateway.clone(),
            CheckoutSettings {
                base_url: config.base_url.clone(),
                currency: config.currency,
            },
        );

        let reconciler = OrderReconciler::new(
            orders.clone(),
            templates,
            users.clone(),
            gateway,
            notifier,
            WebhookVerifier::new(
                config.stripe.webhook_secret.clone(),
                config.timeouts.webhook_tolerance,
            ),
            ReconcileTimeouts {
                database: config.timeouts.database,
                gateway: config.timeouts.gateway,
                notifier: config.timeouts.notifier,
            },
        )
        .with_store_currency(config.currency);

        Ok(Self::new(
            orders,
            users,
            checkout,
            reconciler,
            JwtVerifier::new(&config.jwt_secret),
        ))
    }

    #[must_use]
    pub fn orders(&self) -> &dyn OrderStore {
        self.inner.orders.as_ref()
    }

    #[must_use]
    pub fn users(&self) -> &dyn UserDirectory {
        self.inner.users.as_ref()
    }

    #[must_use]
    pub fn checkout(&self) -> &CheckoutService {
        &self.inner.checkout
    }

    #[must_use]
    pub fn reconciler(&self) -> &OrderReconciler {
        &self.inner.reconciler
    }

    #[must_use]
    pub fn jwt(&self) -> &JwtVerifier {
        &self.inner.jwt
    }
}
