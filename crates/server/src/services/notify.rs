//! Order confirmation notifications.
//!
//! The reconciler calls [`OrderNotifier::order_paid`] only from the call that
//! actually moved an order to `paid`. Delivery failures are the notifier's
//! problem to report; they never fail reconciliation.

use std::sync::Arc;

use askama::Template as AskamaTemplate;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{MultiPart, SinglePart, header::ContentType},
    transport::smtp::{Error as SmtpError, authentication::Credentials},
};
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::{info, instrument};

use template_store_core::CurrencyCode;

use crate::config::EmailConfig;
use crate::db::{RepositoryError, TemplateCatalog, UserDirectory};
use crate::models::Order;

const CONFIRMATION_SUBJECT: &str = "Order Confirmation - Template Store";

#[derive(AskamaTemplate)]
#[template(path = "email/order_confirmation.html")]
struct OrderConfirmationHtml<'a> {
    customer_name: &'a str,
    template_name: &'a str,
    order_id: i32,
    amount: &'a str,
    download_url: &'a str,
}

#[derive(AskamaTemplate)]
#[template(path = "email/order_confirmation.txt")]
struct OrderConfirmationText<'a> {
    customer_name: &'a str,
    template_name: &'a str,
    order_id: i32,
    amount: &'a str,
    download_url: &'a str,
}

/// Errors that can occur when sending a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    #[error("Failed to build message: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Template error: {0}")]
    Template(#[from] askama::Error),

    #[error("lookup failed: {0}")]
    Lookup(#[from] RepositoryError),

    #[error("{0} not found")]
    MissingRecord(&'static str),
}

/// Receives successful payment transitions.
#[async_trait]
pub trait OrderNotifier: Send + Sync {
    async fn order_paid(&self, order: &Order) -> Result<(), NotifyError>;
}

/// Notifier used when SMTP is not configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl OrderNotifier for NoopNotifier {
    async fn order_paid(&self, order: &Order) -> Result<(), NotifyError> {
        info!(order_id = %order.id, "Email not configured, skipping order confirmation");
        Ok(())
    }
}

/// Sends the order confirmation email over SMTP.
#[derive(Clone)]
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    base_url: String,
    users: Arc<dyn UserDirectory>,
    templates: Arc<dyn TemplateCatalog>,
}

impl EmailNotifier {
    /// Create a notifier from SMTP configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the SMTP relay cannot be configured.
    pub fn new(
        config: &EmailConfig,
        base_url: impl Into<String>,
        users: Arc<dyn UserDirectory>,
        templates: Arc<dyn TemplateCatalog>,
    ) -> Result<Self, SmtpError> {
        let credentials = Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.expose_secret().to_string(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Self {
            mailer,
            from_address: config.from_address.clone(),
            base_url: base_url.into(),
            users,
            templates,
        })
    }

    async fn send_multipart_email(
        &self,
        to: &str,
        subject: &str,
        text_body: String,
        html_body: String,
    ) -> Result<(), NotifyError> {
        let email = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|_| NotifyError::InvalidAddress(self.from_address.clone()))?,
            )
            .to(to
                .parse()
                .map_err(|_| NotifyError::InvalidAddress(to.to_string()))?)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text_body),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body),
                    ),
            )?;

        self.mailer.send(email).await?;
        Ok(())
    }
}

#[async_trait]
impl OrderNotifier for EmailNotifier {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn order_paid(&self, order: &Order) -> Result<(), NotifyError> {
        let user = self
            .users
            .get_by_id(order.user_id)
            .await?
            .ok_or(NotifyError::MissingRecord("user"))?;
        let template = self
            .templates
            .get(order.template_id)
            .await?
            .ok_or(NotifyError::MissingRecord("template"))?;

        let amount = format_amount(order.amount_minor, order.currency);
        let download_url = download_url(&self.base_url, order);
        let customer_name = if user.name.is_empty() {
            "there"
        } else {
            user.name.as_str()
        };

        let html = OrderConfirmationHtml {
            customer_name,
            template_name: &template.name,
            order_id: order.id.as_i32(),
            amount: &amount,
            download_url: &download_url,
        }
        .render()?;
        let text = OrderConfirmationText {
            customer_name,
            template_name: &template.name,
            order_id: order.id.as_i32(),
            amount: &amount,
            download_url: &download_url,
        }
        .render()?;

        self.send_multipart_email(user.email.as_str(), CONFIRMATION_SUBJECT, text, html)
            .await?;

        info!(to = %user.email, "Order confirmation sent");
        Ok(())
    }
}

/// Where the customer downloads a purchased template.
#[must_use]
pub fn download_url(base_url: &str, order: &Order) -> String {
    format!("{base_url}/dashboard/orders/{}", order.id)
}

/// Render minor units as `49.99 USD`.
#[must_use]
pub fn format_amount(amount_minor: i64, currency: CurrencyCode) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!(
        "{sign}{}.{:02} {}",
        abs / 100,
        abs % 100,
        currency.as_str().to_ascii_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(4999, CurrencyCode::Usd), "49.99 USD");
        assert_eq!(format_amount(5, CurrencyCode::Eur), "0.05 EUR");
        assert_eq!(format_amount(100_000, CurrencyCode::Gbp), "1000.00 GBP");
    }

    #[test]
    fn test_confirmation_text_renders_link() {
        let text = OrderConfirmationText {
            customer_name: "Ada",
            template_name: "Invoice Pack",
            order_id: 1,
            amount: "49.99 USD",
            download_url: "https://store.test/dashboard/orders/1",
        }
        .render()
        .unwrap_or_default();
        assert!(text.contains("Invoice Pack"));
        assert!(text.contains("https://store.test/dashboard/orders/1"));
    }
}
