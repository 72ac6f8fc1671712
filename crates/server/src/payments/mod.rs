//! Payment gateway boundary.
//!
//! [`PaymentGateway`] is what checkout and reconciliation call;
//! [`stripe::StripeClient`] implements it against the Stripe REST API and
//! [`webhook`] verifies and decodes the events Stripe pushes back.

pub mod stripe;
pub mod webhook;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use template_store_core::CurrencyCode;

pub use stripe::StripeClient;
pub use webhook::{
    EventKind, GatewayEvent, PaymentOutcome, PaymentSignal, SIGNATURE_HEADER, SignatureError,
    WebhookVerifier,
};

/// Metadata key carrying the purchased template ID.
pub const META_TEMPLATE_ID: &str = "template_id";
/// Metadata key carrying the internal user ID.
pub const META_USER_ID: &str = "user_id";
/// Metadata key carrying the identity-provider subject.
pub const META_USER_SUBJECT: &str = "user_subject";
/// Metadata key carrying the [`CheckoutFlow`] that created the payment.
pub const META_FLOW: &str = "flow";

/// Errors returned by a payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP request failed (connect, timeout, TLS).
    #[error("gateway request failed: {0}")]
    Request(String),

    /// Response body could not be decoded.
    #[error("gateway response error: {0}")]
    Response(String),

    /// Gateway rejected the request.
    #[error("gateway API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl GatewayError {
    /// Transport failures and 5xx/429 responses may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) => true,
            Self::Response(_) => false,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// How the customer pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutFlow {
    /// Gateway-hosted checkout page; the order is keyed by the session ID.
    #[default]
    Checkout,
    /// Client-side confirmation with a client secret; keyed by the intent ID.
    PaymentIntent,
}

impl CheckoutFlow {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::PaymentIntent => "payment_intent",
        }
    }
}

impl fmt::Display for CheckoutFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckoutFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout" => Ok(Self::Checkout),
            "payment_intent" => Ok(Self::PaymentIntent),
            other => Err(format!("unknown checkout flow: {other}")),
        }
    }
}

/// A request to charge for one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Amount in the currency's smallest unit.
    pub amount_minor: i64,
    pub currency: CurrencyCode,
    /// Shown to the customer; the template name.
    pub description: String,
    /// Copied verbatim onto the session and its payment intent.
    pub metadata: BTreeMap<String, String>,
    /// Redirect after payment; may contain `{CHECKOUT_SESSION_ID}`.
    pub success_url: String,
    pub cancel_url: String,
}

/// `payment_status` of a checkout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentStatus {
    Paid,
    #[default]
    Unpaid,
    NoPaymentRequired,
}

/// A gateway-hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    /// Hosted page URL; absent once the session is complete or expired.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub payment_status: SessionPaymentStatus,
    /// `open`, `complete` or `expired`.
    #[serde(default)]
    pub status: Option<String>,
    /// Payment-intent ID, once the gateway has created one.
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CheckoutSession {
    /// True when money has been captured or none was required.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status,
            SessionPaymentStatus::Paid | SessionPaymentStatus::NoPaymentRequired
        )
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.status.as_deref() == Some("expired")
    }
}

/// Error attached to a failed payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// A refund issued against a payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Refund {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    pub amount: i64,
}

/// Outbound payment gateway operations.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout session.
    async fn create_checkout_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError>;

    /// Create a payment intent for client-side confirmation.
    async fn create_payment_intent(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Fetch the authoritative state of a checkout session.
    async fn retrieve_checkout_session(&self, id: &str) -> Result<CheckoutSession, GatewayError>;

    /// Refund a payment intent in full.
    async fn create_refund(&self, payment_intent_id: &str) -> Result<Refund, GatewayError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_flow_round_trip() {
        assert_eq!("checkout".parse::<CheckoutFlow>().unwrap(), CheckoutFlow::Checkout);
        assert_eq!(
            "payment_intent".parse::<CheckoutFlow>().unwrap(),
            CheckoutFlow::PaymentIntent
        );
        assert!("card".parse::<CheckoutFlow>().is_err());
    }

    #[test]
    fn test_session_deserializes_with_missing_fields() {
        let session: CheckoutSession =
            serde_json::from_str(r#"{"id":"cs_test_1","payment_status":"paid"}"#).unwrap();
        assert!(session.is_paid());
        assert!(session.metadata.is_empty());
        assert_eq!(session.payment_intent, None);
    }

    #[test]
    fn test_transient_errors() {
        assert!(GatewayError::Request("timeout".into()).is_transient());
        assert!(
            GatewayError::Api {
                status: 503,
                message: String::new()
            }
            .is_transient()
        );
        assert!(
            !GatewayError::Api {
                status: 400,
                message: String::new()
            }
            .is_transient()
        );
    }
}
