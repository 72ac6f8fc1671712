//! Webhook signature verification and event decoding.
//!
//! The `Stripe-Signature` header looks like `t=1700000000,v1=<hex>[,v1=<hex>]`.
//! The signed payload is `"{t}." + raw_body`, HMAC-SHA256 with the endpoint
//! secret. Verification runs over the exact bytes received; the body must
//! not be re-serialized first.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument};

use super::{CheckoutSession, PaymentIntent};

type HmacSha256 = Hmac<Sha256>;

/// Name of the header carrying the signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Reasons a webhook is rejected before it is read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header: {0}")]
    Malformed(String),
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verifies webhook signatures against the endpoint secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    #[must_use]
    pub const fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    /// Verify `header` against `payload` at the current time.
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] if the header is absent, unparsable,
    /// too old, or no `v1` signature matches.
    #[instrument(skip_all)]
    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    fn verify_at(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: i64,
    ) -> Result<(), SignatureError> {
        let header = header.ok_or(SignatureError::Missing)?;
        let (timestamp, signatures) = parse_header(header)?;

        // The timestamp is unauthenticated here; abs_diff cannot overflow.
        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(SignatureError::Expired);
        }

        let mac = self.mac(timestamp, payload)?;
        // verify_slice compares in constant time
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
        });

        if !matched {
            return Err(SignatureError::Mismatch);
        }

        debug!(timestamp, "Webhook signature verified");
        Ok(())
    }

    /// Produce a header value for `payload`, as the gateway would.
    ///
    /// # Errors
    ///
    /// Returns `SignatureError::Malformed` if the secret cannot key an HMAC.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let mac = self.mac(timestamp, payload)?;
        Ok(format!(
            "t={timestamp},v1={}",
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| SignatureError::Malformed(e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

fn parse_header(header: &str) -> Result<(i64, Vec<&str>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                let ts = value
                    .parse::<i64>()
                    .map_err(|_| SignatureError::Malformed("invalid timestamp".into()))?;
                timestamp = Some(ts);
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("missing t".into()))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("missing v1 signature".into()));
    }
    Ok((timestamp, signatures))
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// The event kinds reconciliation acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// `checkout.session.completed`
    CheckoutCompleted(CheckoutSession),
    /// `checkout.session.async_payment_succeeded`
    CheckoutAsyncSucceeded(CheckoutSession),
    /// `checkout.session.async_payment_failed`
    CheckoutAsyncFailed(CheckoutSession),
    /// `checkout.session.expired`
    CheckoutExpired(CheckoutSession),
    /// `payment_intent.succeeded`
    PaymentIntentSucceeded(PaymentIntent),
    /// `payment_intent.payment_failed`
    PaymentIntentFailed(PaymentIntent),
    /// Anything else; acknowledged and ignored.
    Unhandled,
}

/// A decoded webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    pub created: i64,
    pub kind: EventKind,
}

impl GatewayEvent {
    /// Decode a verified webhook body.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the envelope, or the object of a handled
    /// event type, does not match the expected shape.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawEvent = serde_json::from_slice(payload)?;
        let object = raw.data.object;

        let kind = match raw.event_type.as_str() {
            "checkout.session.completed" => {
                EventKind::CheckoutCompleted(serde_json::from_value(object)?)
            }
            "checkout.session.async_payment_succeeded" => {
                EventKind::CheckoutAsyncSucceeded(serde_json::from_value(object)?)
            }
            "checkout.session.async_payment_failed" => {
                EventKind::CheckoutAsyncFailed(serde_json::from_value(object)?)
            }
            "checkout.session.expired" => EventKind::CheckoutExpired(serde_json::from_value(object)?),
            "payment_intent.succeeded" => {
                EventKind::PaymentIntentSucceeded(serde_json::from_value(object)?)
            }
            "payment_intent.payment_failed" => {
                EventKind::PaymentIntentFailed(serde_json::from_value(object)?)
            }
            _ => EventKind::Unhandled,
        };

        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            created: raw.created,
            kind,
        })
    }

    /// The payment signal carried by this event, if it carries one.
    #[must_use]
    pub fn signal(&self) -> Option<PaymentSignal> {
        match &self.kind {
            EventKind::CheckoutCompleted(session) => {
                let outcome = if session.is_paid() {
                    PaymentOutcome::Succeeded
                } else {
                    PaymentOutcome::AwaitingPayment
                };
                Some(PaymentSignal::from_session(session, outcome))
            }
            EventKind::CheckoutAsyncSucceeded(session) => Some(PaymentSignal::from_session(
                session,
                PaymentOutcome::Succeeded,
            )),
            EventKind::CheckoutAsyncFailed(session) | EventKind::CheckoutExpired(session) => {
                Some(PaymentSignal::from_session(session, PaymentOutcome::Failed))
            }
            EventKind::PaymentIntentSucceeded(intent) => Some(PaymentSignal::from_intent(
                intent,
                PaymentOutcome::Succeeded,
            )),
            EventKind::PaymentIntentFailed(intent) => {
                Some(PaymentSignal::from_intent(intent, PaymentOutcome::Failed))
            }
            EventKind::Unhandled => None,
        }
    }
}

/// What the gateway says happened to a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded,
    Failed,
    /// Session completed but an asynchronous payment method has not settled.
    AwaitingPayment,
}

/// Gateway-agnostic input to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSignal {
    pub outcome: PaymentOutcome,
    /// Session or intent ID the event is about.
    pub reference: String,
    /// Payment-intent ID, when known.
    pub payment_reference: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    /// Stored as the order's `status_detail` if this signal changes it.
    pub detail: String,
}

impl PaymentSignal {
    #[must_use]
    pub fn from_session(session: &CheckoutSession, outcome: PaymentOutcome) -> Self {
        let detail = match outcome {
            PaymentOutcome::Succeeded => "Payment successful!".to_string(),
            PaymentOutcome::Failed if session.is_expired() => "Checkout session expired.".to_string(),
            PaymentOutcome::Failed => "Payment failed.".to_string(),
            PaymentOutcome::AwaitingPayment => "Awaiting payment confirmation.".to_string(),
        };

        Self {
            outcome,
            reference: session.id.clone(),
            payment_reference: session.payment_intent.clone(),
            metadata: session.metadata.clone(),
            amount_minor: session.amount_total,
            currency: session.currency.clone(),
            detail,
        }
    }

    #[must_use]
    pub fn from_intent(intent: &PaymentIntent, outcome: PaymentOutcome) -> Self {
        let detail = match outcome {
            PaymentOutcome::Succeeded => "Payment successful!".to_string(),
            _ => intent
                .last_payment_error
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| "Payment failed.".to_string()),
        };

        Self {
            outcome,
            reference: intent.id.clone(),
            payment_reference: Some(intent.id.clone()),
            metadata: intent.metadata.clone(),
            amount_minor: Some(intent.amount),
            currency: Some(intent.currency.clone()),
            detail,
        }
    }
}
