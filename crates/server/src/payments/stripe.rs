//! Stripe REST API client.
//!
//! Stripe takes form-encoded bodies with bracketed keys for nested fields
//! (`metadata[template_id]=3`). Request bodies are built by plain functions
//! so the encoding can be tested without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument};
use url::Url;

use super::{
    CheckoutFlow, CheckoutSession, GatewayError, META_FLOW, PaymentGateway, PaymentIntent,
    PaymentRequest, Refund,
};

type Form = Vec<(String, String)>;

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: SecretString,
    api_base: String,
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("secret_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl StripeClient {
    /// Create a client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Request` if the HTTP client cannot be built.
    pub fn new(
        secret_key: SecretString,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        Ok(Self {
            client,
            secret_key,
            api_base: api_base.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.api_base)
    }

    /// URL of one object, with `id` percent-encoded as a single path segment.
    fn object_url(&self, collection: &[&str], id: &str) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| GatewayError::Request(format!("invalid API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| GatewayError::Request("API base cannot take a path".into()))?
            .pop_if_empty()
            .push("v1")
            .extend(collection)
            .push(id);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let response = request
            .bearer_auth(self.secret_key.expose_secret())
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorEnvelope>()
                .await
                .ok()
                .map(|env| {
                    let kind = env.error.kind.unwrap_or_else(|| "api_error".to_string());
                    let message = env.error.message.unwrap_or_default();
                    format!("{kind}: {message}")
                })
                .unwrap_or_else(|| status.to_string());

            error!(status = status.as_u16(), error = %message, "Stripe API error");
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Response(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    #[instrument(skip(self, request), fields(amount = request.amount_minor))]
    async fn create_checkout_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let form = checkout_session_form(request);
        let session: CheckoutSession = self
            .send(self.client.post(self.url("checkout/sessions")).form(&form))
            .await?;

        debug!(session_id = %session.id, "Checkout session created");
        Ok(session)
    }

    #[instrument(skip(self, request), fields(amount = request.amount_minor))]
    async fn create_payment_intent(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let form = payment_intent_form(request);
        let intent: PaymentIntent = self
            .send(self.client.post(self.url("payment_intents")).form(&form))
            .await?;

        debug!(payment_intent = %intent.id, "Payment intent created");
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_checkout_session(&self, id: &str) -> Result<CheckoutSession, GatewayError> {
        let url = self.object_url(&["checkout", "sessions"], id)?;
        self.send(self.client.get(url)).await
    }

    #[instrument(skip(self))]
    async fn create_refund(&self, payment_intent_id: &str) -> Result<Refund, GatewayError> {
        let form: Form = vec![("payment_intent".into(), payment_intent_id.into())];
        let refund: Refund = self
            .send(self.client.post(self.url("refunds")).form(&form))
            .await?;

        debug!(refund_id = %refund.id, "Refund created");
        Ok(refund)
    }
}

// =============================================================================
// Form Encoding
// =============================================================================

fn push_metadata(form: &mut Form, prefix: &str, request: &PaymentRequest, flow: CheckoutFlow) {
    for (key, value) in &request.metadata {
        if key != META_FLOW {
            form.push((format!("{prefix}[{key}]"), value.clone()));
        }
    }
    form.push((format!("{prefix}[{META_FLOW}]"), flow.as_str().to_string()));
}

/// Body for `POST /v1/checkout/sessions`.
///
/// Metadata goes on the session and on the payment intent it spawns, so
/// `payment_intent.*` events can be traced back as hosted-checkout payments.
fn checkout_session_form(request: &PaymentRequest) -> Form {
    let mut form: Form = vec![
        ("mode".into(), "payment".into()),
        ("success_url".into(), request.success_url.clone()),
        ("cancel_url".into(), request.cancel_url.clone()),
        ("line_items[0][quantity]".into(), "1".into()),
        (
            "line_items[0][price_data][currency]".into(),
            request.currency.as_str().into(),
        ),
        (
            "line_items[0][price_data][unit_amount]".into(),
            request.amount_minor.to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]".into(),
            request.description.clone(),
        ),
        (
            "line_items[0][price_data][product_data][description]".into(),
            format!("Digital Template: {}", request.description),
        ),
    ];
    push_metadata(&mut form, "metadata", request, CheckoutFlow::Checkout);
    push_metadata(
        &mut form,
        "payment_intent_data[metadata]",
        request,
        CheckoutFlow::Checkout,
    );
    form
}

/// Body for `POST /v1/payment_intents`.
fn payment_intent_form(request: &PaymentRequest) -> Form {
    let mut form: Form = vec![
        ("amount".into(), request.amount_minor.to_string()),
        ("currency".into(), request.currency.as_str().into()),
        ("description".into(), request.description.clone()),
        ("automatic_payment_methods[enabled]".into(), "true".into()),
    ];
    push_metadata(&mut form, "metadata", request, CheckoutFlow::PaymentIntent);
    form
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use template_store_core::CurrencyCode;

    use super::*;

    fn request() -> PaymentRequest {
        PaymentRequest {
            amount_minor: 4999,
            currency: CurrencyCode::Usd,
            description: "Invoice Pack".into(),
            metadata: BTreeMap::from([
                ("template_id".to_string(), "3".to_string()),
                ("user_id".to_string(), "7".to_string()),
            ]),
            success_url: "https://store.test/api/v1/payment/success?session_id={CHECKOUT_SESSION_ID}"
                .into(),
            cancel_url: "https://store.test/api/v1/payment/cancel".into(),
        }
    }

    fn value<'a>(form: &'a Form, key: &str) -> Option<&'a str> {
        form.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_checkout_form_line_item() {
        let form = checkout_session_form(&request());
        assert_eq!(value(&form, "mode"), Some("payment"));
        assert_eq!(value(&form, "line_items[0][price_data][unit_amount]"), Some("4999"));
        assert_eq!(value(&form, "line_items[0][price_data][currency]"), Some("usd"));
        assert_eq!(
            value(&form, "line_items[0][price_data][product_data][description]"),
            Some("Digital Template: Invoice Pack")
        );
    }

    #[test]
    fn test_checkout_form_copies_metadata_to_intent() {
        let form = checkout_session_form(&request());
        assert_eq!(value(&form, "metadata[template_id]"), Some("3"));
        assert_eq!(value(&form, "payment_intent_data[metadata][user_id]"), Some("7"));
        assert_eq!(
            value(&form, "payment_intent_data[metadata][flow]"),
            Some("checkout")
        );
    }

    #[test]
    fn test_payment_intent_form_marks_flow() {
        let mut req = request();
        req.metadata.insert("flow".into(), "checkout".into());
        let form = payment_intent_form(&req);
        assert_eq!(value(&form, "amount"), Some("4999"));
        assert_eq!(value(&form, "metadata[flow]"), Some("payment_intent"));
        assert_eq!(form.iter().filter(|(k, _)| k == "metadata[flow]").count(), 1);
    }

    fn client(api_base: &str) -> StripeClient {
        StripeClient::new(
            SecretString::from("sk_test_hidden_value"),
            api_base,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_object_url_keeps_id_in_one_segment() {
        let client = client("https://api.stripe.com");
        let url = client
            .object_url(&["checkout", "sessions"], "cs_test_1")
            .unwrap();
        assert_eq!(url.as_str(), "https://api.stripe.com/v1/checkout/sessions/cs_test_1");

        let url = client
            .object_url(&["checkout", "sessions"], "../../customers/cus_1")
            .unwrap();
        assert!(url.path().starts_with("/v1/checkout/sessions/"));
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert!(!url.path().contains("/customers/"));
    }

    #[test]
    fn test_object_url_with_trailing_slash_base() {
        let url = client("http://127.0.0.1:12111/")
            .object_url(&["checkout", "sessions"], "cs_test_1")
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:12111/v1/checkout/sessions/cs_test_1");
    }

    #[test]
    fn test_debug_redacts_key() {
        let client = StripeClient::new(
            SecretString::from("sk_test_hidden_value"),
            "https://api.stripe.com",
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!format!("{client:?}").contains("hidden_value"));
    }
}
