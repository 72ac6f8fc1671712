//! Order reconciliation.
//!
//! Every status change driven by the gateway goes through [`OrderReconciler::apply`],
//! whether it arrives as a signed webhook or as a success redirect. `apply`
//! looks the order up by exact reference and issues a single conditional
//! update; the store reports whether *this* call made the change, and only
//! that call triggers the confirmation notifier.
//!
//! | order \ signal | succeeded              | failed          |
//! |----------------|------------------------|-----------------|
//! | pending        | -> paid (`Applied`)    | -> failed       |
//! | paid and later | `AlreadySettled`       | `StaleIgnored`  |
//! | failed         | `Superseded`           | `StaleIgnored`  |
//! | none           | orphan fallback or `Unmatched` | `Unmatched` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{Span, debug, error, info, instrument, warn};

use template_store_core::{
    CurrencyCode, ExternalReference, OrderId, OrderStatus, Price, TemplateId, UserId,
};

use super::notify::OrderNotifier;
use crate::db::{OrderStore, RepositoryError, TemplateCatalog, UserDirectory};
use crate::models::{NewOrder, Order, Template, User};
use crate::payments::{
    CheckoutFlow, GatewayError, GatewayEvent, META_FLOW, META_TEMPLATE_ID, META_USER_ID,
    META_USER_SUBJECT, PaymentGateway, PaymentOutcome, PaymentSignal, SignatureError,
    WebhookVerifier,
};

/// Errors surfaced by reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Webhook failed verification; nothing was read or written.
    #[error("webhook signature rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// A store or gateway call exceeded its time limit. No write is partial.
    #[error("{0} call timed out")]
    Timeout(&'static str),

    #[error(transparent)]
    Store(#[from] RepositoryError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("order {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {0} has no payment to refund")]
    NoPaymentReference(OrderId),
}

impl ReconcileError {
    /// Whether the gateway should redeliver.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Store(RepositoryError::Database(_)) => true,
            Self::Gateway(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Time limits for calls made while reconciling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileTimeouts {
    pub database: Duration,
    pub gateway: Duration,
    /// Confirmation delivery; exceeding it is logged, never an error.
    pub notifier: Duration,
}

impl Default for ReconcileTimeouts {
    fn default() -> Self {
        Self {
            database: Duration::from_secs(5),
            gateway: Duration::from_secs(10),
            notifier: Duration::from_secs(10),
        }
    }
}

/// What to do when a success signal matches no order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Rebuild the order from event metadata (signed webhooks only).
    CreateFromMetadata,
    /// Log and acknowledge.
    Acknowledge,
}

/// Result of applying one payment signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This call moved the order.
    Applied(Order),
    /// Success for an order that is already paid or later.
    AlreadySettled { order_id: OrderId, status: OrderStatus },
    /// Success for an order that had already failed. Needs manual attention.
    Superseded { order_id: OrderId },
    /// Failure for an order that is no longer pending.
    StaleIgnored { order_id: OrderId, status: OrderStatus },
    /// Session completed; asynchronous payment still settling.
    AwaitingPayment { order_id: OrderId },
    /// No order existed; one was created from event metadata, already paid.
    OrphanCreated(Order),
    /// No order matched and none was created.
    Unmatched { reference: String },
}

impl ReconcileOutcome {
    /// True only for the call that moved an order into `paid`.
    #[must_use]
    pub fn performed_transition(&self) -> bool {
        match self {
            Self::Applied(order) => order.status == OrderStatus::Paid,
            Self::OrphanCreated(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn order(&self) -> Option<&Order> {
        match self {
            Self::Applied(order) | Self::OrphanCreated(order) => Some(order),
            _ => None,
        }
    }

    #[must_use]
    pub const fn order_id(&self) -> Option<OrderId> {
        match self {
            Self::Applied(order) | Self::OrphanCreated(order) => Some(order.id),
            Self::AlreadySettled { order_id, .. }
            | Self::Superseded { order_id }
            | Self::StaleIgnored { order_id, .. }
            | Self::AwaitingPayment { order_id } => Some(*order_id),
            Self::Unmatched { .. } => None,
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::AlreadySettled { .. } => "already_settled",
            Self::Superseded { .. } => "superseded",
            Self::StaleIgnored { .. } => "stale_ignored",
            Self::AwaitingPayment { .. } => "awaiting_payment",
            Self::OrphanCreated(_) => "orphan_created",
            Self::Unmatched { .. } => "unmatched",
        }
    }
}

/// Acknowledgement for one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookReceipt {
    pub event_id: String,
    pub event_type: String,
    /// `None` for event types that carry no payment signal.
    pub outcome: Option<ReconcileOutcome>,
}

impl WebhookReceipt {
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.outcome.as_ref().map_or("ignored", ReconcileOutcome::label)
    }
}

/// What the success redirect may tell the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Paid,
    Processing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckoutConfirmation {
    pub status: ConfirmationStatus,
    pub order_id: Option<OrderId>,
}

impl CheckoutConfirmation {
    const fn new(status: ConfirmationStatus, order_id: Option<OrderId>) -> Self {
        Self { status, order_id }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self.status {
            ConfirmationStatus::Paid => "Payment successful!",
            ConfirmationStatus::Processing => "Payment received, processing.",
            ConfirmationStatus::Failed => "Payment failed.",
        }
    }
}

/// Drives orders from gateway signals.
#[derive(Clone)]
pub struct OrderReconciler {
    orders: Arc<dyn OrderStore>,
    templates: Arc<dyn TemplateCatalog>,
    users: Arc<dyn UserDirectory>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn OrderNotifier>,
    verifier: WebhookVerifier,
    timeouts: ReconcileTimeouts,
    currency: CurrencyCode,
}

impl OrderReconciler {
    #[must_use]
    pub fn new(
        orders: Arc<dyn OrderStore>,
        templates: Arc<dyn TemplateCatalog>,
        users: Arc<dyn UserDirectory>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn OrderNotifier>,
        verifier: WebhookVerifier,
        timeouts: ReconcileTimeouts,
    ) -> Self {
        Self {
            orders,
            templates,
            users,
            gateway,
            notifier,
            verifier,
            timeouts,
            currency: CurrencyCode::default(),
        }
    }

    /// Currency assumed for rebuilt orders whose event carries none.
    #[must_use]
    pub fn with_store_currency(mut self, currency: CurrencyCode) -> Self {
        self.currency = currency;
        self
    }

    /// Verify, decode and apply one webhook delivery.
    ///
    /// The signature is checked before anything else; a rejected delivery
    /// never touches the order store.
    ///
    /// # Errors
    ///
    /// `Signature` and `MalformedEvent` for bad deliveries; `Timeout`,
    /// `Store` for failures the gateway should retry.
    #[instrument(skip_all, fields(event_id = tracing::field::Empty, event_type = tracing::field::Empty))]
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookReceipt, ReconcileError> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            warn!(error = %e, "Rejected webhook");
            return Err(e.into());
        }

        let event = GatewayEvent::parse(payload)
            .map_err(|e| ReconcileError::MalformedEvent(e.to_string()))?;
        Span::current()
            .record("event_id", event.id.as_str())
            .record("event_type", event.event_type.as_str());

        let outcome = match event.signal() {
            Some(signal) => Some(self.apply(signal, FallbackPolicy::CreateFromMetadata).await?),
            None => {
                debug!("Event type not handled, acknowledging");
                None
            }
        };

        Ok(WebhookReceipt {
            event_id: event.id,
            event_type: event.event_type,
            outcome,
        })
    }

    /// Apply one payment signal to its order.
    ///
    /// # Errors
    ///
    /// Store and timeout errors only; anomalies are reported as outcomes.
    #[instrument(skip(self, signal), fields(reference = %signal.reference, outcome = ?signal.outcome))]
    pub async fn apply(
        &self,
        signal: PaymentSignal,
        policy: FallbackPolicy,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reference = ExternalReference::parse(&signal.reference)
            .map_err(|e| ReconcileError::MalformedEvent(format!("reference: {e}")))?;

        let outcome = match self.resolve(&reference).await? {
            Some(order) => self.apply_to(order, &signal).await?,
            None => self.fallback(&reference, &signal, policy).await?,
        };

        match &outcome {
            ReconcileOutcome::Applied(order) => {
                info!(order_id = %order.id, status = %order.status, "Order transitioned");
            }
            ReconcileOutcome::AlreadySettled { order_id, status } => {
                debug!(order_id = %order_id, status = %status, "Duplicate success, no-op");
            }
            ReconcileOutcome::Superseded { order_id } => {
                error!(order_id = %order_id, "Payment succeeded for a failed order");
            }
            ReconcileOutcome::StaleIgnored { order_id, status } => {
                info!(order_id = %order_id, status = %status, "Stale failure ignored");
            }
            ReconcileOutcome::AwaitingPayment { order_id } => {
                info!(order_id = %order_id, "Awaiting asynchronous payment");
            }
            ReconcileOutcome::OrphanCreated(order) => {
                warn!(order_id = %order.id, "Order rebuilt from event metadata");
            }
            ReconcileOutcome::Unmatched { .. } => {
                warn!("No order matches reference, acknowledging");
            }
        }

        if outcome.performed_transition()
            && let Some(order) = outcome.order()
        {
            self.notify(order).await;
        }

        Ok(outcome)
    }

    /// Report the state of a checkout to the customer returning from it.
    ///
    /// Never reports `Paid` unless the local order or the freshly fetched
    /// session says so. Gateway trouble and retryable store errors degrade
    /// to `Processing`.
    ///
    /// # Errors
    ///
    /// `MalformedEvent` for an unusable session ID; non-retryable store errors.
    #[instrument(skip(self))]
    pub async fn confirm_checkout(
        &self,
        session_id: &str,
    ) -> Result<CheckoutConfirmation, ReconcileError> {
        let reference = ExternalReference::parse(session_id)
            .map_err(|e| ReconcileError::MalformedEvent(format!("session id: {e}")))?;

        let local = match self.find(self.orders.get_by_reference(&reference)).await {
            Ok(local) => local,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Could not read local order");
                return Ok(CheckoutConfirmation::new(ConfirmationStatus::Processing, None));
            }
            Err(e) => return Err(e),
        };
        let local_id = local.as_ref().map(|o| o.id);
        if let Some(order) = &local {
            if order.status.is_settled() {
                return Ok(CheckoutConfirmation::new(ConfirmationStatus::Paid, local_id));
            }
            if order.status == OrderStatus::Failed {
                return Ok(CheckoutConfirmation::new(ConfirmationStatus::Failed, local_id));
            }
        }

        let processing = CheckoutConfirmation::new(ConfirmationStatus::Processing, local_id);

        let session = match self
            .gateway_call(self.gateway.retrieve_checkout_session(reference.as_str()))
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Could not fetch checkout session");
                return Ok(processing);
            }
        };

        let outcome = if session.is_paid() {
            PaymentOutcome::Succeeded
        } else if session.is_expired() {
            PaymentOutcome::Failed
        } else {
            return Ok(processing);
        };

        let signal = PaymentSignal::from_session(&session, outcome);
        let result = match self.apply(signal, FallbackPolicy::Acknowledge).await {
            Ok(result) => result,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Could not apply confirmed session");
                return Ok(processing);
            }
            Err(e) => return Err(e),
        };

        let order_id = result.order_id().or(local_id);
        let status = match (&result, outcome) {
            (ReconcileOutcome::Applied(order), _) if order.status == OrderStatus::Failed => {
                ConfirmationStatus::Failed
            }
            (ReconcileOutcome::StaleIgnored { status, .. }, _) if status.is_settled() => {
                ConfirmationStatus::Paid
            }
            (
                ReconcileOutcome::Applied(_)
                | ReconcileOutcome::AlreadySettled { .. }
                | ReconcileOutcome::Unmatched { .. },
                PaymentOutcome::Succeeded,
            ) => ConfirmationStatus::Paid,
            (ReconcileOutcome::Unmatched { .. }, PaymentOutcome::Failed) => {
                ConfirmationStatus::Failed
            }
            _ => ConfirmationStatus::Processing,
        };

        Ok(CheckoutConfirmation::new(status, order_id))
    }

    /// Move a paid order to `delivered`.
    ///
    /// # Errors
    ///
    /// `OrderNotFound`, or `InvalidTransition` if the order is not `paid`.
    #[instrument(skip(self))]
    pub async fn mark_delivered(&self, id: OrderId) -> Result<Order, ReconcileError> {
        let order = self
            .admin_transition(id, OrderStatus::Delivered, "Download link issued.", None)
            .await?;
        info!(order_id = %id, "Order delivered");
        Ok(order)
    }

    /// Refund a paid or delivered order at the gateway, then mark it `refunded`.
    ///
    /// # Errors
    ///
    /// `OrderNotFound`, `InvalidTransition`, `NoPaymentReference`, or the
    /// gateway's error if the refund is declined.
    #[instrument(skip(self))]
    pub async fn refund(&self, id: OrderId, reason: Option<&str>) -> Result<Order, ReconcileError> {
        let order = self.require(id).await?;
        if !order.status.can_transition_to(OrderStatus::Refunded) {
            return Err(ReconcileError::InvalidTransition {
                id,
                from: order.status,
                to: OrderStatus::Refunded,
            });
        }

        let payment_intent = match order.payment_intent_id() {
            Some(pi) => pi.to_string(),
            None => self
                .gateway_call(
                    self.gateway
                        .retrieve_checkout_session(order.external_reference.as_str()),
                )
                .await?
                .payment_intent
                .ok_or(ReconcileError::NoPaymentReference(id))?,
        };

        let refund = self
            .gateway_call(self.gateway.create_refund(&payment_intent))
            .await?;

        let detail = match reason {
            Some(reason) => format!("Refunded ({}): {reason}", refund.id),
            None => format!("Refunded ({}).", refund.id),
        };

        let refunded = self
            .admin_transition(id, OrderStatus::Refunded, &detail, Some(&payment_intent))
            .await
            .inspect_err(|e| {
                error!(refund_id = %refund.id, error = %e, "Refund issued but order not updated");
            })?;

        info!(order_id = %id, refund_id = %refund.id, "Order refunded");
        Ok(refunded)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn apply_to(
        &self,
        order: Order,
        signal: &PaymentSignal,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match signal.outcome {
            PaymentOutcome::Succeeded => {
                if order.status.is_settled() {
                    return Ok(ReconcileOutcome::AlreadySettled {
                        order_id: order.id,
                        status: order.status,
                    });
                }
                if order.status == OrderStatus::Failed {
                    return Ok(ReconcileOutcome::Superseded { order_id: order.id });
                }

                let updated = self
                    .db(self.orders.transition(
                        order.id,
                        &[OrderStatus::Pending],
                        OrderStatus::Paid,
                        &signal.detail,
                        signal.payment_reference.as_deref(),
                    ))
                    .await?;

                if let Some(updated) = updated {
                    return Ok(ReconcileOutcome::Applied(updated));
                }

                // Another delivery got there first.
                let current = self.require(order.id).await?;
                Ok(match current.status {
                    OrderStatus::Failed => ReconcileOutcome::Superseded {
                        order_id: current.id,
                    },
                    status if status.is_settled() => ReconcileOutcome::AlreadySettled {
                        order_id: current.id,
                        status,
                    },
                    status => ReconcileOutcome::StaleIgnored {
                        order_id: current.id,
                        status,
                    },
                })
            }
            PaymentOutcome::Failed => {
                if order.status != OrderStatus::Pending {
                    return Ok(ReconcileOutcome::StaleIgnored {
                        order_id: order.id,
                        status: order.status,
                    });
                }

                let updated = self
                    .db(self.orders.transition(
                        order.id,
                        &[OrderStatus::Pending],
                        OrderStatus::Failed,
                        &signal.detail,
                        signal.payment_reference.as_deref(),
                    ))
                    .await?;

                match updated {
                    Some(updated) => Ok(ReconcileOutcome::Applied(updated)),
                    None => {
                        let current = self.require(order.id).await?;
                        Ok(ReconcileOutcome::StaleIgnored {
                            order_id: current.id,
                            status: current.status,
                        })
                    }
                }
            }
            PaymentOutcome::AwaitingPayment => {
                Ok(ReconcileOutcome::AwaitingPayment { order_id: order.id })
            }
        }
    }

    async fn fallback(
        &self,
        reference: &ExternalReference,
        signal: &PaymentSignal,
        policy: FallbackPolicy,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let unmatched = || ReconcileOutcome::Unmatched {
            reference: reference.to_string(),
        };

        if signal.outcome != PaymentOutcome::Succeeded || policy == FallbackPolicy::Acknowledge {
            return Ok(unmatched());
        }

        // Hosted checkouts always have a local order keyed by the session;
        // their intent events are not authoritative enough to create one.
        if signal.metadata.get(META_FLOW).map(String::as_str) == Some(CheckoutFlow::Checkout.as_str())
        {
            debug!("Intent of a hosted checkout not yet linked, acknowledging");
            return Ok(unmatched());
        }

        let Some((user, template)) = self.resolve_metadata(signal).await? else {
            return Ok(unmatched());
        };

        let currency = match signal.currency.as_deref() {
            None => self.currency,
            Some(code) => match code.parse::<CurrencyCode>() {
                Ok(currency) => currency,
                Err(e) => {
                    error!(
                        currency = code,
                        error = %e,
                        "Paid event in unsupported currency, order not rebuilt"
                    );
                    return Ok(unmatched());
                }
            },
        };
        let amount_minor = match signal.amount_minor {
            Some(amount) => amount,
            None => Price::new(template.price, currency)
                .minor_units()
                .map_err(|e| ReconcileError::MalformedEvent(e.to_string()))?,
        };

        let created = self
            .db(self.orders.create(NewOrder {
                user_id: user.id,
                template_id: template.id,
                external_reference: reference.clone(),
                payment_reference: signal.payment_reference.clone(),
                status: OrderStatus::Paid,
                status_detail: signal.detail.clone(),
                amount_minor,
                currency,
            }))
            .await;

        match created {
            Ok(order) => Ok(ReconcileOutcome::OrphanCreated(order)),
            Err(ReconcileError::Store(RepositoryError::Conflict(_))) => {
                // A concurrent delivery (or checkout itself) inserted it first.
                let existing = self.db(self.orders.get_by_reference(reference)).await?;
                self.apply_to(existing, signal).await
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve(
        &self,
        reference: &ExternalReference,
    ) -> Result<Option<Order>, ReconcileError> {
        if let Some(order) = self.find(self.orders.get_by_reference(reference)).await? {
            return Ok(Some(order));
        }
        self.find(self.orders.get_by_payment_reference(reference.as_str()))
            .await
    }

    async fn resolve_metadata(
        &self,
        signal: &PaymentSignal,
    ) -> Result<Option<(User, Template)>, ReconcileError> {
        let meta = |key: &str| signal.metadata.get(key).map(String::as_str);

        let Some(template_id) = meta(META_TEMPLATE_ID).and_then(|v| v.parse::<TemplateId>().ok())
        else {
            warn!("Event metadata has no usable template_id");
            return Ok(None);
        };

        let user = match (
            meta(META_USER_ID).and_then(|v| v.parse::<UserId>().ok()),
            meta(META_USER_SUBJECT),
        ) {
            (Some(id), _) => self.db(self.users.get_by_id(id)).await?,
            (None, Some(subject)) => self.db(self.users.get_by_subject(subject)).await?,
            (None, None) => None,
        };
        let Some(user) = user else {
            warn!("Event metadata does not resolve to a user");
            return Ok(None);
        };

        let Some(template) = self.db(self.templates.get(template_id)).await? else {
            warn!(template_id = %template_id, "Event metadata names an unknown template");
            return Ok(None);
        };

        Ok(Some((user, template)))
    }

    async fn admin_transition(
        &self,
        id: OrderId,
        to: OrderStatus,
        detail: &str,
        payment_reference: Option<&str>,
    ) -> Result<Order, ReconcileError> {
        let from = OrderStatus::predecessors(to);
        let updated = self
            .db(self.orders.transition(id, &from, to, detail, payment_reference))
            .await?;

        match updated {
            Some(order) => Ok(order),
            None => {
                let current = self.require(id).await?;
                Err(ReconcileError::InvalidTransition {
                    id,
                    from: current.status,
                    to,
                })
            }
        }
    }

    async fn require(&self, id: OrderId) -> Result<Order, ReconcileError> {
        self.find(self.orders.get(id))
            .await?
            .ok_or(ReconcileError::OrderNotFound(id))
    }

    async fn notify(&self, order: &Order) {
        match timeout(self.timeouts.notifier, self.notifier.order_paid(order)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(order_id = %order.id, error = %e, "Order confirmation failed"),
            Err(_) => error!(order_id = %order.id, "Order confirmation timed out"),
        }
    }

    async fn find<F>(&self, fut: F) -> Result<Option<Order>, ReconcileError>
    where
        F: Future<Output = Result<Order, RepositoryError>>,
    {
        match self.db(fut).await {
            Ok(order) => Ok(Some(order)),
            Err(ReconcileError::Store(RepositoryError::NotFound)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn db<T, F>(&self, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, RepositoryError>>,
    {
        timeout(self.timeouts.database, fut)
            .await
            .map_err(|_| ReconcileError::Timeout("database"))?
            .map_err(ReconcileError::Store)
    }

    async fn gateway_call<T, F>(&self, fut: F) -> Result<T, ReconcileError>
    where
        F: Future<Output = Result<T, GatewayError>>,
    {
        timeout(self.timeouts.gateway, fut)
            .await
            .map_err(|_| ReconcileError::Timeout("gateway"))?
            .map_err(ReconcileError::Gateway)
    }
}
