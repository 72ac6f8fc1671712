//! Integration test support for the template store.
//!
//! Reconciliation is exercised end to end against in-memory fakes that
//! implement the server's store and gateway traits, so the suite runs
//! without Postgres or network access. `tests/postgres_store.rs` covers the
//! Postgres store itself and is ignored by default.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p template-store-integration-tests
//! ```
//!
//! The fakes keep the properties the real implementations guarantee:
//! [`InMemoryOrderStore::transition`] is a compare-and-swap under one lock,
//! and `create` rejects duplicate external references.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde_json::{Value, json};

use template_store_core::{
    CurrencyCode, Email, ExternalReference, OrderId, OrderStatus, TemplateId, UserId, UserRole,
};
use template_store_server::{
    db::{OrderStore, Page, RepositoryError, TemplateCatalog, UserDirectory},
    middleware::{Claims, JwtVerifier},
    models::{NewOrder, Order, Template, User},
    payments::{
        CheckoutSession, GatewayError, PaymentGateway, PaymentIntent, PaymentRequest, Refund,
        SessionPaymentStatus, WebhookVerifier,
    },
    services::{
        CheckoutService, CheckoutSettings, NotifyError, OrderNotifier, OrderReconciler,
        ReconcileTimeouts,
    },
    state::AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_Zt4pQ9wLx2Kc7Vn3Rb8Hm1Jd6Fy5Gs0A";
pub const JWT_SECRET: &str = "jwt_Q3vT8kLz1Xp6Nw4Rc9Bm2Hd7Fy5Js0Ga";
pub const BASE_URL: &str = "https://store.test";

pub const CUSTOMER_ID: UserId = UserId::new(7);
pub const CUSTOMER_SUBJECT: &str = "auth0|customer-7";
pub const OTHER_CUSTOMER_ID: UserId = UserId::new(8);
pub const ADMIN_ID: UserId = UserId::new(1);
pub const TEMPLATE_ID: TemplateId = TemplateId::new(3);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Order store
// =============================================================================

#[derive(Default)]
struct OrderTable {
    rows: Vec<Order>,
    next_id: i32,
}

/// Order store backed by a `Vec` behind a mutex.
#[derive(Default)]
pub struct InMemoryOrderStore {
    table: Mutex<OrderTable>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl InMemoryOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call sleep first, to trip the reconciler's timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    #[must_use]
    pub fn all(&self) -> Vec<Order> {
        lock(&self.table).rows.clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        lock(&self.table).rows.len()
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn find(&self, predicate: impl Fn(&Order) -> bool) -> Result<Order, RepositoryError> {
        lock(&self.table)
            .rows
            .iter()
            .rev()
            .find(|o| predicate(o))
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError> {
        self.enter().await;
        let mut table = lock(&self.table);

        if table
            .rows
            .iter()
            .any(|o| o.external_reference == order.external_reference)
        {
            return Err(RepositoryError::Conflict(format!(
                "order with reference {} already exists",
                order.external_reference
            )));
        }

        table.next_id += 1;
        let now = Utc::now();
        let created = Order {
            id: OrderId::new(table.next_id),
            user_id: order.user_id,
            template_id: order.template_id,
            external_reference: order.external_reference,
            payment_reference: order.payment_reference,
            status: order.status,
            status_detail: order.status_detail,
            amount_minor: order.amount_minor,
            currency: order.currency,
            created_at: now,
            updated_at: now,
        };
        table.rows.push(created.clone());
        Ok(created)
    }

    async fn get(&self, id: OrderId) -> Result<Order, RepositoryError> {
        self.enter().await;
        self.find(|o| o.id == id)
    }

    async fn get_by_reference(
        &self,
        reference: &ExternalReference,
    ) -> Result<Order, RepositoryError> {
        self.enter().await;
        self.find(|o| &o.external_reference == reference)
    }

    async fn get_by_payment_reference(&self, reference: &str) -> Result<Order, RepositoryError> {
        self.enter().await;
        self.find(|o| o.payment_reference.as_deref() == Some(reference))
    }

    async fn list_by_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError> {
        self.enter().await;
        Ok(lock(&self.table)
            .rows
            .iter()
            .rev()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list(&self, page: Page) -> Result<Vec<Order>, RepositoryError> {
        self.enter().await;
        let skip = usize::try_from(page.offset).unwrap_or(0);
        let take = usize::try_from(page.limit).unwrap_or(0);
        Ok(lock(&self.table)
            .rows
            .iter()
            .rev()
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        id: OrderId,
        from: &[OrderStatus],
        to: OrderStatus,
        detail: &str,
        payment_reference: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError> {
        self.enter().await;
        let mut table = lock(&self.table);

        let Some(order) = table
            .rows
            .iter_mut()
            .find(|o| o.id == id && from.contains(&o.status))
        else {
            return Ok(None);
        };

        order.status = to;
        detail.clone_into(&mut order.status_detail);
        if order.payment_reference.is_none() {
            order.payment_reference = payment_reference.map(str::to_string);
        }
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn health_check(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// =============================================================================
// Catalog and users
// =============================================================================

pub struct StaticCatalog(pub Vec<Template>);

#[async_trait]
impl TemplateCatalog for StaticCatalog {
    async fn get(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError> {
        Ok(self.0.iter().find(|t| t.id == id).cloned())
    }
}

pub struct StaticUsers(pub Vec<User>);

#[async_trait]
impl UserDirectory for StaticUsers {
    async fn get_by_id(&self, id: UserId) -> Result<Option<User>, RepositoryError> {
        Ok(self.0.iter().find(|u| u.id == id).cloned())
    }

    async fn get_by_subject(&self, subject: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self
            .0
            .iter()
            .find(|u| u.identity_subject.as_deref() == Some(subject))
            .cloned())
    }
}

fn user(id: UserId, email: &str, name: &str, subject: &str, role: UserRole) -> User {
    User {
        id,
        email: Email::parse(email).unwrap_or_else(|e| panic!("fixture email {email}: {e}")),
        name: name.to_string(),
        identity_subject: Some(subject.to_string()),
        role,
    }
}

#[must_use]
pub fn fixture_users() -> StaticUsers {
    StaticUsers(vec![
        user(ADMIN_ID, "admin@store.test", "Admin", "auth0|admin-1", UserRole::Admin),
        user(CUSTOMER_ID, "ada@example.com", "Ada", CUSTOMER_SUBJECT, UserRole::User),
        user(OTHER_CUSTOMER_ID, "bob@example.com", "Bob", "auth0|customer-8", UserRole::User),
    ])
}

/// Template 3, "Invoice Pack", 49.99.
#[must_use]
pub fn fixture_catalog() -> StaticCatalog {
    StaticCatalog(vec![Template {
        id: TEMPLATE_ID,
        name: "Invoice Pack".to_string(),
        price: Decimal::new(4999, 2),
    }])
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Default)]
struct GatewayState {
    sessions: HashMap<String, CheckoutSession>,
    refunds: Vec<String>,
    counter: u32,
}

/// Scriptable payment gateway.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a 503 from the gateway.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    /// Replace the stored session (e.g. to mark it paid).
    pub fn put_session(&self, session: CheckoutSession) {
        lock(&self.state).sessions.insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<CheckoutSession> {
        lock(&self.state).sessions.get(id).cloned()
    }

    /// Payment intents refunded so far.
    #[must_use]
    pub fn refunds(&self) -> Vec<String> {
        lock(&self.state).refunds.clone()
    }

    async fn enter(&self) -> Result<u32, GatewayError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 503,
                message: "gateway unavailable".to_string(),
            });
        }
        let mut state = lock(&self.state);
        state.counter += 1;
        Ok(state.counter)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &PaymentRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let n = self.enter().await?;
        let id = format!("cs_test_{n}");
        let session = CheckoutSession {
            id: id.clone(),
            url: Some(format!("https://checkout.stripe.test/c/pay/{id}")),
            payment_status: SessionPaymentStatus::Unpaid,
            status: Some("open".to_string()),
            payment_intent: None,
            amount_total: Some(request.amount_minor),
            currency: Some(request.currency.as_str().to_string()),
            metadata: request.metadata.clone(),
        };
        self.put_session(session.clone());
        Ok(session)
    }

    async fn create_payment_intent(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentIntent, GatewayError> {
        let n = self.enter().await?;
        let id = format!("pi_test_{n}");
        Ok(PaymentIntent {
            client_secret: Some(format!("{id}_secret_abc")),
            id,
            status: "requires_payment_method".to_string(),
            amount: request.amount_minor,
            currency: request.currency.as_str().to_string(),
            metadata: request.metadata.clone(),
            last_payment_error: None,
        })
    }

    async fn retrieve_checkout_session(&self, id: &str) -> Result<CheckoutSession, GatewayError> {
        self.enter().await?;
        self.session(id).ok_or_else(|| GatewayError::Api {
            status: 404,
            message: format!("No such checkout.session: '{id}'"),
        })
    }

    async fn create_refund(&self, payment_intent_id: &str) -> Result<Refund, GatewayError> {
        let n = self.enter().await?;
        lock(&self.state).refunds.push(payment_intent_id.to_string());
        Ok(Refund {
            id: format!("re_test_{n}"),
            status: Some("succeeded".to_string()),
            amount: 0,
        })
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Records every `order_paid` call.
#[derive(Default)]
pub struct CountingNotifier {
    sent: Mutex<Vec<OrderId>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl CountingNotifier {
    #[must_use]
    pub fn sent(&self) -> Vec<OrderId> {
        lock(&self.sent).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulate a slow mail relay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }
}

#[async_trait]
impl OrderNotifier for CountingNotifier {
    async fn order_paid(&self, order: &Order) -> Result<(), NotifyError> {
        lock(&self.sent).push(order.id);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::MissingRecord("user"));
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Everything wired together the way `AppState::from_config` does it.
pub struct TestHarness {
    pub orders: Arc<InMemoryOrderStore>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<CountingNotifier>,
    pub checkout: CheckoutService,
    pub reconciler: OrderReconciler,
    pub verifier: WebhookVerifier,
    pub state: AppState,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(ReconcileTimeouts::default())
    }

    #[must_use]
    pub fn with_timeouts(timeouts: ReconcileTimeouts) -> Self {
        let orders = Arc::new(InMemoryOrderStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let notifier = Arc::new(CountingNotifier::default());
        let templates: Arc<dyn TemplateCatalog> = Arc::new(fixture_catalog());
        let users: Arc<dyn UserDirectory> = Arc::new(fixture_users());
        let verifier = WebhookVerifier::new(
            SecretString::from(WEBHOOK_SECRET),
            Duration::from_secs(300),
        );

        let checkout = CheckoutService::new(
            orders.clone(),
            templates.clone(),
            users.clone(),
            gateway.clone(),
            CheckoutSettings {
                base_url: BASE_URL.to_string(),
                currency: CurrencyCode::Usd,
            },
        );
        let reconciler = OrderReconciler::new(
            orders.clone(),
            templates,
            users.clone(),
            gateway.clone(),
            notifier.clone(),
            verifier.clone(),
            timeouts,
        )
        .with_store_currency(CurrencyCode::Usd);
        let state = AppState::new(
            orders.clone(),
            users,
            checkout.clone(),
            reconciler.clone(),
            JwtVerifier::new(&SecretString::from(JWT_SECRET)),
        );

        Self {
            orders,
            gateway,
            notifier,
            checkout,
            reconciler,
            verifier,
            state,
        }
    }

    /// Sign `event` as the gateway would, returning body and header.
    #[must_use]
    pub fn sign(&self, event: &Value) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(event).unwrap_or_default();
        let header = self
            .verifier
            .sign(&body, Utc::now().timestamp())
            .unwrap_or_default();
        (body, header)
    }

    /// Mark a stored session complete and paid, with its payment intent.
    pub fn pay_session(&self, session_id: &str, payment_intent: &str) -> CheckoutSession {
        let mut session = self
            .gateway
            .session(session_id)
            .unwrap_or_else(|| panic!("unknown session {session_id}"));
        session.payment_status = SessionPaymentStatus::Paid;
        session.status = Some("complete".to_string());
        session.url = None;
        session.payment_intent = Some(payment_intent.to_string());
        self.gateway.put_session(session.clone());
        session
    }
}

// =============================================================================
// Event builders
// =============================================================================

/// Metadata as checkout attaches it.
#[must_use]
pub fn checkout_metadata(user_id: UserId, template_id: TemplateId, flow: &str) -> Value {
    json!({
        "template_id": template_id.to_string(),
        "user_id": user_id.to_string(),
        "flow": flow,
    })
}

fn envelope(event_type: &str, object: Value) -> Value {
    json!({
        "id": format!("evt_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        "object": "event",
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object },
    })
}

/// A `checkout.session.*` event.
#[must_use]
pub fn session_event(event_type: &str, session: &CheckoutSession) -> Value {
    let status = match session.payment_status {
        SessionPaymentStatus::Paid => "paid",
        SessionPaymentStatus::Unpaid => "unpaid",
        SessionPaymentStatus::NoPaymentRequired => "no_payment_required",
    };
    envelope(
        event_type,
        json!({
            "id": session.id,
            "object": "checkout.session",
            "payment_status": status,
            "status": session.status,
            "payment_intent": session.payment_intent,
            "amount_total": session.amount_total,
            "currency": session.currency,
            "metadata": session.metadata,
        }),
    )
}

/// A `payment_intent.*` event.
#[must_use]
pub fn intent_event(
    event_type: &str,
    id: &str,
    amount: i64,
    metadata: Value,
    error_message: Option<&str>,
) -> Value {
    let status = if event_type == "payment_intent.succeeded" {
        "succeeded"
    } else {
        "requires_payment_method"
    };
    envelope(
        event_type,
        json!({
            "id": id,
            "object": "payment_intent",
            "status": status,
            "amount": amount,
            "currency": "usd",
            "metadata": metadata,
            "last_payment_error": error_message.map(|m| json!({ "code": "card_declined", "message": m })),
        }),
    )
}

// =============================================================================
// Tokens
// =============================================================================

/// Bearer token for a fixture user.
#[must_use]
pub fn bearer(user_id: UserId, subject: &str, role: UserRole) -> String {
    let claims = Claims {
        sub: subject.to_string(),
        uid: Some(user_id.as_i32()),
        role: Some(role.to_string()),
        exp: usize::try_from(Utc::now().timestamp() + 3600).unwrap_or(usize::MAX),
    };
    let token = jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap_or_default();
    format!("Bearer {token}")
}
