//! `PgOrderStore` against a real database.
//!
//! These tests require:
//! - A running `PostgreSQL` database
//! - `DATABASE_URL` pointing at a role that may create databases
//!
//! Each test gets a fresh database with `crates/server/migrations` applied.
//!
//! Run with: `cargo test -p template-store-integration-tests -- --ignored`

#![allow(clippy::unwrap_used)]

use sqlx::PgPool;

use template_store_core::{CurrencyCode, ExternalReference, OrderStatus, TemplateId, UserId};
use template_store_server::db::{OrderStore, PgOrderStore, RepositoryError};
use template_store_server::models::{NewOrder, Order};

async fn seed(pool: &PgPool) -> (UserId, TemplateId) {
    let user_id: i32 = sqlx::query_scalar(
        "INSERT INTO store.users (email, name, role) VALUES ('buyer@example.com', 'Buyer', 'user') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    let template_id: i32 = sqlx::query_scalar(
        "INSERT INTO store.templates (name, price) VALUES ('Invoice Pack', 49.99) RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    (UserId::new(user_id), TemplateId::new(template_id))
}

fn new_order(user_id: UserId, template_id: TemplateId, reference: &str) -> NewOrder {
    NewOrder {
        user_id,
        template_id,
        external_reference: ExternalReference::parse(reference).unwrap(),
        payment_reference: None,
        status: OrderStatus::Pending,
        status_detail: String::new(),
        amount_minor: 4999,
        currency: CurrencyCode::Usd,
    }
}

async fn pending_order(store: &PgOrderStore, pool: &PgPool, reference: &str) -> Order {
    let (user_id, template_id) = seed(pool).await;
    store
        .create(new_order(user_id, template_id, reference))
        .await
        .unwrap()
}

// =============================================================================
// Conditional transitions
// =============================================================================

#[sqlx::test(migrations = "../server/migrations")]
#[ignore = "Requires Postgres"]
async fn test_concurrent_transitions_apply_once(pool: PgPool) {
    let store = PgOrderStore::new(pool.clone());
    let order = pending_order(&store, &pool, "cs_test_race").await;

    let (a, b) = tokio::join!(
        store.transition(order.id, &[OrderStatus::Pending], OrderStatus::Paid, "first", Some("pi_a")),
        store.transition(order.id, &[OrderStatus::Pending], OrderStatus::Paid, "second", Some("pi_b")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(usize::from(a.is_some()) + usize::from(b.is_some()), 1);
    let winner = a.or(b).unwrap();
    assert_eq!(winner.status, OrderStatus::Paid);

    let stored = store.get(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Paid);
    assert_eq!(stored.payment_reference, winner.payment_reference);
}

#[sqlx::test(migrations = "../server/migrations")]
#[ignore = "Requires Postgres"]
async fn test_transition_from_wrong_status_changes_nothing(pool: PgPool) {
    let store = PgOrderStore::new(pool.clone());
    let order = pending_order(&store, &pool, "cs_test_guard").await;

    let moved = store
        .transition(order.id, &[OrderStatus::Paid], OrderStatus::Delivered, "", None)
        .await
        .unwrap();
    assert!(moved.is_none());
    assert_eq!(store.get(order.id).await.unwrap().status, OrderStatus::Pending);
}

#[sqlx::test(migrations = "../server/migrations")]
#[ignore = "Requires Postgres"]
async fn test_payment_reference_is_set_once(pool: PgPool) {
    let store = PgOrderStore::new(pool.clone());
    let order = pending_order(&store, &pool, "cs_test_ref").await;

    let paid = store
        .transition(order.id, &[OrderStatus::Pending], OrderStatus::Paid, "", Some("pi_first"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paid.payment_reference.as_deref(), Some("pi_first"));

    let delivered = store
        .transition(order.id, &[OrderStatus::Paid], OrderStatus::Delivered, "", Some("pi_second"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.payment_reference.as_deref(), Some("pi_first"));

    let found = store.get_by_payment_reference("pi_first").await.unwrap();
    assert_eq!(found.id, order.id);
    assert!(matches!(
        store.get_by_payment_reference("pi_second").await,
        Err(RepositoryError::NotFound)
    ));
}

// =============================================================================
// Creation and lookups
// =============================================================================

#[sqlx::test(migrations = "../server/migrations")]
#[ignore = "Requires Postgres"]
async fn test_duplicate_reference_is_conflict(pool: PgPool) {
    let store = PgOrderStore::new(pool.clone());
    let order = pending_order(&store, &pool, "cs_test_dup").await;

    let again = store
        .create(new_order(order.user_id, order.template_id, "cs_test_dup"))
        .await;
    assert!(matches!(again, Err(RepositoryError::Conflict(_))));
    assert_eq!(store.list_by_user(order.user_id).await.unwrap().len(), 1);
}

#[sqlx::test(migrations = "../server/migrations")]
#[ignore = "Requires Postgres"]
async fn test_reference_lookup_is_exact(pool: PgPool) {
    let store = PgOrderStore::new(pool.clone());
    let order = pending_order(&store, &pool, "cs_test_exact").await;

    let found = store
        .get_by_reference(&ExternalReference::parse("cs_test_exact").unwrap())
        .await
        .unwrap();
    assert_eq!(found.id, order.id);
    assert_eq!(found.amount_minor, 4999);
    assert_eq!(found.currency, CurrencyCode::Usd);

    let prefix = store
        .get_by_reference(&ExternalReference::parse("cs_test").unwrap())
        .await;
    assert!(matches!(prefix, Err(RepositoryError::NotFound)));
    store.health_check().await.unwrap();
}
