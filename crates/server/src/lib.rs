//! Template store server library.
//!
//! Checkout initiation and payment reconciliation for the template store,
//! exposed as a library so the binary, the CLI and the integration tests
//! share one implementation.
//!
//! - [`services::checkout`] opens a gateway checkout and records a `pending` order
//! - [`services::reconciler`] turns verified gateway events into order transitions
//! - [`db`] holds the Postgres-backed stores behind their traits
//! - [`routes`] wires everything into an axum router

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod payments;
pub mod routes;
pub mod services;
pub mod state;
