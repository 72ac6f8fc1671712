//! Template Store Core - Shared types library.
//!
//! This crate provides common types used across all template store components:
//! - `server` - REST API, checkout and payment reconciliation
//! - `cli` - Command-line tools for migrations and order administration
//! - `integration-tests` - Fakes and black-box tests
//!
//! # Architecture
//!
//! The core crate contains only types and pure logic - no I/O, no database access,
//! no HTTP clients. The order state machine lives here so every component agrees
//! on which transitions are legal.
//!
//! # Modules
//!
//! - [`types`] - Typed IDs, prices, emails, order statuses and gateway references

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
