//! Core types for the template store.
//!
//! This module provides type-safe wrappers for common domain concepts.

pub mod email;
pub mod id;
pub mod price;
pub mod reference;
pub mod status;

pub use email::{Email, EmailError};
pub use id::*;
pub use price::{CurrencyCode, Price, PriceError};
pub use reference::{ExternalReference, ReferenceError};
pub use status::{OrderStatus, ParseStatusError, UserRole};
