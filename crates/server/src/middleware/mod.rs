//! HTTP middleware and extractors.
//!
//! Callers authenticate with a bearer token (HS256 JWT). Extraction:
//!
//! - [`AuthUser`](crate::models::AuthUser) - any valid token
//! - [`RequireAdmin`] - valid token with `role = "admin"`

pub mod auth;

pub use auth::{AuthRejection, Claims, JwtVerifier, RequireAdmin};
