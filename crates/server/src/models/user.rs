//! User domain types.

use serde::Serialize;

use template_store_core::{Email, UserId, UserRole};

/// A store customer (domain type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    pub name: String,
    /// Subject issued by the external identity provider, if linked.
    pub identity_subject: Option<String>,
    pub role: UserRole,
}

/// The caller identified by a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// Token subject (identity-provider subject or local user ID).
    pub subject: String,
    /// Internal user ID, when the token carries one.
    pub user_id: Option<UserId>,
    pub role: UserRole,
}

impl AuthUser {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}
