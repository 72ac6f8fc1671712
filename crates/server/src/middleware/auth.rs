//! Bearer-token authentication extractors.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use template_store_core::{UserId, UserRole};

use crate::models::AuthUser;
use crate::state::AppState;

/// Access-token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Identity-provider subject.
    pub sub: String,
    /// Internal user ID, if the issuer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

/// Verifies HS256 access tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    #[must_use]
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Decode and validate a token into the caller it identifies.
    ///
    /// # Errors
    ///
    /// `AuthRejection::Expired` or `AuthRejection::InvalidToken`.
    pub fn verify(&self, token: &str) -> Result<AuthUser, AuthRejection> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthRejection::Expired,
                _ => AuthRejection::InvalidToken,
            })?
            .claims;

        // Unknown roles fall back to the least privileged one.
        let role = claims
            .role
            .as_deref()
            .and_then(|r| r.parse::<UserRole>().ok())
            .unwrap_or(UserRole::User);

        Ok(AuthUser {
            subject: claims.sub,
            user_id: claims.uid.map(UserId::new),
            role,
        })
    }
}

/// Why a request was not authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    InvalidToken,
    Expired,
    Forbidden,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingToken => (StatusCode::UNAUTHORIZED, "Missing bearer token"),
            Self::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            Self::Expired => (StatusCode::UNAUTHORIZED, "Token expired"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "Admin role required"),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthRejection::MissingToken)?;
        state.jwt().verify(token).inspect_err(|e| {
            debug!(rejection = ?e, "Bearer token rejected");
        })
    }
}

/// Extractor that requires an admin caller.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(RequireAdmin(admin): RequireAdmin) -> impl IntoResponse {
///     format!("Hello, {}!", admin.subject)
/// }
/// ```
pub struct RequireAdmin(pub AuthUser);

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AuthRejection::Forbidden);
        }
        Ok(Self(user))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::Request;
    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    const SECRET: &str = "k7Qp2Xv9Lm4Rt8Zw1Ny6Bc3Hd5Fg0Js2";

    fn token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims(role: Option<&str>, exp_offset: i64) -> Claims {
        Claims {
            sub: "auth0|abc".to_string(),
            uid: Some(7),
            role: role.map(str::to_string),
            exp: usize::try_from(chrono::Utc::now().timestamp() + exp_offset).unwrap(),
        }
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = JwtVerifier::new(&SecretString::from(SECRET));
        let user = verifier.verify(&token(&claims(Some("admin"), 3600), SECRET)).unwrap();
        assert_eq!(user.subject, "auth0|abc");
        assert_eq!(user.user_id, Some(UserId::new(7)));
        assert!(user.is_admin());
    }

    #[test]
    fn test_verify_defaults_to_user_role() {
        let verifier = JwtVerifier::new(&SecretString::from(SECRET));
        let user = verifier.verify(&token(&claims(Some("root"), 3600), SECRET)).unwrap();
        assert_eq!(user.role, UserRole::User);
    }

    #[test]
    fn test_verify_rejects_wrong_secret_and_expired() {
        let verifier = JwtVerifier::new(&SecretString::from(SECRET));
        let forged = token(&claims(None, 3600), "another-secret-entirely-0123456789");
        assert_eq!(verifier.verify(&forged), Err(AuthRejection::InvalidToken));

        let expired = token(&claims(None, -3600), SECRET);
        assert_eq!(verifier.verify(&expired), Err(AuthRejection::Expired));
    }

    #[test]
    fn test_bearer_token_parsing() {
        let (parts, ()) = Request::builder()
            .header(AUTHORIZATION, "Bearer abc.def")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts), Some("abc.def"));

        let (parts, ()) = Request::builder()
            .header(AUTHORIZATION, "Basic abc")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_token(&parts), None);
    }
}
