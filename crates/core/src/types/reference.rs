//! Gateway-issued correlation identifiers.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Errors that can occur when parsing an [`ExternalReference`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    /// The input string is empty.
    #[error("external reference cannot be empty")]
    Empty,
    /// The input contains characters other than ASCII letters, digits and `_`.
    #[error("external reference contains invalid characters")]
    InvalidCharacters,
    /// The input is too long.
    #[error("external reference must be at most {max} characters")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
    },
}

/// The gateway session or payment-intent ID attached to an order.
///
/// Lookups on this value are exact matches against a unique column, never
/// substring searches. Only ASCII letters, digits and `_` are accepted, which
/// covers every gateway ID format and keeps the value safe in URL paths.
///
/// ```
/// use template_store_core::ExternalReference;
///
/// let r = ExternalReference::parse("cs_test_1").unwrap();
/// assert!(r.is_checkout_session());
/// assert!(ExternalReference::parse("cs test").is_err());
/// assert!(ExternalReference::parse("../cs_test_1").is_err());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ExternalReference(String);

impl ExternalReference {
    /// Maximum accepted length.
    pub const MAX_LENGTH: usize = 255;

    /// Parse a reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is empty, too long, or contains
    /// anything outside `[A-Za-z0-9_]`.
    pub fn parse(s: &str) -> Result<Self, ReferenceError> {
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if s.len() > Self::MAX_LENGTH {
            return Err(ReferenceError::TooLong {
                max: Self::MAX_LENGTH,
            });
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(ReferenceError::InvalidCharacters);
        }
        Ok(Self(s.to_owned()))
    }

    /// The reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for hosted checkout session IDs (`cs_...`).
    #[must_use]
    pub fn is_checkout_session(&self) -> bool {
        self.0.starts_with("cs_")
    }

    /// True for payment-intent IDs (`pi_...`).
    #[must_use]
    pub fn is_payment_intent(&self) -> bool {
        self.0.starts_with("pi_")
    }
}

impl fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExternalReference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert_eq!(ExternalReference::parse(""), Err(ReferenceError::Empty));
        assert_eq!(
            ExternalReference::parse("cs_1 "),
            Err(ReferenceError::InvalidCharacters)
        );
    }

    #[test]
    fn test_parse_rejects_path_characters() {
        for input in ["../../customers/cus_1", "cs_1/refunds", "cs_1?expand=x", "cs_1%2F", "cs-1"] {
            assert_eq!(
                ExternalReference::parse(input),
                Err(ReferenceError::InvalidCharacters),
                "{input}"
            );
        }
        assert!(ExternalReference::parse("cs_test_a1B2c3").is_ok());
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let long = "x".repeat(256);
        assert!(matches!(
            ExternalReference::parse(&long),
            Err(ReferenceError::TooLong { .. })
        ));
    }

    #[test]
    fn test_kind_prefixes() {
        let pi = ExternalReference::parse("pi_3Nabc").unwrap();
        assert!(pi.is_payment_intent());
        assert!(!pi.is_checkout_session());
    }
}
