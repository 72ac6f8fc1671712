//! Flat per-template pricing.
//!
//! Templates are priced in the currency's standard unit (`49.99`), while the
//! payment gateway and the `orders` table work in the smallest unit (`4999`).
//! [`Price::minor_units`] is the only place that conversion happens.

use core::fmt;
use core::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Errors converting a price to gateway units.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// Price is below zero.
    #[error("price cannot be negative (got {0})")]
    Negative(Decimal),
    /// Price does not fit in an `i64` of minor units.
    #[error("price {0} is out of range")]
    OutOfRange(Decimal),
    /// Unknown ISO 4217 currency code.
    #[error("unsupported currency: {0}")]
    UnsupportedCurrency(String),
}

/// A price with currency information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    /// Amount in the currency's standard unit (e.g., dollars, not cents).
    pub amount: Decimal,
    /// ISO 4217 currency code.
    pub currency: CurrencyCode,
}

impl Price {
    /// Create a new price.
    #[must_use]
    pub const fn new(amount: Decimal, currency: CurrencyCode) -> Self {
        Self { amount, currency }
    }

    /// Amount in the smallest currency unit, rounded half away from zero.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Negative`] for negative prices and
    /// [`PriceError::OutOfRange`] if the result overflows `i64`.
    pub fn minor_units(&self) -> Result<i64, PriceError> {
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(PriceError::Negative(self.amount));
        }

        let scale = Decimal::from(10_i64.pow(self.currency.minor_digits()));
        self.amount
            .checked_mul(scale)
            .map(|v| v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
            .and_then(|v| v.to_i64())
            .ok_or(PriceError::OutOfRange(self.amount))
    }
}

/// ISO 4217 currency codes accepted by the store.
///
/// Serialized in lowercase, which is what the gateway expects on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyCode {
    #[default]
    Usd,
    Eur,
    Gbp,
    Cad,
    Aud,
}

impl CurrencyCode {
    /// Lowercase code as sent to the gateway.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Eur => "eur",
            Self::Gbp => "gbp",
            Self::Cad => "cad",
            Self::Aud => "aud",
        }
    }

    /// Number of decimal digits in the minor unit.
    #[must_use]
    pub const fn minor_digits(&self) -> u32 {
        2
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyCode {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usd" => Ok(Self::Usd),
            "eur" => Ok(Self::Eur),
            "gbp" => Ok(Self::Gbp),
            "cad" => Ok(Self::Cad),
            "aud" => Ok(Self::Aud),
            _ => Err(PriceError::UnsupportedCurrency(s.to_owned())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn usd(s: &str) -> Price {
        Price::new(s.parse().unwrap(), CurrencyCode::Usd)
    }

    #[test]
    fn test_minor_units_exact() {
        assert_eq!(usd("49.99").minor_units().unwrap(), 4999);
        assert_eq!(usd("10").minor_units().unwrap(), 1000);
        assert_eq!(usd("0").minor_units().unwrap(), 0);
    }

    #[test]
    fn test_minor_units_rounds_half_away_from_zero() {
        assert_eq!(usd("0.005").minor_units().unwrap(), 1);
        assert_eq!(usd("19.994").minor_units().unwrap(), 1999);
    }

    #[test]
    fn test_minor_units_rejects_negative() {
        assert!(matches!(
            usd("-1.00").minor_units(),
            Err(PriceError::Negative(_))
        ));
    }

    #[test]
    fn test_currency_parse_is_case_insensitive() {
        assert_eq!("USD".parse::<CurrencyCode>().unwrap(), CurrencyCode::Usd);
        assert_eq!("eur".parse::<CurrencyCode>().unwrap(), CurrencyCode::Eur);
        assert!("xyz".parse::<CurrencyCode>().is_err());
    }

    #[test]
    fn test_currency_serializes_lowercase() {
        let json = serde_json::to_string(&CurrencyCode::Gbp).unwrap();
        assert_eq!(json, "\"gbp\"");
    }
}
