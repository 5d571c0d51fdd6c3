//! Monetary types for the ledger.
//!
//! Balances and amounts are fixed-point integers in the currency's minor
//! unit (cents for USD). `Decimal` is only used at the edges, to render or
//! parse human-readable values.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from monetary arithmetic and conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonetaryError {
    /// Operands are in different currencies.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Result does not fit in the minor-unit representation.
    #[error("Amount overflow")]
    Overflow,

    /// Value has more fractional digits than the currency allows.
    #[error("{value} has more than {places} decimal places")]
    ExcessPrecision { value: Decimal, places: u32 },

    /// Value could not be parsed.
    #[error("Invalid amount: {0}")]
    Parse(String),
}

/// An amount in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero.
    pub const ZERO: Amount = Amount(0);

    /// Create from minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Get the value in minor units.
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Check if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Checked negation.
    pub fn checked_neg(self) -> Option<Amount> {
        self.0.checked_neg().map(Amount)
    }

    /// Render as a decimal in the currency's major unit.
    pub fn to_decimal(&self, currency: &Currency) -> Decimal {
        Decimal::new(self.0, currency.decimal_places())
    }

    /// Convert a major-unit decimal into minor units.
    ///
    /// Rejects values with more precision than the currency supports rather
    /// than rounding them.
    pub fn from_decimal(value: Decimal, currency: &Currency) -> Result<Self, MonetaryError> {
        let places = currency.decimal_places();
        let mut scaled = value.round_dp(places);
        if scaled != value {
            return Err(MonetaryError::ExcessPrecision { value, places });
        }
        scaled.rescale(places);
        i64::try_from(scaled.mantissa())
            .map(Amount)
            .map_err(|_| MonetaryError::Overflow)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Amount {
    fn from(minor: i64) -> Self {
        Self(minor)
    }
}

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount in minor units.
    pub amount: Amount,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(amount: Amount, currency: Currency) -> Self {
        Self { amount, currency }
    }

    /// Parse a major-unit string such as `"12.34"`.
    pub fn parse(value: &str, currency: Currency) -> Result<Self, MonetaryError> {
        let value =
            Decimal::from_str(value.trim()).map_err(|e| MonetaryError::Parse(e.to_string()))?;
        let amount = Amount::from_decimal(value, &currency)?;
        Ok(Self { amount, currency })
    }

    /// Create a zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Amount::ZERO,
            currency,
        }
    }

    /// Value in the major unit.
    pub fn to_decimal(&self) -> Decimal {
        self.amount.to_decimal(&self.currency)
    }

    /// Add two amounts of the same currency.
    pub fn checked_add(&self, other: &Money) -> Result<Money, MonetaryError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MonetaryError::Overflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    /// Subtract two amounts of the same currency.
    pub fn checked_sub(&self, other: &Money) -> Result<Money, MonetaryError> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MonetaryError::Overflow)?;
        Ok(Money::new(amount, self.currency.clone()))
    }

    fn ensure_same_currency(&self, other: &Money) -> Result<(), MonetaryError> {
        if self.currency != other.currency {
            return Err(MonetaryError::CurrencyMismatch {
                expected: self.currency.clone(),
                actual: other.currency.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal(), self.currency)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Three ASCII letters.
    pub fn is_valid(&self) -> bool {
        self.0.len() == 3 && self.0.chars().all(|c| c.is_ascii_uppercase())
    }

    /// Get the standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Common currencies
    pub fn usd() -> Self {
        Self::new("USD")
    }

    pub fn eur() -> Self {
        Self::new("EUR")
    }

    pub fn jpy() -> Self {
        Self::new("JPY")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
