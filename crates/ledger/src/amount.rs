//! Transaction amounts.
//!
//! Amounts are positive integral minor units (whole coins) carried in an
//! `i64`. Stored balances are plain `i64` and may be zero (or negative for
//! the treasury); `Amount` is reserved for the value a transaction moves,
//! which must be strictly positive.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use goldmint_core::{DomainError, DomainResult};

/// Positive amount in minor units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    /// Build an amount from minor units; rejects zero and negatives.
    pub fn from_minor(value: i64) -> DomainResult<Self> {
        if value <= 0 {
            return Err(DomainError::validation(format!(
                "amount must be positive, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    /// Parse an amount from a JSON value: an integer number or a string of
    /// whole minor units. Fractional, non-finite, and non-numeric inputs are
    /// rejected.
    pub fn from_json(value: &serde_json::Value) -> DomainResult<Self> {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::from_minor(v)
                } else if let Some(f) = n.as_f64() {
                    if !f.is_finite() || f.fract() != 0.0 || f > i64::MAX as f64 {
                        Err(DomainError::validation(format!(
                            "amount must be a whole number of units, got {n}"
                        )))
                    } else {
                        Self::from_minor(f as i64)
                    }
                } else {
                    Err(DomainError::validation(format!("amount out of range: {n}")))
                }
            }
            serde_json::Value::String(s) => s.parse(),
            other => Err(DomainError::validation(format!(
                "amount must be a number or numeric string, got {other}"
            ))),
        }
    }
}

impl TryFrom<i64> for Amount {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_minor(value)
    }
}

impl From<Amount> for i64 {
    fn from(value: Amount) -> Self {
        value.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for Amount {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| DomainError::validation(format!("unparseable amount: {s:?}")))?;
        Self::from_minor(value)
    }
}
