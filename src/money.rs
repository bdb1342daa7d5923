//! Money Module
//!
//! Balances and amounts are `rust_decimal::Decimal` values carrying at most
//! [`MONEY_SCALE`] fractional digits. All client-facing conversions go through
//! this module.
//!
//! ## Rules
//! 1. No silent rounding: an amount with more fractional digits than
//!    `MONEY_SCALE` is rejected, never truncated.
//! 2. Comparisons are exact. `balance >= amount` has no epsilon because the
//!    representation is decimal, not binary floating point.
//! 3. Stored values are rescaled to exactly `MONEY_SCALE` so `100` and
//!    `100.00` compare and print identically.
//!
//! ## Usage
//! ```rust
//! use bank_core::money::{format_amount, parse_amount};
//!
//! let amount = parse_amount("12.5").unwrap();
//! assert_eq!(format_amount(amount), "12.50");
//! ```

use rust_decimal::Decimal;
use thiserror::Error;

/// Fractional digits carried by every balance and amount (currency minor units)
pub const MONEY_SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must not be negative")]
    Negative,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Parse a client amount string ("100", "12.50")
///
/// Rejects signs, empty input, ambiguous forms like ".5" or "5.", and more
/// than `MONEY_SCALE` fractional digits. Zero is accepted here; whether zero is
/// allowed depends on the transaction type.
pub fn parse_amount(amount_str: &str) -> Result<Decimal, MoneyError> {
    let amount_str = amount_str.trim();
    if amount_str.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }

    if amount_str.starts_with('-') {
        return Err(MoneyError::Negative);
    }
    if amount_str.starts_with('+') {
        return Err(MoneyError::InvalidFormat("explicit sign not allowed".into()));
    }

    let parts: Vec<&str> = amount_str.split('.').collect();
    match parts.as_slice() {
        [whole] => ensure_digits(whole)?,
        [whole, frac] => {
            if whole.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing leading zero (e.g., use 0.5 instead of .5)".into(),
                ));
            }
            if frac.is_empty() {
                return Err(MoneyError::InvalidFormat(
                    "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
                ));
            }
            ensure_digits(whole)?;
            ensure_digits(frac)?;
        }
        _ => return Err(MoneyError::InvalidFormat("multiple decimal points".into())),
    }

    let value: Decimal = amount_str.parse().map_err(|e: rust_decimal::Error| {
        let msg = e.to_string();
        if msg.contains("overflow") || msg.contains("too large") {
            MoneyError::Overflow
        } else {
            MoneyError::InvalidFormat(msg)
        }
    })?;

    normalize(value)
}

fn ensure_digits(part: &str) -> Result<(), MoneyError> {
    if part.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(MoneyError::InvalidFormat(format!("invalid character in '{}'", part)))
    }
}

/// Validate a decimal amount and rescale it to `MONEY_SCALE`
///
/// Trailing zeros beyond the scale are tolerated ("1.500" is 1.50); real
/// sub-cent digits are rejected.
pub fn normalize(value: Decimal) -> Result<Decimal, MoneyError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(MoneyError::Negative);
    }

    let trimmed = value.normalize();
    if trimmed.scale() > MONEY_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: trimmed.scale(),
            max: MONEY_SCALE,
        });
    }

    let mut scaled = trimmed;
    scaled.rescale(MONEY_SCALE);
    // -0 normalizes to 0
    scaled.set_sign_positive(true);
    Ok(scaled)
}

/// Render an amount with exactly `MONEY_SCALE` fractional digits
pub fn format_amount(value: Decimal) -> String {
    format!("{:.prec$}", value, prec = MONEY_SCALE as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_parse_whole_and_fraction() {
        assert_eq!(parse_amount("100").unwrap(), d("100.00"));
        assert_eq!(parse_amount("12.5").unwrap(), d("12.50"));
        assert_eq!(parse_amount("0.01").unwrap(), d("0.01"));
        assert_eq!(parse_amount(" 7 ").unwrap(), d("7.00"));
    }

    #[test]
    fn test_parse_zero_is_allowed() {
        assert!(parse_amount("0").unwrap().is_zero());
    }

    #[test]
    fn test_parse_rejects_bad_formats() {
        assert!(matches!(parse_amount(""), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount(".5"), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("5."), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("1.2.3"), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("+5"), Err(MoneyError::InvalidFormat(_))));
        assert!(matches!(parse_amount("1e5"), Err(MoneyError::InvalidFormat(_))));
        assert_eq!(parse_amount("-5"), Err(MoneyError::Negative));
    }

    #[test]
    fn test_parse_rejects_sub_cent_precision() {
        assert_eq!(
            parse_amount("0.001"),
            Err(MoneyError::PrecisionOverflow {
                provided: 3,
                max: MONEY_SCALE
            })
        );
    }

    #[test]
    fn test_normalize_tolerates_trailing_zeros() {
        assert_eq!(normalize(d("1.500")).unwrap(), d("1.50"));
        assert_eq!(normalize(d("1.500")).unwrap().scale(), MONEY_SCALE);
        assert!(normalize(d("1.505")).is_err());
        assert_eq!(normalize(d("-1")), Err(MoneyError::Negative));
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(d("400")), "400.00");
        assert_eq!(format_amount(d("0.5")), "0.50");
    }
}
