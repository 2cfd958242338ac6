// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Exact conversion between base-unit integer amounts and decimal amounts.
//!
//! On-chain amounts arrive as fixed-point integers in a known decimal base
//! (6 for the gateway's stable tokens). All conversion here is scaled-integer
//! arithmetic on [`rust_decimal::Decimal`]; binary floats are never involved,
//! so `"1500000"` at 6 decimals round-trips through `1.5` without error.

use rust_decimal::Decimal;

/// Decimal base used by the payment gateway contract's token amounts.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid base-unit amount `{0}`: must be an unsigned integer")]
    InvalidBaseUnits(String),

    #[error("amount {0} does not fit in {1} decimal places")]
    PrecisionLoss(Decimal, u32),

    #[error("amount {0} is out of range for base-unit conversion")]
    OutOfRange(Decimal),

    #[error("negative amount {0} is not a valid monetary value")]
    Negative(Decimal),
}

/// Convert a base-unit integer string (e.g. `"1500000"`) into a decimal
/// amount at the given decimal base (e.g. `1.5` at 6 decimals).
pub fn from_base_units(raw: &str, decimals: u32) -> Result<Decimal, UnitError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(UnitError::InvalidBaseUnits(raw.to_string()));
    }
    let value: i128 = trimmed
        .parse()
        .map_err(|_| UnitError::InvalidBaseUnits(raw.to_string()))?;
    let amount = Decimal::try_from_i128_with_scale(value, decimals)
        .map_err(|_| UnitError::InvalidBaseUnits(raw.to_string()))?;
    Ok(amount.normalize())
}

/// Convert a decimal amount back into a base-unit integer string.
///
/// Fails if the amount carries more fractional digits than the base allows,
/// rather than rounding silently.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<String, UnitError> {
    if amount.is_sign_negative() {
        return Err(UnitError::Negative(amount));
    }
    let factor = Decimal::from(10u64.pow(decimals));
    let scaled = amount
        .checked_mul(factor)
        .ok_or(UnitError::OutOfRange(amount))?;
    if !scaled.fract().is_zero() {
        return Err(UnitError::PrecisionLoss(amount, decimals));
    }
    Ok(scaled.normalize().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn base_units_to_decimal() {
        assert_eq!(from_base_units("1500000", 6).unwrap(), dec!(1.5));
        assert_eq!(from_base_units("5000000", 6).unwrap(), dec!(5));
        assert_eq!(from_base_units("1", 6).unwrap(), dec!(0.000001));
        assert_eq!(from_base_units("0", 6).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn decimal_to_base_units() {
        assert_eq!(to_base_units(dec!(1.5), 6).unwrap(), "1500000");
        assert_eq!(to_base_units(dec!(5), 6).unwrap(), "5000000");
        assert_eq!(to_base_units(dec!(0.000001), 6).unwrap(), "1");
        assert_eq!(to_base_units(Decimal::ZERO, 6).unwrap(), "0");
    }

    #[test]
    fn round_trip_is_exact() {
        let amount = from_base_units("1500000", 6).unwrap();
        assert_eq!(amount, dec!(1.5));
        assert_eq!(to_base_units(amount, 6).unwrap(), "1500000");
    }

    #[test]
    fn rejects_excess_precision() {
        let err = to_base_units(dec!(1.1234567), 6).unwrap_err();
        assert!(matches!(err, UnitError::PrecisionLoss(_, 6)));
    }

    #[test]
    fn rejects_negative_amounts() {
        assert!(matches!(
            to_base_units(dec!(-1), 6),
            Err(UnitError::Negative(_))
        ));
    }

    #[test]
    fn rejects_non_integer_raw_values() {
        assert!(from_base_units("1.5", 6).is_err());
        assert!(from_base_units("-100", 6).is_err());
        assert!(from_base_units("", 6).is_err());
        assert!(from_base_units("12abc", 6).is_err());
    }
}
