//! Exact decimal arithmetic shared by every component of the engine.
//!
//! Money never touches binary floating point. Intermediate values keep full
//! precision; `round_money` is only called at the presentation boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use crate::error::FeeEngineError;
use crate::types::{Money, Percent};
use crate::FeeEngineResult;

const HUNDRED: Decimal = dec!(100);

fn overflow(operation: &str) -> FeeEngineError {
    FeeEngineError::config(operation, "Arithmetic overflow")
}

pub fn add(a: Decimal, b: Decimal) -> FeeEngineResult<Decimal> {
    a.checked_add(b).ok_or_else(|| overflow("add"))
}

pub fn subtract(a: Decimal, b: Decimal) -> FeeEngineResult<Decimal> {
    a.checked_sub(b).ok_or_else(|| overflow("subtract"))
}

pub fn multiply(a: Decimal, b: Decimal) -> FeeEngineResult<Decimal> {
    a.checked_mul(b).ok_or_else(|| overflow("multiply"))
}

/// Divide and truncate toward zero to an integer.
pub fn divide_truncating(numerator: Decimal, denominator: Decimal) -> FeeEngineResult<Decimal> {
    if denominator.is_zero() {
        return Err(FeeEngineError::DivisionByZero {
            context: format!("{numerator} / {denominator}"),
        });
    }
    let quotient = numerator
        .checked_div(denominator)
        .ok_or_else(|| overflow("divide"))?;
    Ok(quotient.trunc())
}

/// Largest integer not greater than `value`, as a whole unit count.
///
/// Negative values are rejected: a unit allocation can never be negative.
pub fn floor_to_integer(value: Decimal) -> FeeEngineResult<u64> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(FeeEngineError::config(
            "units",
            format!("Cannot allocate a negative number of units ({value})"),
        ));
    }
    value
        .floor()
        .to_u64()
        .ok_or_else(|| overflow("floor_to_integer"))
}

/// `base * percent / 100`, at full precision.
pub fn percent_of(base: Money, percent: Percent) -> FeeEngineResult<Money> {
    let product = multiply(base, percent)?;
    product.checked_div(HUNDRED).ok_or_else(|| overflow("percent_of"))
}

/// Round a money amount for presentation, midpoint away from zero
/// (2830.185 -> 2830.19), matching how statements print cents.
pub fn round_money(value: Money, dp: u32) -> Money {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_of_keeps_full_precision() {
        let premium = percent_of(dec!(75000), dec!(3.77358)).unwrap();
        assert_eq!(premium, dec!(2830.185));
        assert_eq!(round_money(premium, 2), dec!(2830.19));
    }

    #[test]
    fn test_percent_of_whole_amount() {
        assert_eq!(
            percent_of(dec!(100000), dec!(3.77358)).unwrap(),
            dec!(3773.58)
        );
        assert_eq!(percent_of(dec!(500), dec!(100)).unwrap(), dec!(500));
    }

    #[test]
    fn test_divide_truncating_floors_positive() {
        assert_eq!(
            divide_truncating(dec!(96226.42), dec!(1000)).unwrap(),
            dec!(96)
        );
        assert_eq!(divide_truncating(dec!(999.99), dec!(1000)).unwrap(), dec!(0));
    }

    #[test]
    fn test_divide_by_zero_is_error() {
        let err = divide_truncating(dec!(10), Decimal::ZERO).unwrap_err();
        assert_eq!(err.category(), "ConfigError");
    }

    #[test]
    fn test_floor_to_integer() {
        assert_eq!(floor_to_integer(dec!(72.9999)).unwrap(), 72);
        assert_eq!(floor_to_integer(Decimal::ZERO).unwrap(), 0);
        assert!(floor_to_integer(dec!(-1.5)).is_err());
    }

    #[test]
    fn test_multiply_overflow_is_error() {
        assert!(multiply(Decimal::MAX, dec!(2)).is_err());
        assert!(add(Decimal::MAX, Decimal::MAX).is_err());
    }

    #[test]
    fn test_round_money_midpoint_away_from_zero() {
        assert_eq!(round_money(dec!(0.125), 2), dec!(0.13));
        assert_eq!(round_money(dec!(-0.125), 2), dec!(-0.13));
        assert_eq!(round_money(dec!(1.234), 2), dec!(1.23));
    }
}
