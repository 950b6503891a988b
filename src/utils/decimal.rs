//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Number of decimal places used for every computed price.
pub const PRICE_DP: u32 = 8;

/// Round a decimal to a specific number of decimal places.
pub fn round_to_precision(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp(decimals)
}

/// Round a computed price to the engine's fixed price precision.
pub fn round_price(value: Decimal) -> Decimal {
    round_to_precision(value, PRICE_DP)
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Calculate percentage difference of `a` relative to `b`.
pub fn percentage_diff(a: Decimal, b: Decimal) -> Decimal {
    if b == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((a - b) / b).abs() * dec!(100)
}

/// Clamp negative values (e.g. from subtracting our own volume) to zero.
pub fn non_negative(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_price() {
        assert_eq!(round_price(dec!(505.000000004)), dec!(505.00000000));
        assert_eq!(round_price(dec!(0.123456789)), dec!(0.12345679));
    }

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
    }

    #[test]
    fn test_percentage_diff() {
        // |505 / 510 - 1| = 0.98%
        let diff = percentage_diff(dec!(505), dec!(510));
        assert!(diff > dec!(0.98) && diff < dec!(0.99));
        assert_eq!(percentage_diff(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_non_negative() {
        assert_eq!(non_negative(dec!(-0.5)), Decimal::ZERO);
        assert_eq!(non_negative(dec!(2)), dec!(2));
    }
}
