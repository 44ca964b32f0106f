//! Decimal helpers. All amounts are major-unit values with two decimal places.

use bigdecimal::BigDecimal;

pub const SCALE: i64 = 2;

pub fn zero() -> BigDecimal {
    BigDecimal::from(0)
}

/// Rounds half away from zero to two decimal places.
pub fn round_minor(value: &BigDecimal) -> BigDecimal {
    let half = BigDecimal::new(5.into(), SCALE + 1);
    if value < &zero() {
        -((-value.clone()) + half).with_scale(SCALE)
    } else {
        (value.clone() + half).with_scale(SCALE)
    }
}

/// True when `value` carries no more precision than the ledger stores.
pub fn has_minor_precision(value: &BigDecimal) -> bool {
    &value.with_scale(SCALE) == value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_minor_half_up() {
        assert_eq!(round_minor(&dec("1.005")), dec("1.01"));
        assert_eq!(round_minor(&dec("1.004")), dec("1.00"));
        assert_eq!(round_minor(&dec("750")), dec("750.00"));
    }

    #[test]
    fn test_round_minor_negative() {
        assert_eq!(round_minor(&dec("-2.345")), dec("-2.35"));
    }

    #[test]
    fn test_minor_precision() {
        assert!(has_minor_precision(&dec("10.25")));
        assert!(has_minor_precision(&dec("10")));
        assert!(!has_minor_precision(&dec("10.251")));
    }
}
