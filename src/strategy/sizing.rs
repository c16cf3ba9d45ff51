//! Position sizing for straddle entries.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::broker::{OptionContract, CONTRACT_MULTIPLIER};

/// Number of straddles affordable with `buying_power`, capped at `max_straddles`.
///
/// Zero means "do not trade".
pub fn compute_straddle_quantity(
    buying_power: Decimal,
    per_straddle_cost: Decimal,
    max_straddles: u32,
) -> u32 {
    if per_straddle_cost <= Decimal::ZERO || buying_power <= Decimal::ZERO {
        return 0;
    }

    let affordable = (buying_power / per_straddle_cost).floor();
    affordable
        .to_u32()
        .unwrap_or(u32::MAX)
        .min(max_straddles)
}

/// Cost of one straddle (both legs, full contract multiplier).
///
/// `None` when either leg has no observable price.
pub fn straddle_cost(call: &OptionContract, put: &OptionContract) -> Option<Decimal> {
    let call_price = call.close_price?;
    let put_price = put.close_price?;
    Some((call_price + put_price) * CONTRACT_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OptionKind;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_quantity_examples() {
        assert_eq!(compute_straddle_quantity(dec!(1000), dec!(600), 1), 1);
        assert_eq!(compute_straddle_quantity(dec!(500), dec!(600), 1), 0);
        assert_eq!(compute_straddle_quantity(dec!(5000), dec!(600), 1), 1);
    }

    #[test]
    fn test_quantity_floors_and_caps() {
        assert_eq!(compute_straddle_quantity(dec!(5000), dec!(600), 10), 8);
        assert_eq!(compute_straddle_quantity(dec!(1199.99), dec!(600), 10), 1);
        assert_eq!(compute_straddle_quantity(dec!(1200), dec!(600), 10), 2);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(compute_straddle_quantity(dec!(1000), Decimal::ZERO, 1), 0);
        assert_eq!(compute_straddle_quantity(dec!(1000), dec!(-5), 1), 0);
        assert_eq!(compute_straddle_quantity(dec!(-1000), dec!(600), 1), 0);
        assert_eq!(compute_straddle_quantity(dec!(1000), dec!(600), 0), 0);
    }

    #[test]
    fn test_straddle_cost() {
        let expiry = NaiveDate::from_ymd_opt(2025, 1, 17).unwrap();
        let call = OptionContract::new("C", "SPY", dec!(450), expiry, OptionKind::Call)
            .with_close_price(dec!(3.10));
        let put = OptionContract::new("P", "SPY", dec!(450), expiry, OptionKind::Put)
            .with_close_price(dec!(2.90));
        assert_eq!(straddle_cost(&call, &put), Some(dec!(600)));

        let unpriced = OptionContract::new("P", "SPY", dec!(450), expiry, OptionKind::Put);
        assert_eq!(straddle_cost(&call, &unpriced), None);
    }
}
