//! Strike selection for calls, puts and straddle pairs.

use rust_decimal::Decimal;

use crate::broker::{OptionContract, OptionKind};

/// Contract of `kind` whose strike is nearest `target_price`.
///
/// With `otm_only`, calls at or below the target and puts at or above it are
/// ignored. Ties keep the first contract encountered.
pub fn select_nearest_strike(
    contracts: &[OptionContract],
    target_price: Decimal,
    kind: OptionKind,
    otm_only: bool,
) -> Option<&OptionContract> {
    let mut best: Option<(&OptionContract, Decimal)> = None;

    for contract in contracts.iter().filter(|c| c.kind == kind) {
        if otm_only {
            let in_or_at_money = match kind {
                OptionKind::Call => contract.strike <= target_price,
                OptionKind::Put => contract.strike >= target_price,
            };
            if in_or_at_money {
                continue;
            }
        }

        let distance = (contract.strike - target_price).abs();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((contract, distance));
        }
    }

    best.map(|(contract, _)| contract)
}

/// ATM call and put at the same strike and the nearest expiration.
///
/// Only strikes listed for both kinds are candidates; the strike is chosen
/// from the calls and the put is taken at that strike.
pub fn select_straddle(
    contracts: &[OptionContract],
    target_price: Decimal,
) -> Option<(OptionContract, OptionContract)> {
    let nearest = contracts.iter().map(|c| c.expiration).min()?;
    let expiring: Vec<&OptionContract> = contracts
        .iter()
        .filter(|c| c.expiration == nearest)
        .collect();
    let put_at = |call: &OptionContract| {
        expiring
            .iter()
            .find(|c| {
                c.kind == OptionKind::Put
                    && c.strike == call.strike
                    && c.underlying == call.underlying
            })
            .copied()
    };

    let paired_calls: Vec<OptionContract> = expiring
        .iter()
        .filter(|c| c.kind == OptionKind::Call && put_at(**c).is_some())
        .map(|c| (*c).clone())
        .collect();

    let call = select_nearest_strike(&paired_calls, target_price, OptionKind::Call, false)?;
    let put = put_at(call)?;
    Some((call.clone(), put.clone()))
}
