//! Realized and implied volatility estimates.
//!
//! Both estimates are optional: missing or insufficient data yields `None`
//! and is logged, never raised. The pure `*_from_*` functions work on data
//! that has already been fetched, so the engine can price and select from
//! the same chain snapshot it derived IV from.

use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::broker::{DailyBar, ExpiryRange, MarketDataService, OptionContract, OptionKind};

/// Trading days per year used to annualize daily volatility.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Historical and implied volatility for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VolatilityEstimate {
    pub historical: Option<f64>,
    pub implied: Option<f64>,
}

impl VolatilityEstimate {
    /// Both values, when both are known.
    pub fn both(&self) -> Option<(f64, f64)> {
        Some((self.historical?, self.implied?))
    }
}

/// Annualized realized volatility from daily closes.
///
/// Bars are de-duplicated by date (last one wins) and sorted, then every
/// missing calendar day is forward-filled with the previous close. Returns
/// `None` with fewer than `min_observations` points after filling.
pub fn historical_volatility_from_bars(bars: &[DailyBar], min_observations: usize) -> Option<f64> {
    let by_date: BTreeMap<NaiveDate, f64> = bars
        .iter()
        .filter_map(|bar| {
            let close = bar.close.to_f64()?;
            (close.is_finite() && close > 0.0).then_some((bar.date, close))
        })
        .collect();

    let (&first, _) = by_date.iter().next()?;
    let (&last, _) = by_date.iter().next_back()?;

    let mut closes = Vec::with_capacity(by_date.len());
    let mut previous = None;
    let mut day = first;
    while day <= last {
        if let Some(close) = by_date.get(&day) {
            previous = Some(*close);
        }
        if let Some(close) = previous {
            closes.push(close);
        }
        day += Duration::days(1);
    }

    if closes.len() < min_observations.max(3) {
        debug!(
            points = closes.len(),
            required = min_observations,
            "Not enough price history for volatility"
        );
        return None;
    }

    let returns: Vec<f64> = closes.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

    let hv = variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt();
    hv.is_finite().then_some(hv)
}

/// Fetch daily bars and compute realized volatility.
///
/// The window reaches back `2 * lookback_days` calendar days from yesterday, so
/// weekends and holidays still leave enough sessions.
pub async fn historical_volatility<M>(
    market: &M,
    symbol: &str,
    lookback_days: u32,
    min_observations: usize,
    today: NaiveDate,
) -> Option<f64>
where
    M: MarketDataService + ?Sized,
{
    let end = today - Duration::days(1);
    let start = end - Duration::days(2 * i64::from(lookback_days));

    match market.daily_bars(symbol, start, end).await {
        Ok(bars) => {
            let hv = historical_volatility_from_bars(&bars, min_observations);
            if hv.is_none() {
                warn!(%symbol, bars = bars.len(), "Historical volatility unavailable");
            }
            hv
        }
        Err(e) => {
            warn!(%symbol, error = %e, "Failed to fetch daily bars");
            None
        }
    }
}

/// Average IV of the ATM call and put at the nearest expiration.
///
/// The ATM strike minimizes `|strike - price|` over that expiration, ties
/// going to the first contract in listing order.
pub fn implied_volatility_from_chain(contracts: &[OptionContract], price: Decimal) -> Option<f64> {
    let nearest = contracts.iter().map(|c| c.expiration).min()?;
    let expiring: Vec<&OptionContract> = contracts
        .iter()
        .filter(|c| c.expiration == nearest)
        .collect();

    let mut atm_strike: Option<Decimal> = None;
    for contract in &expiring {
        let better = match atm_strike {
            Some(strike) => (contract.strike - price).abs() < (strike - price).abs(),
            None => true,
        };
        if better {
            atm_strike = Some(contract.strike);
        }
    }
    let atm_strike = atm_strike?;

    let leg_iv = |kind: OptionKind| {
        expiring
            .iter()
            .find(|c| c.kind == kind && c.strike == atm_strike)
            .and_then(|c| c.implied_volatility)
    };

    let call_iv = leg_iv(OptionKind::Call)?;
    let put_iv = leg_iv(OptionKind::Put)?;
    let iv = (call_iv + put_iv) / 2.0;

    (iv.is_finite() && iv >= 0.0).then_some(iv)
}

/// Fetch the chain and latest price and compute current implied volatility.
pub async fn current_implied_volatility<M>(
    market: &M,
    symbol: &str,
    range: ExpiryRange,
) -> Option<f64>
where
    M: MarketDataService + ?Sized,
{
    let price = match market.latest_price(symbol).await {
        Ok(price) => price,
        Err(e) => {
            warn!(%symbol, error = %e, "Failed to fetch latest price");
            return None;
        }
    };

    let chain = match market.option_chain(symbol, range).await {
        Ok(chain) => chain,
        Err(e) => {
            warn!(%symbol, error = %e, "Failed to fetch option chain");
            return None;
        }
    };

    let iv = implied_volatility_from_chain(&chain, price);
    if iv.is_none() {
        warn!(%symbol, contracts = chain.len(), %price, "Implied volatility unavailable");
    }
    iv
}
