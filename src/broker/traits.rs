//! Collaborator interfaces consumed by the strategy.
//!
//! The engine only ever talks to a broker through these traits, so the
//! Alpaca adapter and the in-memory mock are interchangeable:
//! - account figures for sizing
//! - quotes, daily bars and option chains
//! - order submission, position listing and closing

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::types::*;
use crate::error::BrokerResult;

/// Account figures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn account(&self) -> BrokerResult<AccountSnapshot>;
}

/// Prices, bars and option chains.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataService: Send + Sync {
    /// Last traded price of the underlying.
    async fn latest_price(&self, symbol: &str) -> BrokerResult<Decimal>;

    /// Daily bars between `start` and `end` inclusive, ordered by date.
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BrokerResult<Vec<DailyBar>>;

    /// Active contracts expiring inside `range`, with IV attached when known.
    async fn option_chain(
        &self,
        symbol: &str,
        range: ExpiryRange,
    ) -> BrokerResult<Vec<OptionContract>>;
}

/// Orders and positions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderService: Send + Sync {
    async fn submit_order(&self, legs: &[OrderLeg], kind: OrderKind) -> BrokerResult<OrderResult>;

    /// Current status of a previously submitted order.
    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderResult>;

    /// Liquidate the whole position in `symbol`.
    ///
    /// Fails with `BrokerError::PositionNotFound` when nothing is held.
    async fn close_position(&self, symbol: &str) -> BrokerResult<OrderResult>;

    async fn list_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;
}

/// Everything the engine needs from a brokerage.
pub trait Broker: AccountService + MarketDataService + OrderService {}

impl<T> Broker for T where T: AccountService + MarketDataService + OrderService {}
