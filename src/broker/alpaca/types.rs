//! Type definitions for Alpaca API requests and responses.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::broker::types::{
    AccountSnapshot, BrokerPosition, DailyBar, OptionContract, OptionKind, OrderResult,
    OrderSide, OrderStatus,
};

/// Trading account.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub cash: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub equity: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub options_buying_power: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub buying_power: Option<Decimal>,
    #[serde(default)]
    pub options_trading_level: Option<u8>,
}

impl From<Account> for AccountSnapshot {
    fn from(a: Account) -> Self {
        // Accounts without options approval omit the field entirely
        let options_buying_power = a
            .options_buying_power
            .or(a.buying_power)
            .unwrap_or(Decimal::ZERO);
        Self {
            cash: a.cash,
            equity: a.equity,
            options_buying_power,
        }
    }
}

/// Open position.
#[derive(Debug, Clone, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cost_basis: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub market_value: Option<Decimal>,
    #[serde(default)]
    pub asset_class: Option<String>,
}

impl From<Position> for BrokerPosition {
    fn from(p: Position) -> Self {
        Self {
            symbol: p.symbol,
            quantity: p.qty,
            cost_basis: p.cost_basis,
            market_value: p.market_value,
        }
    }
}

/// Order leg for multi-leg (`mleg`) orders.
#[derive(Debug, Clone, Serialize)]
pub struct OrderLegRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub ratio_qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_intent: Option<String>,
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<OrderSide>,
    #[serde(rename = "type")]
    pub order_type: String,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_class: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub legs: Vec<OrderLegRequest>,
}

/// Order as returned by the order and position endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub side: Option<OrderSide>,
    #[serde(default)]
    pub order_class: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub filled_avg_price: Option<Decimal>,
    /// Child orders of a multi-leg order
    #[serde(default)]
    pub legs: Option<Vec<Order>>,
}

impl Order {
    /// Symbols traded by this order, legs included.
    pub fn symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self
            .symbol
            .as_deref()
            .filter(|s| !s.is_empty())
            .into_iter()
            .collect();
        for leg in self.legs.iter().flatten() {
            symbols.extend(leg.symbols());
        }
        symbols
    }
}

impl From<Order> for OrderResult {
    fn from(o: Order) -> Self {
        Self {
            id: o.id,
            status: o.status,
        }
    }
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<i64>,
    pub message: String,
}

/// Response of `/v2/options/contracts`.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionContractsResponse {
    #[serde(default)]
    pub option_contracts: Vec<RawOptionContract>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Option contract as listed by the trading API.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOptionContract {
    pub symbol: String,
    pub underlying_symbol: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    #[serde(with = "rust_decimal::serde::str")]
    pub strike_price: Decimal,
    pub expiration_date: NaiveDate,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub tradable: Option<bool>,
}

impl From<RawOptionContract> for OptionContract {
    fn from(c: RawOptionContract) -> Self {
        Self {
            symbol: c.symbol,
            underlying: c.underlying_symbol,
            strike: c.strike_price,
            expiration: c.expiration_date,
            kind: c.kind,
            close_price: c.close_price,
            implied_volatility: None,
        }
    }
}

/// Response of `/v1beta1/options/snapshots/{underlying}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionSnapshotsResponse {
    #[serde(default)]
    pub snapshots: HashMap<String, OptionSnapshot>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSnapshot {
    #[serde(default)]
    pub implied_volatility: Option<f64>,
    #[serde(default)]
    pub latest_trade: Option<Trade>,
}

/// Response of `/v2/stocks/{symbol}/trades/latest`.
#[derive(Debug, Clone, Deserialize)]
pub struct LatestTradeResponse {
    #[serde(default)]
    pub symbol: Option<String>,
    pub trade: Trade,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Trade {
    #[serde(rename = "p")]
    pub price: Decimal,
    #[serde(rename = "t", default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Response of `/v2/stocks/{symbol}/bars`.
#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<Bar>>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "c")]
    pub close: Decimal,
}

impl From<Bar> for DailyBar {
    fn from(b: Bar) -> Self {
        Self {
            date: b.timestamp.date_naive(),
            close: b.close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_account_falls_back_to_buying_power() {
        let json = r#"{"id":"abc","cash":"2500.50","equity":"10000","buying_power":"5000"}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        let snapshot: AccountSnapshot = account.into();
        assert_eq!(snapshot.cash, dec!(2500.50));
        assert_eq!(snapshot.options_buying_power, dec!(5000));
    }

    #[test]
    fn test_contract_parse() {
        let json = r#"{
            "id": "6e58f870-fe73-4583-81e4-b9a37892c36f",
            "symbol": "SPY250117C00450000",
            "name": "SPY Jan 17 2025 450 Call",
            "status": "active",
            "tradable": true,
            "expiration_date": "2025-01-17",
            "root_symbol": "SPY",
            "underlying_symbol": "SPY",
            "type": "call",
            "style": "american",
            "strike_price": "450",
            "size": "100",
            "close_price": "12.35"
        }"#;
        let raw: RawOptionContract = serde_json::from_str(json).unwrap();
        let contract: OptionContract = raw.into();
        assert_eq!(contract.kind, OptionKind::Call);
        assert_eq!(contract.strike, dec!(450));
        assert_eq!(contract.close_price, Some(dec!(12.35)));
    }

    #[test]
    fn test_contract_without_close_price() {
        let json = r#"{"symbol":"SPY250117P00450000","underlying_symbol":"SPY","type":"put",
            "strike_price":"450","expiration_date":"2025-01-17","close_price":null}"#;
        let raw: RawOptionContract = serde_json::from_str(json).unwrap();
        assert!(raw.close_price.is_none());
    }

    #[test]
    fn test_order_status_parse() {
        let order: Order =
            serde_json::from_str(r#"{"id":"o-1","status":"pending_new"}"#).unwrap();
        assert_eq!(order.status, OrderStatus::PendingNew);

        let order: Order =
            serde_json::from_str(r#"{"id":"o-2","status":"done_for_day"}"#).unwrap();
        assert_eq!(order.status, OrderStatus::Other);
    }

    #[test]
    fn test_position_without_market_value() {
        let json = r#"{"symbol":"SPY250117C00450000","qty":"1","cost_basis":"510","market_value":null}"#;
        let position: BrokerPosition = serde_json::from_str::<Position>(json).unwrap().into();
        assert!(position.market_value.is_none());
    }

    #[test]
    fn test_mleg_order_symbols() {
        let json = r#"{
            "id": "o-3",
            "status": "filled",
            "symbol": "",
            "qty": "1",
            "order_class": "mleg",
            "submitted_at": "2025-01-15T15:00:00Z",
            "legs": [
                {"id": "l-1", "status": "filled", "symbol": "SPY250117C00450000", "side": "buy"},
                {"id": "l-2", "status": "filled", "symbol": "SPY250117P00450000", "side": "buy"}
            ]
        }"#;
        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(
            order.symbols(),
            vec!["SPY250117C00450000", "SPY250117P00450000"]
        );
        assert_eq!(order.qty, Some(dec!(1)));
        assert_eq!(order.legs.unwrap()[0].side, Some(OrderSide::Buy));
    }

    #[test]
    fn test_mleg_request_serialization() {
        let request = NewOrderRequest {
            symbol: None,
            qty: "2".to_string(),
            side: None,
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            order_class: Some("mleg".to_string()),
            legs: vec![OrderLegRequest {
                symbol: "SPY250117C00450000".to_string(),
                side: OrderSide::Buy,
                ratio_qty: "1".to_string(),
                position_intent: Some("buy_to_open".to_string()),
            }],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["order_class"], "mleg");
        assert_eq!(value["legs"][0]["side"], "buy");
        assert!(value.get("symbol").is_none());
    }
}
