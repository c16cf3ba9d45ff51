//! Broker-neutral type definitions shared by the engine and the adapters.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shares controlled by one listed equity option contract.
pub const CONTRACT_MULTIPLIER: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// Option kind (right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Call => write!(f, "call"),
            OptionKind::Put => write!(f, "put"),
        }
    }
}

/// Read-only snapshot of one tradable option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    /// OCC contract symbol (e.g. "SPY250117C00450000")
    pub symbol: String,
    /// Underlying equity symbol
    pub underlying: String,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub kind: OptionKind,
    /// Last observed close/trade price per share
    pub close_price: Option<Decimal>,
    /// Implied volatility as a decimal (0.25 = 25%), when the feed has it
    pub implied_volatility: Option<f64>,
}

impl OptionContract {
    /// Create a contract with no price or volatility attached.
    pub fn new(
        symbol: impl Into<String>,
        underlying: impl Into<String>,
        strike: Decimal,
        expiration: NaiveDate,
        kind: OptionKind,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            underlying: underlying.into(),
            strike,
            expiration,
            kind,
            close_price: None,
            implied_volatility: None,
        }
    }

    /// Set the observed close price.
    pub fn with_close_price(mut self, price: Decimal) -> Self {
        self.close_price = Some(price);
        self
    }

    /// Set the implied volatility.
    pub fn with_implied_volatility(mut self, iv: f64) -> Self {
        self.implied_volatility = Some(iv);
        self
    }

    /// Build a contract from its OCC symbol.
    pub fn from_occ(symbol: &str) -> Option<Self> {
        let occ = OccSymbol::parse(symbol)?;
        Some(Self::new(
            symbol,
            occ.root,
            occ.strike,
            occ.expiration,
            occ.kind,
        ))
    }
}

/// Parsed OCC option symbol: ROOT + YYMMDD + C/P + strike x 1000 (8 digits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccSymbol {
    pub root: String,
    pub expiration: NaiveDate,
    pub kind: OptionKind,
    pub strike: Decimal,
}

impl OccSymbol {
    const SUFFIX_LEN: usize = 15;

    /// Parse an OCC symbol. Returns `None` for equities and malformed input.
    pub fn parse(symbol: &str) -> Option<Self> {
        let symbol = symbol.trim();
        if !symbol.is_ascii() || symbol.len() <= Self::SUFFIX_LEN {
            return None;
        }

        let (root, suffix) = symbol.split_at(symbol.len() - Self::SUFFIX_LEN);
        let root = root.trim_end();
        if root.is_empty() || !root.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return None;
        }

        let expiration = NaiveDate::parse_from_str(&suffix[..6], "%y%m%d").ok()?;
        let kind = match &suffix[6..7] {
            "C" => OptionKind::Call,
            "P" => OptionKind::Put,
            _ => return None,
        };
        let digits = &suffix[7..];
        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let strike = Decimal::new(digits.parse::<i64>().ok()?, 3).normalize();

        Some(Self {
            root: root.to_string(),
            expiration,
            kind,
            strike,
        })
    }

    /// Format back into the canonical OCC representation.
    pub fn to_symbol(&self) -> String {
        let kind = match self.kind {
            OptionKind::Call => 'C',
            OptionKind::Put => 'P',
        };
        let millis = (self.strike * Decimal::from(1000)).trunc().to_i64().unwrap_or(0);
        format!(
            "{}{}{}{:08}",
            self.root,
            self.expiration.format("%y%m%d"),
            kind,
            millis
        )
    }
}

/// Whether a broker position symbol belongs to the given underlying.
///
/// OCC symbols are matched on their root; anything else falls back to a
/// prefix match.
pub fn position_belongs_to(position_symbol: &str, underlying: &str) -> bool {
    match OccSymbol::parse(position_symbol) {
        Some(occ) => occ.root.eq_ignore_ascii_case(underlying),
        None => position_symbol
            .to_ascii_uppercase()
            .starts_with(&underlying.to_ascii_uppercase()),
    }
}

/// One daily bar; only the close is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub close: Decimal,
}

/// Account figures needed for sizing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub cash: Decimal,
    pub equity: Decimal,
    pub options_buying_power: Decimal,
}

/// A position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    /// `None` when the broker has no current mark for the contract
    pub market_value: Option<Decimal>,
}

impl BrokerPosition {
    pub fn unrealized_pnl(&self) -> Option<Decimal> {
        self.market_value.map(|value| value - self.cost_basis)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// One leg of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u32,
}

impl OrderLeg {
    pub fn buy(symbol: impl Into<String>, quantity: u32) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::Buy,
            quantity,
        }
    }
}

/// How legs are submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    /// One order per leg
    Single,
    /// All legs in one multi-leg order
    MultiLeg,
}

/// Order status as reported on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PendingNew,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// Statuses that mean the order will not execute.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Statuses that may still produce fills.
    ///
    /// Unrecognised statuses count as working so a live order is never
    /// mistaken for a dead one.
    pub fn is_working(&self) -> bool {
        !self.is_terminal_failure() && *self != OrderStatus::Filled
    }
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub id: String,
    pub status: OrderStatus,
}

/// Expiration window for option chain requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryRange {
    pub min: NaiveDate,
    pub max: NaiveDate,
}

impl ExpiryRange {
    /// Window `[today + min_days, today + max_days]`.
    pub fn from_days(today: NaiveDate, min_days: u32, max_days: u32) -> Self {
        Self {
            min: today + chrono::Duration::days(i64::from(min_days)),
            max: today + chrono::Duration::days(i64::from(max_days)),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.min && date <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_occ_parse_call() {
        let occ = OccSymbol::parse("SPY250117C00450000").unwrap();
        assert_eq!(occ.root, "SPY");
        assert_eq!(occ.expiration, date(2025, 1, 17));
        assert_eq!(occ.kind, OptionKind::Call);
        assert_eq!(occ.strike, dec!(450));
    }

    #[test]
    fn test_occ_parse_fractional_strike() {
        let occ = OccSymbol::parse("AAPL240621P00182500").unwrap();
        assert_eq!(occ.root, "AAPL");
        assert_eq!(occ.kind, OptionKind::Put);
        assert_eq!(occ.strike, dec!(182.5));
        assert_eq!(occ.to_symbol(), "AAPL240621P00182500");
    }

    #[test]
    fn test_occ_rejects_equities() {
        assert!(OccSymbol::parse("SPY").is_none());
        assert!(OccSymbol::parse("SPY250117X00450000").is_none());
        assert!(OccSymbol::parse("SPY251317C00450000").is_none());
    }

    #[test]
    fn test_position_belongs_to() {
        assert!(position_belongs_to("SPY250117C00450000", "SPY"));
        assert!(!position_belongs_to("SPYG250117C00450000", "SPY"));
        assert!(position_belongs_to("SPY", "SPY"));
        assert!(!position_belongs_to("QQQ250117P00400000", "SPY"));
    }

    #[test]
    fn test_contract_from_occ() {
        let contract = OptionContract::from_occ("QQQ250321P00480000").unwrap();
        assert_eq!(contract.underlying, "QQQ");
        assert_eq!(contract.strike, dec!(480));
        assert_eq!(contract.kind, OptionKind::Put);
        assert!(contract.close_price.is_none());
    }

    #[test]
    fn test_expiry_range() {
        let range = ExpiryRange::from_days(date(2025, 1, 1), 5, 60);
        assert_eq!(range.min, date(2025, 1, 6));
        assert!(range.contains(date(2025, 2, 1)));
        assert!(!range.contains(date(2025, 3, 15)));
    }

    #[test]
    fn test_order_status_working() {
        assert!(OrderStatus::Accepted.is_working());
        assert!(OrderStatus::PartiallyFilled.is_working());
        assert!(OrderStatus::Other.is_working());
        assert!(!OrderStatus::Filled.is_working());
        assert!(!OrderStatus::Canceled.is_working());
    }

    #[test]
    fn test_unmarked_position_has_no_pnl() {
        let position = BrokerPosition {
            symbol: "SPY250117C00450000".to_string(),
            quantity: dec!(1),
            cost_basis: dec!(510),
            market_value: None,
        };
        assert!(position.unrealized_pnl().is_none());
    }

    #[test]
    fn test_contract_multiplier() {
        assert_eq!(CONTRACT_MULTIPLIER, dec!(100));
    }
}
