//! Error and skip taxonomy.
//!
//! Collaborator calls fail with [`BrokerError`]. The engine never lets one
//! escape a symbol's evaluation: every failure is turned into a
//! [`SkipReason`] and the pass moves on to the next symbol.

use std::fmt;
use std::time::Duration;

/// Failure of a call to the account, market data or order service.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),

    #[error("no open position for {0}")]
    PositionNotFound(String),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
}

impl BrokerError {
    pub fn data(msg: impl Into<String>) -> Self {
        BrokerError::DataUnavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        BrokerError::Rejected(msg.into())
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::DataUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::DataUnavailable(format!("parse error: {e}"))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Why the engine did nothing for a symbol this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Missing or insufficient price/volatility data, or a timed out call
    DataUnavailable(String),
    /// No contract satisfied the selection filter
    SelectionFailure(String),
    /// Order submission or close failed
    BrokerRejected(String),
    /// Outside the trading session
    MarketClosed,
    /// Sizer returned zero straddles
    InsufficientFunds,
    /// The broker holds a position for the symbol that this process does not manage
    ExternallyHeld,
}

impl SkipReason {
    /// Map a failed data call.
    pub fn from_data_error(err: &BrokerError) -> Self {
        match err {
            BrokerError::Rejected(msg) => SkipReason::BrokerRejected(msg.clone()),
            other => SkipReason::DataUnavailable(other.to_string()),
        }
    }

    /// Map a failed order or close call.
    pub fn from_order_error(err: &BrokerError) -> Self {
        match err {
            BrokerError::Timeout { .. } => SkipReason::DataUnavailable(err.to_string()),
            other => SkipReason::BrokerRejected(other.to_string()),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DataUnavailable(msg) => write!(f, "data unavailable: {msg}"),
            SkipReason::SelectionFailure(msg) => write!(f, "selection failure: {msg}"),
            SkipReason::BrokerRejected(msg) => write!(f, "broker rejected: {msg}"),
            SkipReason::MarketClosed => write!(f, "market closed"),
            SkipReason::InsufficientFunds => write!(f, "insufficient buying power"),
            SkipReason::ExternallyHeld => write!(f, "position held outside this runner"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_timeout_is_soft() {
        let err = BrokerError::Timeout {
            operation: "submit_order",
            elapsed: Duration::from_secs(30),
        };
        assert!(matches!(
            SkipReason::from_order_error(&err),
            SkipReason::DataUnavailable(_)
        ));
    }

    #[test]
    fn test_rejection_maps_to_broker_rejected() {
        let err = BrokerError::rejected("insufficient options buying power");
        assert_eq!(
            SkipReason::from_order_error(&err),
            SkipReason::BrokerRejected("broker rejected request: insufficient options buying power".into())
        );
        assert!(matches!(
            SkipReason::from_data_error(&BrokerError::data("no bars")),
            SkipReason::DataUnavailable(_)
        ));
    }
}
