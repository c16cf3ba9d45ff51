//! Alpaca brokerage integration.
//!
//! Paper and live trading share the same API surface; only the trading
//! base URL differs. Market data always comes from the data API.

mod client;
pub mod types;

pub use client::AlpacaClient;
