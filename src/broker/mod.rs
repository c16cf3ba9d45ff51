//! Brokerage integrations for the straddle runner.
//!
//! ## Traits
//! The strategy depends only on the account, market data and order
//! service traits, so any broker can be plugged in.
//!
//! ## Alpaca
//! REST client for trading (paper or live) and market data.
//!
//! ## Mock
//! In-memory broker used by the engine and scheduler tests.

pub mod alpaca;
pub mod mock;
mod traits;
mod types;

pub use alpaca::AlpacaClient;
pub use mock::MockBroker;
pub use traits::*;
pub use types::*;
