//! # Straddle Runner
//!
//! Volatility-driven long straddle trading on Alpaca.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `broker`: Collaborator traits, Alpaca REST adapter and in-memory mock broker
//! - `strategy`: Volatility estimates, strike selection, sizing and the straddle engine
//! - `error`: Broker errors and per-symbol skip reasons

pub mod broker;
pub mod config;
pub mod error;
pub mod strategy;

pub use config::Config;
