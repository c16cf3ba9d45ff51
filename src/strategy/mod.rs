//! Straddle strategy implementation.
//!
//! Contains the core logic for:
//! - Realized and implied volatility estimates
//! - ATM strike selection and position sizing
//! - Entry/exit decisions and the per-symbol lifecycle
//! - The polling loop over the symbol universe

mod engine;
mod scheduler;
mod selector;
mod session;
mod signal;
mod sizing;
mod volatility;

pub use engine::{CycleReport, StraddleEngine, StraddlePosition, SymbolOutcome, SymbolState};
pub use scheduler::{Scheduler, SchedulerMetrics};
pub use selector::{select_nearest_strike, select_straddle};
pub use session::MarketHours;
pub use signal::{entry_signal, iv_exit, value_exit, ExitReason};
pub use sizing::{compute_straddle_quantity, straddle_cost};
pub use volatility::{
    current_implied_volatility, historical_volatility, historical_volatility_from_bars,
    implied_volatility_from_chain, VolatilityEstimate,
};
