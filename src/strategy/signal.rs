//! Entry and exit rules.

use rust_decimal::Decimal;
use std::fmt;

/// Enter when implied volatility is rich relative to realized volatility.
///
/// Strict inequality; a non-positive `hv` never triggers.
pub fn entry_signal(hv: f64, iv: f64, multiplier: f64) -> bool {
    hv > 0.0 && iv > multiplier * hv
}

/// Why an open straddle is being closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitReason {
    /// Implied volatility fell below the configured fraction of entry IV
    IvCollapse { current_iv: f64, entry_iv: f64 },
    ProfitTarget { value: Decimal },
    StopLoss { value: Decimal },
    /// Both legs disappeared from the broker
    ClosedExternally,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::IvCollapse {
                current_iv,
                entry_iv,
            } => write!(f, "IV collapse ({:.4} vs entry {:.4})", current_iv, entry_iv),
            ExitReason::ProfitTarget { value } => write!(f, "profit target (value {})", value),
            ExitReason::StopLoss { value } => write!(f, "stop loss (value {})", value),
            ExitReason::ClosedExternally => write!(f, "closed externally"),
        }
    }
}

/// Exit A: `current_iv < fraction * entry_iv`.
pub fn iv_exit(current_iv: f64, entry_iv: f64, fraction: f64) -> Option<ExitReason> {
    (current_iv < fraction * entry_iv).then_some(ExitReason::IvCollapse {
        current_iv,
        entry_iv,
    })
}

/// Exit B: value at or beyond the profit target or the stop loss.
pub fn value_exit(
    value: Decimal,
    entry_cost: Decimal,
    profit_target: Decimal,
    stop_loss: Decimal,
) -> Option<ExitReason> {
    if value >= entry_cost * (Decimal::ONE + profit_target) {
        Some(ExitReason::ProfitTarget { value })
    } else if value <= entry_cost * (Decimal::ONE - stop_loss) {
        Some(ExitReason::StopLoss { value })
    } else {
        None
    }
}
