//! US equity regular trading hours.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::US::Eastern;

use crate::config::SessionConfig;

/// Regular-hours gate, evaluated in US Eastern time, Monday to Friday.
///
/// Exchange holidays are not modelled; orders placed on one are rejected by
/// the broker and handled like any other rejection.
#[derive(Debug, Clone, Copy)]
pub struct MarketHours {
    open: NaiveTime,
    close: NaiveTime,
    enforce: bool,
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            enforce: true,
        }
    }
}

impl MarketHours {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let (open, close) = config.parse_times()?;
        Ok(Self {
            open,
            close,
            enforce: config.enforce,
        })
    }

    /// A gate that is always open.
    pub fn always_open() -> Self {
        Self {
            enforce: false,
            ..Self::default()
        }
    }

    /// Whether the session is open at `now`. Open is inclusive, close exclusive.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enforce {
            return true;
        }

        let local = now.with_timezone(&Eastern);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }

        let time = local.time();
        time >= self.open && time < self.close
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }
}
