//! Inflow estimation for markets whose upstream has prices and volume but no fund-flow data.
//!
//! Both strategies are proxies, not measurements. They rank sectors by signed trading pressure
//! well enough for relative comparison; absolute values should not be read as currency flows.

use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EstimationStrategy {
    /// `(close - prev_close) * volume`.
    #[default]
    PriceDeltaVolume,
    /// `close * volume * change_pct / 100`: turnover signed and scaled by the day's move.
    TurnoverDirection,
}

impl EstimationStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            EstimationStrategy::PriceDeltaVolume => "price_delta_volume",
            EstimationStrategy::TurnoverDirection => "turnover_direction",
        }
    }

    pub fn estimate(self, prev_close: f64, close: f64, volume: u64) -> f64 {
        let volume = volume as f64;
        match self {
            EstimationStrategy::PriceDeltaVolume => (close - prev_close) * volume,
            EstimationStrategy::TurnoverDirection => {
                close * volume * change_pct(prev_close, close) / 100.0
            }
        }
    }
}

/// Percent change from `prev_close` to `close`. Zero when `prev_close` is not positive.
pub fn change_pct(prev_close: f64, close: f64) -> f64 {
    if prev_close > 0.0 {
        (close - prev_close) / prev_close * 100.0
    } else {
        0.0
    }
}

impl fmt::Display for EstimationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "price_delta_volume" => Ok(EstimationStrategy::PriceDeltaVolume),
            "turnover_direction" => Ok(EstimationStrategy::TurnoverDirection),
            _ => Err(ConfigError::InvalidValue {
                key: "INFLOW_ESTIMATOR".to_string(),
                value: s.to_string(),
                reason: "expected price_delta_volume or turnover_direction".to_string(),
            }),
        }
    }
}
