use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Market {
    AShare,
    Us,
    Hk,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::AShare, Market::Us, Market::Hk];

    /// Canonical key used in config, storage paths and database rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Market::AShare => "a_share",
            Market::Us => "us",
            Market::Hk => "hk",
        }
    }

    /// Prefix for per-market environment keys (`US_SCHEDULE_TIME`, ...).
    pub fn env_prefix(self) -> &'static str {
        match self {
            Market::AShare => "A_SHARE",
            Market::Us => "US",
            Market::Hk => "HK",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Market::AShare => "China A-share",
            Market::Us => "US",
            Market::Hk => "Hong Kong",
        }
    }

    pub fn currency(self) -> Currency {
        match self {
            Market::AShare => Currency::Cny,
            Market::Us => Currency::Usd,
            Market::Hk => Currency::Hkd,
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a_share" | "a" | "ashare" | "cn" | "china" => Ok(Market::AShare),
            "us" | "usa" | "america" | "american" => Ok(Market::Us),
            "hk" | "hongkong" | "hong_kong" | "hkg" => Ok(Market::Hk),
            _ => Err(ConfigError::UnknownMarket(s.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Cny,
    Usd,
    Hkd,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Cny => "CNY",
            Currency::Usd => "USD",
            Currency::Hkd => "HKD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CNY" => Ok(Currency::Cny),
            "USD" => Ok(Currency::Usd),
            "HKD" => Ok(Currency::Hkd),
            other => Err(format!("unknown currency {other:?}")),
        }
    }
}
