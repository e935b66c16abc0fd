use anyhow::Context;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::Market;
use crate::ingest::{eastmoney, yahoo, EstimationStrategy};
use crate::retry::RetryPolicy;
use crate::time::calendar::{parse_holidays, parse_schedule_time, parse_timezone};
use crate::time::{MarketCalendar, WeekdayMask};

const DEFAULT_DATA_PATH: &str = "./data";
const DEFAULT_TOP_N: usize = 10;
const DEFAULT_TREND_WINDOW_DAYS: usize = 5;
const DEFAULT_TREND_LOOKBACK_DAYS: u32 = 30;
const DEFAULT_SNAPSHOT_LOOKBACK_LIMIT: u32 = 14;
const DEFAULT_PORT: u16 = 8080;

// Upper bounds keep every date walk far inside chrono's range.
pub const MAX_TOP_N: usize = 1_000;
pub const MAX_TREND_LOOKBACK_DAYS: u32 = 3_660;
pub const MAX_SNAPSHOT_LOOKBACK_LIMIT: u32 = 366;

/// Startup configuration errors. Any of these aborts the process before scheduling begins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown market {0:?}")]
    UnknownMarket(String),
    #[error("invalid schedule time {0:?} (expected HH:MM)")]
    InvalidScheduleTime(String),
    #[error("invalid weekday mask {0:?}")]
    InvalidWeekdayMask(String),
    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),
    #[error("invalid holiday date {0:?} (expected YYYY-MM-DD)")]
    InvalidHoliday(String),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} is required")]
    Missing(String),
    #[error("no markets are enabled")]
    NoMarketsEnabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    File,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "fs" => Ok(StoreBackend::File),
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            _ => Err(ConfigError::InvalidValue {
                key: "SNAPSHOT_STORE".to_string(),
                value: s.to_string(),
                reason: "expected file or postgres".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketSettings {
    pub market: Market,
    pub enabled: bool,
    pub calendar: MarketCalendar,
    /// Only used by markets without native fund-flow data.
    pub estimator: EstimationStrategy,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Pause between sequential per-sector upstream requests.
    pub req_delay: Duration,
    pub eastmoney_base_url: String,
    pub eastmoney_history_base_url: String,
    pub yahoo_base_url: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub markets: BTreeMap<Market, MarketSettings>,
    pub store: StoreBackend,
    pub data_path: PathBuf,
    pub database_url: Option<String>,
    pub top_n: usize,
    pub trend_window_days: usize,
    pub trend_lookback_days: u32,
    pub snapshot_lookback_limit: u32,
    pub provider: ProviderSettings,
    pub dispatch_webhook_url: Option<String>,
    pub sentry_dsn: Option<String>,
    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listed: Option<Vec<Market>> = match get("ENABLED_MARKETS") {
            Some(raw) => Some(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Market::from_str)
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        };

        let mut markets = BTreeMap::new();
        for market in Market::ALL {
            let prefix = market.env_prefix();
            let key = |suffix: &str| format!("{prefix}_{suffix}");

            let default_enabled = listed.as_ref().map_or(true, |l| l.contains(&market));
            let enabled = match get(&key("ENABLED")) {
                Some(v) => parse_bool(&key("ENABLED"), &v)?,
                None => default_enabled,
            };

            let mut calendar = MarketCalendar::default_for(market);
            if let Some(v) = get(&key("SCHEDULE_TIME")) {
                calendar.scheduled_time = parse_schedule_time(&v)?;
            }
            if let Some(v) = get(&key("DAYS_OF_WEEK")) {
                calendar.trading_weekdays = v.parse::<WeekdayMask>()?;
            }
            if let Some(v) = get(&key("TIMEZONE")) {
                calendar.timezone = parse_timezone(&v)?;
            }
            if let Some(v) = get(&key("HOLIDAYS")) {
                calendar.holidays.extend(parse_holidays(&v)?);
            }

            let estimator = match get(&key("INFLOW_ESTIMATOR")) {
                Some(v) => v.parse::<EstimationStrategy>().map_err(|err| match err {
                    ConfigError::InvalidValue { value, reason, .. } => ConfigError::InvalidValue {
                        key: key("INFLOW_ESTIMATOR"),
                        value,
                        reason,
                    },
                    other => other,
                })?,
                None => EstimationStrategy::default(),
            };

            markets.insert(
                market,
                MarketSettings {
                    market,
                    enabled,
                    calendar,
                    estimator,
                },
            );
        }

        if !markets.values().any(|m| m.enabled) {
            return Err(ConfigError::NoMarketsEnabled);
        }

        let store = match get("SNAPSHOT_STORE") {
            Some(v) => v.parse()?,
            None => StoreBackend::default(),
        };
        let database_url = get("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL".to_string()));
        }

        let top_n: usize = parse_or(&get, "TOP_N", DEFAULT_TOP_N)?;
        let trend_window_days: usize =
            parse_or(&get, "TREND_WINDOW_DAYS", DEFAULT_TREND_WINDOW_DAYS)?;
        let trend_lookback_days: u32 =
            parse_or(&get, "TREND_LOOKBACK_DAYS", DEFAULT_TREND_LOOKBACK_DAYS)?;
        let snapshot_lookback_limit: u32 =
            parse_or(&get, "SNAPSHOT_LOOKBACK_LIMIT", DEFAULT_SNAPSHOT_LOOKBACK_LIMIT)?;
        ensure_range("TOP_N", top_n, 1, MAX_TOP_N)?;
        ensure_range(
            "TREND_LOOKBACK_DAYS",
            trend_lookback_days as usize,
            1,
            MAX_TREND_LOOKBACK_DAYS as usize,
        )?;
        ensure_range(
            "TREND_WINDOW_DAYS",
            trend_window_days,
            1,
            MAX_TREND_LOOKBACK_DAYS as usize,
        )?;
        ensure_range(
            "SNAPSHOT_LOOKBACK_LIMIT",
            snapshot_lookback_limit as usize,
            1,
            MAX_SNAPSHOT_LOOKBACK_LIMIT as usize,
        )?;
        if (trend_lookback_days as usize) < trend_window_days {
            return Err(ConfigError::InvalidValue {
                key: "TREND_LOOKBACK_DAYS".to_string(),
                value: trend_lookback_days.to_string(),
                reason: "must cover at least TREND_WINDOW_DAYS".to_string(),
            });
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "PROVIDER_RETRIES", defaults.max_attempts)?.max(1),
            base_delay: Duration::from_millis(parse_or(
                &get,
                "PROVIDER_BACKOFF_MS",
                defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &get,
                "PROVIDER_MAX_BACKOFF_MS",
                defaults.max_delay.as_millis() as u64,
            )?),
        };

        let provider = ProviderSettings {
            timeout: Duration::from_secs(parse_or(&get, "PROVIDER_TIMEOUT_SECS", 30u64)?),
            retry,
            req_delay: Duration::from_millis(parse_or(&get, "PROVIDER_REQ_DELAY_MS", 150u64)?),
            eastmoney_base_url: get("EASTMONEY_BASE_URL")
                .unwrap_or_else(|| eastmoney::DEFAULT_BASE_URL.to_string()),
            eastmoney_history_base_url: get("EASTMONEY_HISTORY_BASE_URL")
                .unwrap_or_else(|| eastmoney::DEFAULT_HISTORY_BASE_URL.to_string()),
            yahoo_base_url: get("YAHOO_BASE_URL")
                .unwrap_or_else(|| yahoo::DEFAULT_BASE_URL.to_string()),
        };

        Ok(Self {
            markets,
            store,
            data_path: PathBuf::from(get("DATA_PATH").unwrap_or_else(|| DEFAULT_DATA_PATH.into())),
            database_url,
            top_n,
            trend_window_days,
            trend_lookback_days,
            snapshot_lookback_limit,
            provider,
            dispatch_webhook_url: get("DISPATCH_WEBHOOK_URL"),
            sentry_dsn: get("SENTRY_DSN"),
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
        })
    }

    pub fn market(&self, market: Market) -> Option<&MarketSettings> {
        self.markets.get(&market)
    }

    pub fn calendar(&self, market: Market) -> MarketCalendar {
        self.markets
            .get(&market)
            .map(|m| m.calendar.clone())
            .unwrap_or_else(|| MarketCalendar::default_for(market))
    }

    pub fn enabled_markets(&self) -> Vec<Market> {
        self.markets
            .values()
            .filter(|m| m.enabled)
            .map(|m| m.market)
            .collect()
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL is required")
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v.trim().parse::<T>().map_err(|err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
            reason: err.to_string(),
        }),
        None => Ok(default),
    }
}

fn ensure_range(key: &str, v: usize, min: usize, max: usize) -> Result<(), ConfigError> {
    if v < min || v > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
            reason: format!("must be between {min} and {max}"),
        });
    }
    Ok(())
}
