use chrono::NaiveDate;

use crate::domain::Market;
use crate::retry::Retryable;

/// Programmer-error inputs. These are the only failures a provider lets escape `fetch_current`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidRequest {
    #[error("unknown sector {sector_code:?} for market {market}")]
    UnknownSector { market: Market, sector_code: String },
    #[error("as_of_date {date} is after the latest session for {market}")]
    FutureDate { market: Market, date: NaiveDate },
    #[error("{date} is not a trading day for {market}")]
    NotTradingDay { market: Market, date: NaiveDate },
    #[error("no trading session found for {market}")]
    NoSession { market: Market },
    #[error("history length must be >= 1")]
    ZeroDays,
    #[error("history length {days} exceeds the {max}-day limit")]
    TooManyDays { days: u32, max: u32 },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Network, timeout, rate limiting or 5xx. Retried.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Invalid(#[from] InvalidRequest),
}

impl FetchError {
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let body: String = body.chars().take(512).collect();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            FetchError::Transient(format!("HTTP {status}: {body}"))
        } else {
            FetchError::Upstream {
                status: status.as_u16(),
                body,
            }
        }
    }
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Malformed(err.to_string())
    }
}
