use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Settings;
use crate::domain::{Market, SectorSnapshot, SnapshotSet};
use crate::ingest::a_share::AShareProvider;
use crate::ingest::eastmoney::EastMoneyClient;
use crate::ingest::error::{FetchError, InvalidRequest};
use crate::ingest::hk::HkSectorProvider;
use crate::ingest::us::UsSectorProvider;
use crate::ingest::yahoo::YahooChartClient;
use crate::time::MarketCalendar;

/// Failures beyond this many in one batch are counted but not logged individually.
const MAX_LOGGED_FAILURES: usize = 10;

/// Longest history a provider serves in one call, about ten years of calendar days.
pub const MAX_HISTORY_DAYS: u32 = 3_660;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorFailure {
    pub sector_code: String,
    pub reason: String,
}

/// Result of one `fetch_current` call. Per-sector failures are listed, never raised; a
/// provider-wide failure leaves `snapshots` empty and sets `degraded`.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub snapshots: SnapshotSet,
    pub failures: Vec<SectorFailure>,
    pub degraded: Option<String>,
}

impl FetchOutcome {
    pub fn degraded(market: Market, as_of_date: NaiveDate, reason: impl Into<String>) -> Self {
        Self {
            snapshots: SnapshotSet::new(market, as_of_date),
            failures: Vec::new(),
            degraded: Some(reason.into()),
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

#[async_trait::async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn market(&self) -> Market;

    fn provider_name(&self) -> &'static str;

    /// Sector flow for one session (default: the most recent closed session).
    ///
    /// Only invalid inputs are errors. Upstream trouble is reported inside the outcome.
    async fn fetch_current(&self, as_of_date: Option<NaiveDate>)
        -> Result<FetchOutcome, InvalidRequest>;

    /// Up to `days` most recent sessions for one sector, oldest first.
    async fn fetch_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError>;

    /// Every sector code the provider covers, including ones that failed in the listing.
    async fn sector_codes(&self) -> Result<Vec<String>, FetchError> {
        let current = self.fetch_current(None).await?;
        let mut codes: Vec<String> = current
            .snapshots
            .sector_codes()
            .map(str::to_string)
            .chain(current.failures.into_iter().map(|f| f.sector_code))
            .collect();
        if codes.is_empty() {
            if let Some(reason) = current.degraded {
                return Err(FetchError::Transient(reason));
            }
        }
        codes.sort();
        codes.dedup();
        Ok(codes)
    }
}

/// Resolves the session a fetch targets. An explicit date must be a trading day no later than the
/// latest closed session.
pub fn resolve_as_of(
    calendar: &MarketCalendar,
    as_of_date: Option<NaiveDate>,
    now: DateTime<Utc>,
) -> Result<NaiveDate, InvalidRequest> {
    let market = calendar.market;
    let latest = calendar
        .latest_session(now)
        .ok_or(InvalidRequest::NoSession { market })?;

    match as_of_date {
        None => Ok(latest),
        Some(date) if date > latest => Err(InvalidRequest::FutureDate { market, date }),
        Some(date) if !calendar.is_trading_day(date) => {
            Err(InvalidRequest::NotTradingDay { market, date })
        }
        Some(date) => Ok(date),
    }
}

pub fn check_history_days(days: u32) -> Result<(), InvalidRequest> {
    match days {
        0 => Err(InvalidRequest::ZeroDays),
        d if d > MAX_HISTORY_DAYS => Err(InvalidRequest::TooManyDays {
            days: d,
            max: MAX_HISTORY_DAYS,
        }),
        _ => Ok(()),
    }
}

/// Collects per-sector failures for one batch, logging at most `MAX_LOGGED_FAILURES` of them.
pub(crate) struct FailureLog {
    market: Market,
    what: &'static str,
    failures: Vec<SectorFailure>,
}

impl FailureLog {
    pub(crate) fn new(market: Market, what: &'static str) -> Self {
        Self {
            market,
            what,
            failures: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, sector_code: &str, reason: impl ToString) {
        let reason = reason.to_string();
        if self.failures.len() < MAX_LOGGED_FAILURES {
            tracing::warn!(
                market = %self.market,
                sector_code,
                failure_count = self.failures.len() + 1,
                error = %reason,
                "{} failed for sector; skipping",
                self.what
            );
        }
        self.failures.push(SectorFailure {
            sector_code: sector_code.to_string(),
            reason,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.failures.len()
    }

    pub(crate) fn finish(self) -> Vec<SectorFailure> {
        if self.failures.len() > MAX_LOGGED_FAILURES {
            tracing::warn!(
                market = %self.market,
                failures = self.failures.len(),
                suppressed = self.failures.len() - MAX_LOGGED_FAILURES,
                "{} had more sector failures than logged",
                self.what
            );
        }
        self.failures
    }
}

/// Maps a market to its concrete provider, wired from settings.
pub fn build_provider(market: Market, settings: &Settings) -> Result<Arc<dyn MarketDataProvider>> {
    let calendar = settings.calendar(market);
    let estimator = settings
        .market(market)
        .map(|m| m.estimator)
        .unwrap_or_default();
    let p = &settings.provider;

    let provider: Arc<dyn MarketDataProvider> = match market {
        Market::AShare => {
            let source = EastMoneyClient::new(
                &p.eastmoney_base_url,
                &p.eastmoney_history_base_url,
                p.timeout,
            )?;
            Arc::new(AShareProvider::new(Arc::new(source), calendar, p.retry))
        }
        Market::Us => {
            let source = YahooChartClient::new(&p.yahoo_base_url, p.timeout)?;
            Arc::new(UsSectorProvider::new(
                Arc::new(source),
                calendar,
                estimator,
                p.retry,
                p.req_delay,
            ))
        }
        Market::Hk => {
            let source = YahooChartClient::new(&p.yahoo_base_url, p.timeout)?;
            Arc::new(HkSectorProvider::new(
                Arc::new(source),
                calendar,
                estimator,
                p.retry,
                p.req_delay,
            ))
        }
    };

    tracing::debug!(market = %market, provider = provider.provider_name(), "provider ready");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn resolves_default_and_explicit_dates() {
        let cal = MarketCalendar::default_for(Market::AShare);
        // Wednesday 2026-03-04 12:00 Shanghai, before close: latest session is Tuesday.
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 4, 0, 0).unwrap();

        assert_eq!(resolve_as_of(&cal, None, now).unwrap(), d(2026, 3, 3));
        assert_eq!(resolve_as_of(&cal, Some(d(2026, 3, 2)), now).unwrap(), d(2026, 3, 2));
        assert_eq!(
            resolve_as_of(&cal, Some(d(2026, 3, 4)), now).unwrap_err(),
            InvalidRequest::FutureDate {
                market: Market::AShare,
                date: d(2026, 3, 4)
            }
        );
        assert!(matches!(
            resolve_as_of(&cal, Some(d(2026, 2, 28)), now),
            Err(InvalidRequest::NotTradingDay { .. })
        ));
    }

    #[test]
    fn failure_log_keeps_every_failure() {
        let mut log = FailureLog::new(Market::Us, "quote fetch");
        for i in 0..15 {
            log.record(&format!("S{i}"), "timeout");
        }
        assert_eq!(log.len(), 15);
        let failures = log.finish();
        assert_eq!(failures.len(), 15);
        assert_eq!(failures[14].sector_code, "S14");
    }

    #[test]
    fn registry_builds_every_market() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        for market in Market::ALL {
            let p = build_provider(market, &settings).unwrap();
            assert_eq!(p.market(), market);
        }
    }
}
