//! Sector flow for markets without native fund-flow data, estimated from one ETF per sector.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Market, SectorSnapshot, SnapshotSet};
use crate::ingest::error::{FetchError, InvalidRequest};
use crate::ingest::estimate::{change_pct, EstimationStrategy};
use crate::ingest::provider::{check_history_days, resolve_as_of, FailureLog, FetchOutcome};
use crate::ingest::types::DailyBar;
use crate::ingest::yahoo::QuoteSource;
use crate::retry::RetryPolicy;
use crate::time::MarketCalendar;

// Calendar days fetched before the target session, enough to find a previous close across a
// long holiday closure.
const PREV_CLOSE_LOOKBACK_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorEtf {
    pub ticker: &'static str,
    pub sector_name: &'static str,
}

/// A fixed list of sector ETFs plus the machinery to turn their bars into snapshots.
pub struct EtfBasket {
    market: Market,
    etfs: &'static [SectorEtf],
    source: Arc<dyn QuoteSource>,
    calendar: MarketCalendar,
    estimator: EstimationStrategy,
    retry: RetryPolicy,
    req_delay: Duration,
}

impl EtfBasket {
    pub fn new(
        market: Market,
        etfs: &'static [SectorEtf],
        source: Arc<dyn QuoteSource>,
        calendar: MarketCalendar,
        estimator: EstimationStrategy,
        retry: RetryPolicy,
        req_delay: Duration,
    ) -> Self {
        Self {
            market,
            etfs,
            source,
            calendar,
            estimator,
            retry,
            req_delay,
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.source_name()
    }

    pub fn etfs(&self) -> &'static [SectorEtf] {
        self.etfs
    }

    fn lookup(&self, sector_code: &str) -> Result<&'static SectorEtf, InvalidRequest> {
        self.etfs
            .iter()
            .find(|e| e.ticker == sector_code)
            .ok_or_else(|| InvalidRequest::UnknownSector {
                market: self.market,
                sector_code: sector_code.to_string(),
            })
    }

    async fn bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        self.retry
            .run(ticker, || self.source.daily_bars(ticker, start, end))
            .await
    }

    fn snapshot(
        &self,
        etf: &SectorEtf,
        date: NaiveDate,
        prev_close: f64,
        bar: &DailyBar,
    ) -> SectorSnapshot {
        SectorSnapshot {
            market: self.market,
            as_of_date: date,
            sector_code: etf.ticker.to_string(),
            sector_name: etf.sector_name.to_string(),
            change_pct: change_pct(prev_close, bar.close),
            main_inflow: self.estimator.estimate(prev_close, bar.close, bar.volume),
            volume: bar.volume,
            currency: self.market.currency(),
        }
    }

    pub async fn fetch_current(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        let date = resolve_as_of(&self.calendar, as_of_date, Utc::now())?;
        let start = date - ChronoDuration::days(PREV_CLOSE_LOOKBACK_DAYS);

        let mut set = SnapshotSet::new(self.market, date);
        let mut failures = FailureLog::new(self.market, "sector ETF fetch");

        for (i, etf) in self.etfs.iter().enumerate() {
            if i > 0 && !self.req_delay.is_zero() {
                tokio::time::sleep(self.req_delay).await;
            }

            let bars = match self.bars(etf.ticker, start, date).await {
                Ok(b) => b,
                Err(err) => {
                    failures.record(etf.ticker, err);
                    continue;
                }
            };

            let Some(pos) = bars.iter().position(|b| b.date == date) else {
                failures.record(etf.ticker, format!("no bar for {date}"));
                continue;
            };
            let bar = &bars[pos];
            // Without an earlier bar the session's open stands in for the previous close.
            let prev_close = if pos > 0 { bars[pos - 1].close } else { bar.open };

            if let Err(err) = set.insert(self.snapshot(etf, date, prev_close, bar)) {
                failures.record(etf.ticker, err);
            }
        }

        let failures = failures.finish();
        let degraded = (set.is_empty() && !self.etfs.is_empty())
            .then(|| format!("all {} sector ETFs failed", self.etfs.len()));

        tracing::info!(
            market = %self.market,
            as_of_date = %date,
            sectors = set.len(),
            failures = failures.len(),
            estimator = %self.estimator,
            "fetched sector ETF snapshots"
        );

        Ok(FetchOutcome {
            snapshots: set,
            failures,
            degraded,
        })
    }

    pub async fn fetch_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        let etf = self.lookup(sector_code)?;
        check_history_days(days)?;

        let end = resolve_as_of(&self.calendar, None, Utc::now())?;
        self.history_ending(etf, days, end).await
    }

    async fn history_ending(
        &self,
        etf: &SectorEtf,
        days: u32,
        end: NaiveDate,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        // Roughly 5 sessions per 7 days, with slack for holidays and one extra bar for the
        // first previous close.
        let span = i64::from(days) * 7 / 5 + PREV_CLOSE_LOOKBACK_DAYS;
        let start = end - ChronoDuration::days(span);

        let bars = self.bars(etf.ticker, start, end).await?;
        let mut out: Vec<SectorSnapshot> = bars
            .windows(2)
            .map(|w| self.snapshot(etf, w[1].date, w[0].close, &w[1]))
            .collect();
        if out.is_empty() {
            if let Some(only) = bars.first() {
                out.push(self.snapshot(etf, only.date, only.open, only));
            }
        }

        let keep = days as usize;
        if out.len() > keep {
            out.drain(..out.len() - keep);
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeQuotes;
    use super::*;
    use std::sync::atomic::Ordering;

    const BASKET: &[SectorEtf] = &[
        SectorEtf {
            ticker: "AAA",
            sector_name: "Alpha",
        },
        SectorEtf {
            ticker: "BBB",
            sector_name: "Beta",
        },
        SectorEtf {
            ticker: "CCC",
            sector_name: "Gamma",
        },
    ];

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn basket(source: FakeQuotes) -> (EtfBasket, Arc<FakeQuotes>) {
        let source = Arc::new(source);
        let b = EtfBasket::new(
            Market::Us,
            BASKET,
            source.clone(),
            MarketCalendar::default_for(Market::Us),
            EstimationStrategy::PriceDeltaVolume,
            RetryPolicy::no_delay(2),
            Duration::ZERO,
        );
        (b, source)
    }

    #[tokio::test]
    async fn isolates_failing_sector_and_counts_it() {
        let (b, source) = basket(
            FakeQuotes::default()
                .with_bars("AAA", &[(d(2026, 3, 2), 10.0, 10.0, 100), (d(2026, 3, 3), 10.0, 11.0, 100)])
                .with_bars("BBB", &[(d(2026, 3, 2), 20.0, 20.0, 50), (d(2026, 3, 3), 20.0, 19.0, 50)])
                .failing("CCC"),
        );

        let out = b.fetch_current(Some(d(2026, 3, 3))).await.unwrap();
        assert_eq!(out.snapshots.len(), 2);
        assert_eq!(out.failure_count(), 1);
        assert_eq!(out.failures[0].sector_code, "CCC");
        assert!(!out.is_degraded());

        let a = out.snapshots.get("AAA").unwrap();
        assert!((a.main_inflow - 100.0).abs() < 1e-9);
        assert!((a.change_pct - 10.0).abs() < 1e-9);
        assert_eq!(a.currency, Market::Us.currency());
        let bb = out.snapshots.get("BBB").unwrap();
        assert!((bb.main_inflow + 50.0).abs() < 1e-9);

        // Two successes plus two attempts for the failing ticker.
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn single_bar_uses_open_as_previous_close() {
        let (b, _) = basket(
            FakeQuotes::default().with_bars("AAA", &[(d(2026, 3, 3), 10.0, 12.0, 10)]),
        );
        let out = b.fetch_current(Some(d(2026, 3, 3))).await.unwrap();
        let a = out.snapshots.get("AAA").unwrap();
        assert!((a.main_inflow - 20.0).abs() < 1e-9);
        // BBB and CCC have no bar for the date.
        assert_eq!(out.failure_count(), 2);
    }

    #[tokio::test]
    async fn all_failures_mark_the_batch_degraded() {
        let (b, _) = basket(
            FakeQuotes::default()
                .failing("AAA")
                .failing("BBB")
                .failing("CCC"),
        );
        let out = b.fetch_current(Some(d(2026, 3, 3))).await.unwrap();
        assert!(out.snapshots.is_empty());
        assert!(out.is_degraded());
        assert_eq!(out.failure_count(), 3);
    }

    #[tokio::test]
    async fn future_date_is_rejected() {
        let (b, _) = basket(FakeQuotes::default());
        let err = b.fetch_current(Some(d(2099, 3, 3))).await.unwrap_err();
        assert!(matches!(err, InvalidRequest::FutureDate { .. }));
    }

    #[tokio::test]
    async fn history_pairs_consecutive_bars() {
        let (b, _) = basket(FakeQuotes::default().with_bars(
            "AAA",
            &[
                (d(2026, 3, 2), 10.0, 10.0, 100),
                (d(2026, 3, 3), 10.0, 11.0, 100),
                (d(2026, 3, 4), 11.0, 10.5, 200),
            ],
        ));

        let hist = b.history_ending(&BASKET[0], 5, d(2026, 3, 4)).await.unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[0].as_of_date, d(2026, 3, 3));
        assert!((hist[0].main_inflow - 100.0).abs() < 1e-9);
        assert!((hist[1].main_inflow + 100.0).abs() < 1e-9);

        let last_one = b.history_ending(&BASKET[0], 1, d(2026, 3, 4)).await.unwrap();
        assert_eq!(last_one.len(), 1);
        assert_eq!(last_one[0].as_of_date, d(2026, 3, 4));
    }

    #[tokio::test]
    async fn history_rejects_bad_requests() {
        let (b, _) = basket(FakeQuotes::default());
        let err = b.fetch_history("ZZZ", 5).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Invalid(InvalidRequest::UnknownSector { .. })
        ));
        let err = b.fetch_history("AAA", 0).await.unwrap_err();
        assert!(matches!(err, FetchError::Invalid(InvalidRequest::ZeroDays)));
        let err = b.fetch_history("AAA", u32::MAX).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Invalid(InvalidRequest::TooManyDays { .. })
        ));
    }
}
