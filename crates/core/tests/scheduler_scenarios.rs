use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use sectorflow_core::analysis::{calculate_trend_strength, AnalysisError};
use sectorflow_core::dispatch::{Channel, Dispatcher};
use sectorflow_core::domain::{AnalysisResult, Currency, Market, SectorSnapshot, SnapshotSet};
use sectorflow_core::ingest::etf::{EtfBasket, SectorEtf};
use sectorflow_core::ingest::types::DailyBar;
use sectorflow_core::ingest::yahoo::QuoteSource;
use sectorflow_core::ingest::{
    EstimationStrategy, FetchError, FetchOutcome, InvalidRequest, MarketDataProvider,
};
use sectorflow_core::retry::RetryPolicy;
use sectorflow_core::scheduler::{
    AnalysisOptions, JobState, Pipeline, RunStatus, Scheduler, TriggerError,
};
use sectorflow_core::storage::{FileSnapshotStore, SnapshotStore, StoreError};
use sectorflow_core::time::MarketCalendar;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn record(market: Market, date: NaiveDate, code: &str, inflow: f64) -> SectorSnapshot {
    SectorSnapshot {
        market,
        as_of_date: date,
        sector_code: code.to_string(),
        sector_name: format!("Sector {code}"),
        change_pct: inflow / 100.0,
        main_inflow: inflow,
        volume: 1_000,
        currency: market.currency(),
    }
}

#[derive(Default)]
struct Recorder {
    results: Mutex<Vec<AnalysisResult>>,
}

#[async_trait::async_trait]
impl Channel for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn deliver(&self, result: &AnalysisResult) -> anyhow::Result<()> {
        self.results
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .push(result.clone());
        Ok(())
    }
}

/// Holds every fetch until released.
struct GatedProvider {
    gate: Arc<Notify>,
    set: SnapshotSet,
}

#[async_trait::async_trait]
impl MarketDataProvider for GatedProvider {
    fn market(&self) -> Market {
        self.set.market()
    }

    fn provider_name(&self) -> &'static str {
        "gated"
    }

    async fn fetch_current(
        &self,
        _as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        self.gate.notified().await;
        Ok(FetchOutcome {
            snapshots: self.set.clone(),
            failures: Vec::new(),
            degraded: None,
        })
    }

    async fn fetch_history(
        &self,
        _sector_code: &str,
        _days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        Ok(Vec::new())
    }
}

fn scheduler_with(
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn SnapshotStore>,
    recorder: Arc<Recorder>,
) -> Scheduler {
    let market = provider.market();
    let channels: Vec<Arc<dyn Channel>> = vec![recorder];
    Scheduler::new([Pipeline::new(
        provider,
        store,
        Arc::new(Dispatcher::new(channels)),
        MarketCalendar::default_for(market),
        AnalysisOptions::default(),
    )])
}

#[tokio::test]
async fn second_trigger_during_a_run_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let date = d(2026, 3, 3);
    let set = SnapshotSet::try_from_records(
        Market::Hk,
        date,
        [record(Market::Hk, date, "3033.HK", 10.0)],
    )
    .unwrap();

    let gate = Arc::new(Notify::new());
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler_with(
        Arc::new(GatedProvider {
            gate: gate.clone(),
            set,
        }),
        Arc::new(FileSnapshotStore::new(dir.path())),
        recorder.clone(),
    );

    let first = scheduler.trigger(Market::Hk, None).unwrap();
    let second = scheduler.trigger(Market::Hk, None);
    assert!(matches!(second, Err(TriggerError::Conflict(_))));
    assert_eq!(
        scheduler.jobs().get(Market::Hk).unwrap().state,
        JobState::Running
    );

    gate.notify_one();
    let report = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    assert_eq!(recorder.results.lock().unwrap().len(), 1);
    let job = scheduler.jobs().get(Market::Hk).unwrap();
    assert_eq!(job.state, JobState::Idle);
    assert_eq!(job.runs_started, 1);
    assert_eq!(job.runs_rejected, 1);
    assert_eq!(job.last_run_id, Some(report.run_id));

    assert!(matches!(
        scheduler.trigger(Market::Us, None),
        Err(TriggerError::NotScheduled(Market::Us))
    ));
}

const TEN_SECTORS: &[SectorEtf] = &[
    SectorEtf { ticker: "S0", sector_name: "Zero" },
    SectorEtf { ticker: "S1", sector_name: "One" },
    SectorEtf { ticker: "S2", sector_name: "Two" },
    SectorEtf { ticker: "S3", sector_name: "Three" },
    SectorEtf { ticker: "S4", sector_name: "Four" },
    SectorEtf { ticker: "S5", sector_name: "Five" },
    SectorEtf { ticker: "S6", sector_name: "Six" },
    SectorEtf { ticker: "S7", sector_name: "Seven" },
    SectorEtf { ticker: "S8", sector_name: "Eight" },
    SectorEtf { ticker: "S9", sector_name: "Nine" },
];

/// Two fixed bars per ticker; tickers in `unreachable` always time out.
struct FlakyQuotes {
    unreachable: HashSet<&'static str>,
}

#[async_trait::async_trait]
impl QuoteSource for FlakyQuotes {
    fn source_name(&self) -> &'static str {
        "flaky"
    }

    async fn daily_bars(
        &self,
        symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        if self.unreachable.contains(symbol) {
            return Err(FetchError::Transient("operation timed out".to_string()));
        }
        let n: f64 = symbol.trim_start_matches('S').parse().unwrap_or(0.0);
        Ok(vec![
            DailyBar {
                date: d(2026, 3, 2),
                open: 100.0,
                close: 100.0,
                volume: 1_000,
            },
            DailyBar {
                date: d(2026, 3, 3),
                open: 100.0,
                close: 100.0 + n,
                volume: 1_000,
            },
        ])
    }
}

struct BasketProvider(EtfBasket);

#[async_trait::async_trait]
impl MarketDataProvider for BasketProvider {
    fn market(&self) -> Market {
        Market::Us
    }

    fn provider_name(&self) -> &'static str {
        "basket"
    }

    async fn fetch_current(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        self.0.fetch_current(as_of_date).await
    }

    async fn fetch_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        self.0.fetch_history(sector_code, days).await
    }
}

#[tokio::test]
async fn partial_provider_failure_still_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let basket = EtfBasket::new(
        Market::Us,
        TEN_SECTORS,
        Arc::new(FlakyQuotes {
            unreachable: ["S4", "S9"].into_iter().collect(),
        }),
        MarketCalendar::default_for(Market::Us),
        EstimationStrategy::PriceDeltaVolume,
        RetryPolicy::no_delay(3),
        Duration::ZERO,
    );
    let recorder = Arc::new(Recorder::default());
    let scheduler = scheduler_with(
        Arc::new(BasketProvider(basket)),
        Arc::new(FileSnapshotStore::new(dir.path())),
        recorder.clone(),
    );

    let report = scheduler
        .trigger(Market::Us, Some(d(2026, 3, 3)))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.sectors_fetched, 8);
    assert_eq!(report.degraded_sectors, 2);
    assert!(report.provider_degraded.is_none());

    let results = recorder.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.meta.degraded_sectors, 2);
    assert_eq!(result.meta.currency, Currency::Usd);
    let ranked: Vec<_> = result
        .ranking
        .entries
        .iter()
        .map(|e| e.sector_code.as_str())
        .collect();
    assert_eq!(ranked, vec!["S8", "S7", "S6", "S5", "S3", "S2", "S1", "S0"]);
    // First run for this market: nothing to compare against.
    assert!(result.rotation.is_none());
}

#[tokio::test]
async fn saved_day_loads_back_equal() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path());
    let date = d(2026, 3, 3);
    let set = SnapshotSet::try_from_records(
        Market::AShare,
        date,
        [
            record(Market::AShare, date, "BK0477", 8.1e8),
            record(Market::AShare, date, "BK1036", -3.2e8),
        ],
    )
    .unwrap();

    store.save(Market::AShare, date, &set).await.unwrap();
    let loaded = store.load(Market::AShare, date).await.unwrap().unwrap();
    assert_eq!(loaded, set);
    assert_eq!(loaded.get("BK1036").unwrap().currency, Currency::Cny);
}

#[test]
fn three_days_cannot_score_a_five_day_trend() {
    let history: Vec<_> = (2..=4)
        .map(|day| record(Market::Us, d(2026, 3, day), "XLK", 10.0))
        .collect();

    let err = calculate_trend_strength(&history, "XLK", 5).unwrap_err();
    assert_eq!(
        err,
        AnalysisError::InsufficientHistory {
            sector_code: "XLK".to_string(),
            required: 5,
            available: 3,
        }
    );
}

#[derive(Default)]
struct MemoryStore {
    days: Mutex<BTreeMap<(Market, NaiveDate), SnapshotSet>>,
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn save(&self, market: Market, date: NaiveDate, set: &SnapshotSet) -> Result<(), StoreError> {
        self.days.lock().unwrap().insert((market, date), set.clone());
        Ok(())
    }

    async fn load(&self, market: Market, date: NaiveDate) -> Result<Option<SnapshotSet>, StoreError> {
        Ok(self.days.lock().unwrap().get(&(market, date)).cloned())
    }

    async fn list_dates(
        &self,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        Ok(self
            .days
            .lock()
            .unwrap()
            .keys()
            .filter(|(m, d)| *m == market && *d >= start && *d <= end)
            .map(|(_, d)| *d)
            .collect())
    }
}

/// Answers immediately with the same set.
struct FixedProvider(SnapshotSet);

#[async_trait::async_trait]
impl MarketDataProvider for FixedProvider {
    fn market(&self) -> Market {
        self.0.market()
    }

    fn provider_name(&self) -> &'static str {
        "fixed"
    }

    async fn fetch_current(
        &self,
        _as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        Ok(FetchOutcome {
            snapshots: self.0.clone(),
            failures: Vec::new(),
            degraded: None,
        })
    }

    async fn fetch_history(
        &self,
        _sector_code: &str,
        _days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn timer_fires_once_per_slot_and_stops_on_shutdown() {
    let date = d(2026, 3, 3);
    let set = SnapshotSet::try_from_records(
        Market::Hk,
        date,
        [
            record(Market::Hk, date, "3033.HK", 10.0),
            record(Market::Hk, date, "2828.HK", -4.0),
        ],
    )
    .unwrap();

    // Every day trades, so the next slot is at most a day away and the one after is a day later.
    let mut calendar = MarketCalendar::default_for(Market::Hk);
    calendar.trading_weekdays = "*".parse().unwrap();
    calendar.holidays.clear();
    let first_slot = calendar.next_trigger_after(Utc::now()).unwrap();
    let until_first = (first_slot - Utc::now()).to_std().unwrap_or(Duration::ZERO);

    let recorder = Arc::new(Recorder::default());
    let channels: Vec<Arc<dyn Channel>> = vec![recorder.clone()];
    let scheduler = Arc::new(Scheduler::new([Pipeline::new(
        Arc::new(FixedProvider(set)),
        Arc::new(MemoryStore::default()),
        Arc::new(Dispatcher::new(channels)),
        calendar,
        AnalysisOptions::default(),
    )]));

    // Shut down an hour after the first slot, well before the second.
    let shutdown = tokio::time::sleep(until_first + Duration::from_secs(3_600));
    tokio::time::timeout(
        Duration::from_secs(3 * 24 * 3_600),
        scheduler.clone().run_until(shutdown),
    )
    .await
    .expect("scheduler did not stop after shutdown");

    let job = scheduler.jobs().get(Market::Hk).unwrap();
    assert_eq!(job.runs_started, 1);
    assert_eq!(job.runs_rejected, 0);
    assert_eq!(job.state, JobState::Idle);
    let results = recorder.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].ranking.entries[0].sector_code, "3033.HK");
}
