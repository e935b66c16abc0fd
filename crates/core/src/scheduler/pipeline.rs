use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::analysis::{calculate_trend_strength, detect_rotation, rank_by_inflow, rotation_signals};
use crate::config::Settings;
use crate::dispatch::{ChannelOutcome, Dispatcher};
use crate::domain::{
    AnalysisResult, Market, RankingResult, RotationEvent, RotationSignal, RunMetadata,
    SnapshotSet, TrendGap, TrendScore,
};
use crate::ingest::{FetchOutcome, MarketDataProvider};
use crate::scheduler::jobs::RunStatus;
use crate::storage::{sector_history, SnapshotStore};
use crate::time::MarketCalendar;

const SAVE_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub top_n: usize,
    pub trend_window_days: usize,
    /// Calendar days of stored history loaded for trend scoring.
    pub trend_lookback_days: u32,
    /// Trading days probed when looking for the previous snapshot.
    pub snapshot_lookback_limit: u32,
}

impl AnalysisOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            top_n: settings.top_n,
            trend_window_days: settings.trend_window_days,
            trend_lookback_days: settings.trend_lookback_days,
            snapshot_lookback_limit: settings.snapshot_lookback_limit,
        }
    }
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            top_n: 10,
            trend_window_days: 5,
            trend_lookback_days: 30,
            snapshot_lookback_limit: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub market: Market,
    pub as_of_date: Option<NaiveDate>,
    pub status: RunStatus,
    pub sectors_fetched: usize,
    pub degraded_sectors: usize,
    pub provider_degraded: Option<String>,
    pub store_error: Option<String>,
    pub trend_gaps: usize,
    pub channels: Vec<ChannelOutcome>,
    pub elapsed_ms: u128,
    /// Why the run could not reach dispatch.
    pub error: Option<String>,
    pub result: Option<AnalysisResult>,
}

impl RunReport {
    fn new(run_id: Uuid, market: Market) -> Self {
        Self {
            run_id,
            market,
            as_of_date: None,
            status: RunStatus::Failed,
            sectors_fetched: 0,
            degraded_sectors: 0,
            provider_degraded: None,
            store_error: None,
            trend_gaps: 0,
            channels: Vec::new(),
            elapsed_ms: 0,
            error: None,
            result: None,
        }
    }

    pub fn dispatched(&self) -> bool {
        !self.channels.is_empty()
    }
}

/// fetch → store → analyze → dispatch for one market. Steps run strictly in order; only a run
/// with no data at all stops before dispatch.
pub struct Pipeline {
    provider: Arc<dyn MarketDataProvider>,
    store: Arc<dyn SnapshotStore>,
    dispatcher: Arc<Dispatcher>,
    calendar: MarketCalendar,
    options: AnalysisOptions,
}

impl Pipeline {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        store: Arc<dyn SnapshotStore>,
        dispatcher: Arc<Dispatcher>,
        calendar: MarketCalendar,
        options: AnalysisOptions,
    ) -> Self {
        Self {
            provider,
            store,
            dispatcher,
            calendar,
            options,
        }
    }

    pub fn market(&self) -> Market {
        self.provider.market()
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    pub async fn run(&self, run_id: Uuid, as_of_date: Option<NaiveDate>) -> RunReport {
        let started = Instant::now();
        let market = self.market();
        let mut report = RunReport::new(run_id, market);

        tracing::info!(%market, %run_id, as_of_date = ?as_of_date, provider = self.provider.provider_name(), "run started");

        let outcome: FetchOutcome = match self.provider.fetch_current(as_of_date).await {
            Ok(o) => o,
            Err(err) => {
                report.error = Some(err.to_string());
                report.elapsed_ms = started.elapsed().as_millis();
                tracing::error!(%market, %run_id, error = %err, "run rejected by provider");
                return report;
            }
        };

        let today = outcome.snapshots;
        let date = today.as_of_date();
        report.as_of_date = Some(date);
        report.sectors_fetched = today.len();
        report.degraded_sectors = outcome.failures.len();
        report.provider_degraded = outcome.degraded;

        if today.is_empty() {
            report.error = Some(format!(
                "no sector data for {date}: {}",
                report.provider_degraded.as_deref().unwrap_or("empty batch")
            ));
            report.elapsed_ms = started.elapsed().as_millis();
            tracing::error!(%market, %run_id, as_of_date = %date, error = ?report.error, "run failed before dispatch");
            return report;
        }

        report.store_error = self.save_with_retry(&today, run_id).await;

        let ranking = rank_by_inflow(&today, self.options.top_n);
        let previous = self.previous_snapshot(date).await;
        let (rotation, signals) = match &previous {
            Some(prev) => self.rotation(&ranking, prev),
            None => {
                tracing::info!(%market, as_of_date = %date, "no previous snapshot; rotation skipped");
                (None, Vec::new())
            }
        };
        let (trends, gaps) = self.trends(&today, &ranking).await;
        report.trend_gaps = gaps.len();

        let result = AnalysisResult {
            market,
            as_of_date: date,
            ranking,
            rotation,
            rotation_signals: signals,
            trends,
            trend_gaps: gaps,
            meta: RunMetadata {
                run_id,
                provider: self.provider.provider_name().to_string(),
                currency: market.currency(),
                generated_at: Utc::now(),
                sectors_fetched: report.sectors_fetched,
                degraded_sectors: report.degraded_sectors,
                provider_degraded: report.provider_degraded.is_some(),
                previous_date: previous.as_ref().map(SnapshotSet::as_of_date),
                store_error: report.store_error.clone(),
            },
        };

        report.channels = self.dispatcher.dispatch(&result).await;
        report.result = Some(result);
        report.status = if report.store_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        report.elapsed_ms = started.elapsed().as_millis();

        let delivered = report.channels.iter().filter(|c| c.delivered).count();
        match report.status {
            RunStatus::Succeeded => tracing::info!(
                %market,
                %run_id,
                as_of_date = %date,
                sectors = report.sectors_fetched,
                degraded_sectors = report.degraded_sectors,
                trend_gaps = report.trend_gaps,
                channels_delivered = delivered,
                channels = report.channels.len(),
                elapsed_ms = report.elapsed_ms,
                "run finished"
            ),
            RunStatus::Failed => tracing::error!(
                %market,
                %run_id,
                as_of_date = %date,
                store_error = ?report.store_error,
                channels_delivered = delivered,
                "run finished with failed snapshot save"
            ),
        }
        report
    }

    /// Saves today's set, retrying once. Returns the last error if both attempts fail.
    async fn save_with_retry(&self, today: &SnapshotSet, run_id: Uuid) -> Option<String> {
        let market = today.market();
        let date = today.as_of_date();
        let mut last_err = None;
        for attempt in 1..=SAVE_ATTEMPTS {
            match self.store.save(market, date, today).await {
                Ok(()) => return None,
                Err(err) => {
                    tracing::warn!(%market, %run_id, as_of_date = %date, attempt, error = %err, "snapshot save failed");
                    last_err = Some(err.to_string());
                }
            }
        }
        last_err
    }

    async fn previous_snapshot(&self, date: NaiveDate) -> Option<SnapshotSet> {
        match self
            .store
            .previous_trading_day(&self.calendar, date, self.options.snapshot_lookback_limit)
            .await
        {
            Ok(prev) => prev,
            Err(err) => {
                tracing::warn!(market = %self.market(), as_of_date = %date, error = %err, "previous snapshot lookup failed");
                None
            }
        }
    }

    fn rotation(
        &self,
        ranking: &RankingResult,
        previous: &SnapshotSet,
    ) -> (Option<RotationEvent>, Vec<RotationSignal>) {
        let yesterday = rank_by_inflow(previous, ranking.top_n);
        match detect_rotation(ranking, &yesterday) {
            Ok(event) => {
                let full = rank_by_inflow(previous, previous.len());
                let signals = rotation_signals(&event, &full);
                (Some(event), signals)
            }
            Err(err) => {
                tracing::warn!(market = %self.market(), error = %err, "rotation skipped");
                (None, Vec::new())
            }
        }
    }

    /// Scores every ranked sector. Today's set is used as fetched, even if it failed to persist.
    async fn trends(
        &self,
        today: &SnapshotSet,
        ranking: &RankingResult,
    ) -> (Vec<TrendScore>, Vec<TrendGap>) {
        let market = today.market();
        let date = today.as_of_date();
        let start = date - ChronoDuration::days(i64::from(self.options.trend_lookback_days));

        let mut sets = match self
            .store
            .load_range(market, start, date - ChronoDuration::days(1))
            .await
        {
            Ok(sets) => sets,
            Err(err) => {
                tracing::warn!(%market, as_of_date = %date, error = %err, "history load failed; trends use today only");
                Vec::new()
            }
        };
        sets.push(today.clone());

        let mut trends = Vec::new();
        let mut gaps = Vec::new();
        for entry in &ranking.entries {
            let history = sector_history(&sets, &entry.sector_code);
            match calculate_trend_strength(&history, &entry.sector_code, self.options.trend_window_days) {
                Ok(score) => trends.push(score),
                Err(err) => gaps.push(TrendGap {
                    sector_code: entry.sector_code.clone(),
                    reason: err.to_string(),
                }),
            }
        }
        (trends, gaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::RecordingChannel;
    use crate::dispatch::Channel;
    use crate::domain::snapshot::fixtures;
    use crate::domain::SectorSnapshot;
    use crate::ingest::{FetchError, InvalidRequest, SectorFailure};
    use crate::storage::{FileSnapshotStore, StoreError};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    struct StaticProvider {
        set: SnapshotSet,
        failures: usize,
    }

    #[async_trait::async_trait]
    impl MarketDataProvider for StaticProvider {
        fn market(&self) -> Market {
            self.set.market()
        }

        fn provider_name(&self) -> &'static str {
            "static"
        }

        async fn fetch_current(
            &self,
            _as_of_date: Option<NaiveDate>,
        ) -> Result<FetchOutcome, InvalidRequest> {
            Ok(FetchOutcome {
                snapshots: self.set.clone(),
                failures: (0..self.failures)
                    .map(|i| SectorFailure {
                        sector_code: format!("F{i}"),
                        reason: "timeout".to_string(),
                    })
                    .collect(),
                degraded: self
                    .set
                    .is_empty()
                    .then(|| "upstream unreachable".to_string()),
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

    /// Every save fails.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl SnapshotStore for BrokenStore {
        fn backend_name(&self) -> &'static str {
            "broken"
        }

        async fn save(&self, _: Market, _: NaiveDate, _: &SnapshotSet) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        async fn load(&self, _: Market, _: NaiveDate) -> Result<Option<SnapshotSet>, StoreError> {
            Ok(None)
        }

        async fn list_dates(
            &self,
            _: Market,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<NaiveDate>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn pipeline(
        set: SnapshotSet,
        failures: usize,
        store: Arc<dyn SnapshotStore>,
        channel: Arc<RecordingChannel>,
    ) -> Pipeline {
        let market = set.market();
        let channels: Vec<Arc<dyn Channel>> = vec![channel];
        Pipeline::new(
            Arc::new(StaticProvider { set, failures }),
            store,
            Arc::new(Dispatcher::new(channels)),
            MarketCalendar::default_for(market),
            AnalysisOptions {
                top_n: 2,
                trend_window_days: 3,
                ..AnalysisOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn full_run_ranks_rotates_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(dir.path()));

        // Mon, Tue stored; Wed is the run. C enters the top 2, B leaves.
        for (day, rows) in [
            (2, [("A", 5.0, 1.0), ("B", 4.0, 1.0), ("C", 1.0, 0.0)]),
            (3, [("A", 6.0, 1.0), ("B", 5.0, 1.0), ("C", 2.0, 0.0)]),
        ] {
            let date = d(2026, 3, day);
            store
                .save(Market::Us, date, &fixtures::set(Market::Us, date, &rows))
                .await
                .unwrap();
        }
        let today = fixtures::set(Market::Us, d(2026, 3, 4), &[("A", 7.0, 1.0), ("B", 1.0, 0.0), ("C", 9.0, 2.0)]);

        let channel = Arc::new(RecordingChannel::default());
        let report = pipeline(today, 0, store.clone(), channel.clone())
            .run(Uuid::new_v4(), None)
            .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.dispatched());
        let result = report.result.as_ref().unwrap();
        let codes: Vec<_> = result.ranking.entries.iter().map(|e| e.sector_code.as_str()).collect();
        assert_eq!(codes, vec!["C", "A"]);

        let rotation = result.rotation.as_ref().unwrap();
        assert!(rotation.entered.contains("C"));
        assert!(rotation.exited.contains("B"));
        assert_eq!(result.rotation_signals[0].previous_rank, Some(3));
        assert_eq!(result.meta.previous_date, Some(d(2026, 3, 3)));

        // Three stored/fetched days each: both ranked sectors get a score.
        assert_eq!(result.trends.len(), 2);
        assert!(result.trend_gaps.is_empty());

        assert!(store.load(Market::Us, d(2026, 3, 4)).await.unwrap().is_some());
        assert_eq!(channel.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_fails_without_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let channel = Arc::new(RecordingChannel::default());
        let report = pipeline(
            SnapshotSet::new(Market::Hk, d(2026, 3, 4)),
            5,
            Arc::new(FileSnapshotStore::new(dir.path())),
            channel.clone(),
        )
        .run(Uuid::new_v4(), None)
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(!report.dispatched());
        assert_eq!(report.provider_degraded.as_deref(), Some("upstream unreachable"));
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_failure_still_dispatches_but_fails_the_run() {
        let channel = Arc::new(RecordingChannel::default());
        let today = fixtures::set(Market::AShare, d(2026, 3, 4), &[("BK01", 1.0, 0.1)]);
        let report = pipeline(today, 0, Arc::new(BrokenStore), channel.clone())
            .run(Uuid::new_v4(), None)
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.store_error.as_deref().unwrap().contains("disk full"));
        let delivered = channel.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].meta.store_error.is_some());
        // Only one day of data: the trend is reported as a gap, not a score.
        assert_eq!(delivered[0].trend_gaps.len(), 1);
    }
}
