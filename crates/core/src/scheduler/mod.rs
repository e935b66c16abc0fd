//! Per-market scheduling. Each enabled market gets its own timer task; runs for different
//! markets proceed concurrently, and a market never has more than one run in flight.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::config::Settings;
use crate::dispatch::Dispatcher;
use crate::domain::Market;
use crate::ingest::build_provider;
use crate::storage::SnapshotStore;

pub mod jobs;
pub mod pipeline;

pub use jobs::{JobRecord, JobState, JobTable, RunGuard, RunStatus, ScheduleConflict};
pub use pipeline::{AnalysisOptions, Pipeline, RunReport};

/// How long shutdown waits for in-flight runs before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error(transparent)]
    Conflict(#[from] ScheduleConflict),
    #[error("market {0} is not scheduled")]
    NotScheduled(Market),
}

pub struct Scheduler {
    jobs: Arc<JobTable>,
    pipelines: BTreeMap<Market, Arc<Pipeline>>,
}

impl Scheduler {
    pub fn new(pipelines: impl IntoIterator<Item = Pipeline>) -> Self {
        let pipelines: BTreeMap<Market, Arc<Pipeline>> = pipelines
            .into_iter()
            .map(|p| (p.market(), Arc::new(p)))
            .collect();
        let jobs = JobTable::new(pipelines.keys().copied());
        Self { jobs, pipelines }
    }

    /// One pipeline per enabled market, sharing the store and dispatcher.
    pub fn from_settings(
        settings: &Settings,
        store: Arc<dyn SnapshotStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> anyhow::Result<Self> {
        let options = AnalysisOptions::from_settings(settings);
        let mut pipelines = Vec::new();
        for market in settings.enabled_markets() {
            let provider = build_provider(market, settings)?;
            pipelines.push(Pipeline::new(
                provider,
                store.clone(),
                dispatcher.clone(),
                settings.calendar(market),
                options,
            ));
        }
        Ok(Self::new(pipelines))
    }

    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    pub fn markets(&self) -> Vec<Market> {
        self.pipelines.keys().copied().collect()
    }

    /// Starts a run for `market` on its own task. Rejected without side effects when that market
    /// is already running.
    pub fn trigger(
        &self,
        market: Market,
        as_of_date: Option<NaiveDate>,
    ) -> Result<JoinHandle<RunReport>, TriggerError> {
        let pipeline = self
            .pipelines
            .get(&market)
            .cloned()
            .ok_or(TriggerError::NotScheduled(market))?;

        let run_id = Uuid::new_v4();
        let guard = JobTable::try_begin(&self.jobs, market, run_id)
            .ok_or(TriggerError::NotScheduled(market))??;

        Ok(tokio::spawn(async move {
            let report = pipeline.run(guard.run_id(), as_of_date).await;
            guard.finish(report.status);
            report
        }))
    }

    /// Runs every market's timer until `shutdown` resolves, then waits briefly for in-flight
    /// runs to finish.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut timers = JoinSet::new();
        for market in self.markets() {
            let this = Arc::clone(&self);
            timers.spawn(async move { this.timer_loop(market).await });
        }
        tracing::info!(markets = ?self.markets(), "scheduler started");

        tokio::select! {
            _ = shutdown => tracing::info!("shutdown requested; stopping timers"),
            _ = async { while timers.join_next().await.is_some() {} } => {
                tracing::warn!("all market timers exited");
            }
        }
        timers.abort_all();

        if !self.jobs.wait_idle(SHUTDOWN_GRACE).await {
            tracing::warn!(grace = ?SHUTDOWN_GRACE, "runs still in flight at shutdown");
        }
    }

    async fn timer_loop(&self, market: Market) {
        let Some(pipeline) = self.pipelines.get(&market) else {
            return;
        };
        let calendar = pipeline.calendar().clone();
        let mut last_fired: Option<DateTime<Utc>> = None;

        loop {
            let now = Utc::now();
            // A sleep that wakes before the wall clock reaches the slot must not refire it.
            let after = last_fired.map_or(now, |fired| fired.max(now));
            let Some(next) = calendar.next_trigger_after(after) else {
                tracing::error!(%market, "no upcoming trading day in calendar; timer stopped");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(%market, next_run = %next, wait_secs = wait.as_secs(), "next run scheduled");
            tokio::time::sleep(wait).await;
            last_fired = Some(next);

            match self.trigger(market, None) {
                Ok(handle) => match handle.await {
                    Ok(report) => tracing::debug!(%market, run_id = %report.run_id, status = ?report.status, "scheduled run done"),
                    Err(err) => tracing::error!(%market, error = %err, "scheduled run task panicked"),
                },
                Err(err) => tracing::warn!(%market, error = %err, "scheduled trigger skipped"),
            }
        }
    }
}
