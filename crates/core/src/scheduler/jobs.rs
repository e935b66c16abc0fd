use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::Market;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    /// The last run failed. The next trigger is accepted and moves the job back through idle.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a {market} run is already in progress")]
pub struct ScheduleConflict {
    pub market: Market,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub market: Market,
    pub state: JobState,
    pub current_run: Option<Uuid>,
    pub last_status: Option<RunStatus>,
    pub last_run_id: Option<Uuid>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub runs_started: u64,
    pub runs_rejected: u64,
}

impl JobRecord {
    fn new(market: Market) -> Self {
        Self {
            market,
            state: JobState::Idle,
            current_run: None,
            last_status: None,
            last_run_id: None,
            last_finished_at: None,
            runs_started: 0,
            runs_rejected: 0,
        }
    }
}

/// One record per scheduled market, each behind its own lock. Markets never contend.
#[derive(Debug)]
pub struct JobTable {
    jobs: BTreeMap<Market, Mutex<JobRecord>>,
}

fn lock(m: &Mutex<JobRecord>) -> MutexGuard<'_, JobRecord> {
    // A panic while holding the lock cannot leave the record half-written: every update is a
    // handful of field stores.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobTable {
    pub fn new(markets: impl IntoIterator<Item = Market>) -> Arc<Self> {
        Arc::new(Self {
            jobs: markets
                .into_iter()
                .map(|m| (m, Mutex::new(JobRecord::new(m))))
                .collect(),
        })
    }

    pub fn markets(&self) -> Vec<Market> {
        self.jobs.keys().copied().collect()
    }

    pub fn get(&self, market: Market) -> Option<JobRecord> {
        self.jobs.get(&market).map(|m| lock(m).clone())
    }

    pub fn all(&self) -> Vec<JobRecord> {
        self.jobs.values().map(|m| lock(m).clone()).collect()
    }

    pub fn is_running(&self, market: Market) -> bool {
        self.get(market)
            .map_or(false, |r| r.state == JobState::Running)
    }

    /// Moves `market` to `Running` and returns the guard that ends the run. Rejects (and counts)
    /// the attempt when a run is already in flight. Returns `None` for unscheduled markets.
    pub fn try_begin(
        table: &Arc<Self>,
        market: Market,
        run_id: Uuid,
    ) -> Option<Result<RunGuard, ScheduleConflict>> {
        let slot = table.jobs.get(&market)?;
        let mut rec = lock(slot);

        if rec.state == JobState::Running {
            rec.runs_rejected += 1;
            tracing::warn!(
                %market,
                running = ?rec.current_run,
                rejected = rec.runs_rejected,
                "trigger rejected; run already in progress"
            );
            return Some(Err(ScheduleConflict { market }));
        }

        if rec.state == JobState::Failed {
            tracing::debug!(%market, "job re-armed after failed run");
        }
        rec.state = JobState::Running;
        rec.current_run = Some(run_id);
        rec.runs_started += 1;

        Some(Ok(RunGuard {
            table: Arc::clone(table),
            market,
            run_id,
            finished: false,
        }))
    }

    fn end(&self, market: Market, run_id: Uuid, status: RunStatus) {
        let Some(slot) = self.jobs.get(&market) else {
            return;
        };
        let mut rec = lock(slot);
        rec.state = match status {
            RunStatus::Succeeded => JobState::Idle,
            RunStatus::Failed => JobState::Failed,
        };
        rec.current_run = None;
        rec.last_status = Some(status);
        rec.last_run_id = Some(run_id);
        rec.last_finished_at = Some(Utc::now());
    }

    /// Waits until no market is running, or `grace` elapses. Returns whether all runs ended.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !self.jobs.keys().any(|m| self.is_running(*m)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Proof that a market is `Running`. Finishing records the outcome; dropping it unfinished (a
/// panicked or cancelled run) records a failure so the market is never stuck.
#[derive(Debug)]
pub struct RunGuard {
    table: Arc<JobTable>,
    market: Market,
    run_id: Uuid,
    finished: bool,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn finish(mut self, status: RunStatus) {
        self.table.end(self.market, self.run_id, status);
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(market = %self.market, run_id = %self.run_id, "run ended without reporting; marking failed");
            self.table.end(self.market, self.run_id, RunStatus::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_while_running() {
        let table = JobTable::new([Market::Us, Market::Hk]);
        let guard = JobTable::try_begin(&table, Market::Us, Uuid::new_v4()).unwrap().unwrap();

        let err = JobTable::try_begin(&table, Market::Us, Uuid::new_v4()).unwrap().unwrap_err();
        assert_eq!(err, ScheduleConflict { market: Market::Us });

        // Other markets are independent.
        let hk = JobTable::try_begin(&table, Market::Hk, Uuid::new_v4()).unwrap().unwrap();
        hk.finish(RunStatus::Succeeded);

        guard.finish(RunStatus::Succeeded);
        let rec = table.get(Market::Us).unwrap();
        assert_eq!(rec.state, JobState::Idle);
        assert_eq!(rec.runs_started, 1);
        assert_eq!(rec.runs_rejected, 1);
        assert_eq!(rec.last_status, Some(RunStatus::Succeeded));
    }

    #[test]
    fn failed_run_rearms_on_next_trigger() {
        let table = JobTable::new([Market::AShare]);
        JobTable::try_begin(&table, Market::AShare, Uuid::new_v4())
            .unwrap()
            .unwrap()
            .finish(RunStatus::Failed);
        assert_eq!(table.get(Market::AShare).unwrap().state, JobState::Failed);

        let again = JobTable::try_begin(&table, Market::AShare, Uuid::new_v4()).unwrap();
        assert!(again.is_ok());
        assert_eq!(table.get(Market::AShare).unwrap().state, JobState::Running);
    }

    #[test]
    fn dropped_guard_marks_failure() {
        let table = JobTable::new([Market::Hk]);
        let run_id = Uuid::new_v4();
        drop(JobTable::try_begin(&table, Market::Hk, run_id).unwrap().unwrap());

        let rec = table.get(Market::Hk).unwrap();
        assert_eq!(rec.state, JobState::Failed);
        assert_eq!(rec.last_run_id, Some(run_id));
    }

    #[test]
    fn unscheduled_market_has_no_job() {
        let table = JobTable::new([Market::Us]);
        assert!(JobTable::try_begin(&table, Market::AShare, Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn wait_idle_returns_once_runs_end() {
        let table = JobTable::new([Market::Us]);
        let guard = JobTable::try_begin(&table, Market::Us, Uuid::new_v4()).unwrap().unwrap();
        assert!(!table.wait_idle(Duration::from_millis(10)).await);
        guard.finish(RunStatus::Succeeded);
        assert!(table.wait_idle(Duration::from_millis(10)).await);
    }
}
