use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;

use crate::domain::{Market, SectorSnapshot, SnapshotSet};
use crate::ingest::eastmoney::FlowSource;
use crate::ingest::error::{FetchError, InvalidRequest};
use crate::ingest::provider::{
    check_history_days, resolve_as_of, FailureLog, FetchOutcome, MarketDataProvider,
};
use crate::ingest::types::RawSectorFlow;
use crate::retry::RetryPolicy;
use crate::time::MarketCalendar;

/// China A-share industry boards with native main-force net inflow.
pub struct AShareProvider {
    source: Arc<dyn FlowSource>,
    calendar: MarketCalendar,
    retry: RetryPolicy,
}

impl AShareProvider {
    pub fn new(source: Arc<dyn FlowSource>, calendar: MarketCalendar, retry: RetryPolicy) -> Self {
        Self {
            source,
            calendar,
            retry,
        }
    }

    fn snapshot(&self, date: NaiveDate, row: &RawSectorFlow) -> Result<SectorSnapshot, String> {
        let change_pct = row.change_pct.ok_or("missing change_pct")?;
        let main_inflow = row.main_inflow.ok_or("missing main_inflow")?;
        Ok(SectorSnapshot {
            market: Market::AShare,
            as_of_date: date,
            sector_code: row.code.clone(),
            sector_name: row.name.clone(),
            change_pct,
            main_inflow,
            volume: row.volume.unwrap_or(0),
            currency: Market::AShare.currency(),
        })
    }

    /// The ranking endpoint is live: it serves whatever session is current at `now`. Only the
    /// latest closed session can be read from it, and only once no newer session has opened.
    async fn fetch_at(
        &self,
        as_of_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        let date = resolve_as_of(&self.calendar, as_of_date, now)?;
        let latest = resolve_as_of(&self.calendar, None, now)?;

        if date != latest {
            return Ok(FetchOutcome::degraded(
                Market::AShare,
                date,
                format!("live ranking only covers {latest}; use backfill for {date}"),
            ));
        }
        if let Some(open) = self.calendar.open_session(now) {
            tracing::warn!(market = %Market::AShare, as_of_date = %date, open_session = %open, "session still open; live ranking not stored");
            return Ok(FetchOutcome::degraded(
                Market::AShare,
                date,
                format!("session {open} has not closed; live ranking is intraday and cannot stand in for {date}"),
            ));
        }
        Ok(self.fetch_session(date).await)
    }

    async fn fetch_session(&self, date: NaiveDate) -> FetchOutcome {
        let rows = match self
            .retry
            .run("eastmoney sector ranking", || self.source.sector_flows())
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(market = %Market::AShare, as_of_date = %date, error = %err, "sector ranking unavailable");
                return FetchOutcome::degraded(Market::AShare, date, err.to_string());
            }
        };
        if rows.is_empty() {
            return FetchOutcome::degraded(Market::AShare, date, "sector ranking is empty");
        }

        let mut set = SnapshotSet::new(Market::AShare, date);
        let mut failures = FailureLog::new(Market::AShare, "sector flow row");
        for row in &rows {
            let inserted = self
                .snapshot(date, row)
                .and_then(|s| set.insert(s).map_err(|e| e.to_string()));
            if let Err(reason) = inserted {
                failures.record(&row.code, reason);
            }
        }

        let failures = failures.finish();
        let degraded = set
            .is_empty()
            .then(|| format!("all {} ranking rows were unusable", rows.len()));

        tracing::info!(
            market = %Market::AShare,
            as_of_date = %date,
            sectors = set.len(),
            failures = failures.len(),
            "fetched sector flow ranking"
        );

        FetchOutcome {
            snapshots: set,
            failures,
            degraded,
        }
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for AShareProvider {
    fn market(&self) -> Market {
        Market::AShare
    }

    fn provider_name(&self) -> &'static str {
        "a_share_eastmoney"
    }

    async fn fetch_current(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        self.fetch_at(as_of_date, Utc::now()).await
    }

    async fn sector_codes(&self) -> Result<Vec<String>, FetchError> {
        let rows = self
            .retry
            .run("eastmoney sector ranking", || self.source.sector_flows())
            .await?;
        let mut codes: Vec<String> = rows.into_iter().map(|r| r.code).collect();
        codes.sort();
        codes.dedup();
        Ok(codes)
    }

    async fn fetch_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        check_history_days(days)?;
        if sector_code.trim().is_empty() {
            return Err(InvalidRequest::UnknownSector {
                market: Market::AShare,
                sector_code: sector_code.to_string(),
            }
            .into());
        }

        let hist = self
            .retry
            .run(sector_code, || self.source.sector_flow_history(sector_code, days))
            .await?;
        let name = hist.name.unwrap_or_else(|| sector_code.to_string());

        let mut out: Vec<SectorSnapshot> = hist
            .days
            .into_iter()
            .map(|day| SectorSnapshot {
                market: Market::AShare,
                as_of_date: day.date,
                sector_code: sector_code.to_string(),
                sector_name: name.clone(),
                change_pct: day.change_pct,
                main_inflow: day.main_inflow,
                volume: 0,
                currency: Market::AShare.currency(),
            })
            .collect();

        let keep = days as usize;
        if out.len() > keep {
            out.drain(..out.len() - keep);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::ingest::types::{RawFlowDay, RawFlowHistory};
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeFlows {
        pub rows: Option<Vec<RawSectorFlow>>,
        pub history: HashMap<String, RawFlowHistory>,
    }

    impl FakeFlows {
        pub fn with_row(mut self, code: &str, inflow: Option<f64>, pct: Option<f64>) -> Self {
            self.rows.get_or_insert_with(Vec::new).push(RawSectorFlow {
                code: code.to_string(),
                name: format!("Board {code}"),
                change_pct: pct,
                main_inflow: inflow,
                volume: Some(10),
            });
            self
        }

        pub fn with_history(mut self, code: &str, days: &[(NaiveDate, f64, f64)]) -> Self {
            self.history.insert(
                code.to_string(),
                RawFlowHistory {
                    name: Some(format!("Board {code}")),
                    days: days
                        .iter()
                        .map(|(date, main_inflow, change_pct)| RawFlowDay {
                            date: *date,
                            main_inflow: *main_inflow,
                            change_pct: *change_pct,
                        })
                        .collect(),
                },
            );
            self
        }
    }

    #[async_trait::async_trait]
    impl FlowSource for FakeFlows {
        fn source_name(&self) -> &'static str {
            "fake_flows"
        }

        async fn sector_flows(&self) -> Result<Vec<RawSectorFlow>, FetchError> {
            self.rows
                .clone()
                .ok_or_else(|| FetchError::Transient("upstream unreachable".to_string()))
        }

        async fn sector_flow_history(
            &self,
            sector_code: &str,
            _days: u32,
        ) -> Result<RawFlowHistory, FetchError> {
            self.history
                .get(sector_code)
                .cloned()
                .ok_or_else(|| FetchError::Malformed(format!("no history for {sector_code}")))
        }
    }
}
