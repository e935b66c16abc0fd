use anyhow::Context;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Market, SectorSnapshot, SnapshotSet};
use crate::ingest::provider::{check_history_days, FailureLog, MarketDataProvider, SectorFailure};
use crate::storage::SnapshotStore;
use crate::time::MarketCalendar;

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub market: Market,
    pub sectors: usize,
    pub days_written: Vec<NaiveDate>,
    /// Days already persisted; a stored snapshot wins over reconstructed history.
    pub days_kept: Vec<NaiveDate>,
    /// Days whose stored snapshot could not be decoded and was rebuilt. Also in `days_written`.
    pub days_repaired: Vec<NaiveDate>,
    pub non_trading_days_dropped: usize,
    pub sector_failures: Vec<SectorFailure>,
}

/// Rebuilds per-day snapshot sets from provider history and saves the days that are not stored
/// yet. The sector universe comes from the provider's current listing.
pub async fn backfill(
    provider: &dyn MarketDataProvider,
    store: &dyn SnapshotStore,
    calendar: &MarketCalendar,
    days: u32,
) -> anyhow::Result<BackfillReport> {
    let market = provider.market();
    anyhow::ensure!(
        calendar.market == market,
        "calendar for {} cannot drive a {market} backfill",
        calendar.market
    );
    check_history_days(days)?;

    let sectors: BTreeSet<String> = provider
        .sector_codes()
        .await
        .with_context(|| format!("discover {market} sectors"))?
        .into_iter()
        .collect();
    anyhow::ensure!(!sectors.is_empty(), "no sectors discovered for {market}");

    tracing::info!(%market, sectors = sectors.len(), days, "backfill started");

    let mut failures = FailureLog::new(market, "history fetch");
    let mut by_date: BTreeMap<NaiveDate, Vec<SectorSnapshot>> = BTreeMap::new();
    for code in &sectors {
        match provider.fetch_history(code, days).await {
            Ok(rows) => {
                for row in rows {
                    by_date.entry(row.as_of_date).or_default().push(row);
                }
            }
            Err(err) => failures.record(code, err),
        }
    }

    let mut report = BackfillReport {
        market,
        sectors: sectors.len(),
        days_written: Vec::new(),
        days_kept: Vec::new(),
        days_repaired: Vec::new(),
        non_trading_days_dropped: 0,
        sector_failures: Vec::new(),
    };

    for (date, rows) in by_date {
        if !calendar.is_trading_day(date) {
            report.non_trading_days_dropped += 1;
            continue;
        }
        match store.load(market, date).await {
            Ok(Some(_)) => {
                report.days_kept.push(date);
                continue;
            }
            Ok(None) => {}
            // An unreadable day counts as absent; the rebuilt set replaces it.
            Err(err) if err.is_corruption() => {
                tracing::warn!(%market, as_of_date = %date, error = %err, "replacing corrupt snapshot");
                report.days_repaired.push(date);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("check stored {market} snapshot for {date}")));
            }
        }

        let mut set = SnapshotSet::new(market, date);
        for row in rows {
            if let Err(err) = set.insert(row) {
                tracing::warn!(%market, as_of_date = %date, error = %err, "dropping backfill record");
            }
        }
        if set.is_empty() {
            continue;
        }

        store.save(market, date, &set).await?;
        report.days_written.push(date);
    }

    report.sector_failures = failures.finish();
    tracing::info!(
        %market,
        days_written = report.days_written.len(),
        days_kept = report.days_kept.len(),
        days_repaired = report.days_repaired.len(),
        failures = report.sector_failures.len(),
        "backfill finished"
    );
    Ok(report)
}
