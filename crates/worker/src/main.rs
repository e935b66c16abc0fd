use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sectorflow_core::config::Settings;
use sectorflow_core::dispatch::Dispatcher;
use sectorflow_core::domain::Market;
use sectorflow_core::ingest::MAX_HISTORY_DAYS;
use sectorflow_core::scheduler::{RunReport, RunStatus, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "sectorflow_worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the pipeline once and exit.
    Run {
        /// Market key (a_share, us, hk) or `all` for every enabled market.
        #[arg(long, default_value = "all")]
        market: String,

        /// Session date (YYYY-MM-DD). Defaults to each market's latest completed session.
        #[arg(long)]
        as_of_date: Option<NaiveDate>,
    },
    /// Schedule every enabled market until Ctrl-C.
    Serve,
    /// Rebuild per-day snapshots from provider history.
    Backfill {
        #[arg(long)]
        market: Market,

        /// Trading history length per sector.
        #[arg(
            long,
            default_value_t = 30,
            value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_HISTORY_DAYS))
        )]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Run { market, as_of_date } => run_once(&settings, &market, as_of_date).await,
        Command::Serve => serve(&settings).await,
        Command::Backfill { market, days } => backfill(&settings, market, days).await,
    };

    if let Err(err) = &result {
        report_command_error(err);
    }
    result
}

/// Runs that reached a report but failed. Each one was already captured by `log_report`.
#[derive(Debug, thiserror::Error)]
#[error("runs failed for {0:?}")]
struct RunsFailed(Vec<Market>);

fn report_command_error(err: &anyhow::Error) {
    if err.downcast_ref::<RunsFailed>().is_none() {
        sentry_anyhow::capture_anyhow(err);
    }
    tracing::error!(error = %format!("{err:#}"), "worker command failed");
}

/// Sentry events come from explicit captures only; log records ride along as breadcrumbs.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN | tracing::Level::INFO => {
            sentry_tracing::EventFilter::Breadcrumb
        }
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

async fn build_scheduler(settings: &Settings) -> anyhow::Result<Scheduler> {
    let store = sectorflow_core::storage::open_store(settings).await?;
    let dispatcher = Arc::new(Dispatcher::from_settings(settings)?);
    tracing::info!(
        store = store.backend_name(),
        channels = ?dispatcher.channel_names(),
        "worker wired"
    );
    Scheduler::from_settings(settings, store, dispatcher)
}

fn select_markets(settings: &Settings, arg: &str) -> anyhow::Result<Vec<Market>> {
    if arg.eq_ignore_ascii_case("all") {
        return Ok(settings.enabled_markets());
    }
    let market: Market = arg.parse()?;
    anyhow::ensure!(
        settings.enabled_markets().contains(&market),
        "market {market} is disabled in configuration"
    );
    Ok(vec![market])
}

async fn run_once(
    settings: &Settings,
    market_arg: &str,
    as_of_date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let markets = select_markets(settings, market_arg)?;
    let scheduler = build_scheduler(settings).await?;

    // Markets run concurrently; each trigger owns its market's job slot.
    let mut handles = Vec::with_capacity(markets.len());
    for market in markets {
        let handle = scheduler
            .trigger(market, as_of_date)
            .with_context(|| format!("trigger {market} run"))?;
        handles.push((market, handle));
    }

    let mut failed = Vec::new();
    for (market, handle) in handles {
        let report = handle
            .await
            .with_context(|| format!("{market} run task panicked"))?;
        log_report(&report);
        println!("{}", serde_json::to_string_pretty(&summary(&report))?);
        if report.status == RunStatus::Failed {
            failed.push(market);
        }
    }

    if !failed.is_empty() {
        return Err(RunsFailed(failed).into());
    }
    Ok(())
}

async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let scheduler = Arc::new(build_scheduler(settings).await?);
    anyhow::ensure!(!scheduler.markets().is_empty(), "no markets to schedule");

    scheduler.clone().run_until(shutdown_signal()).await;

    for job in scheduler.jobs().all() {
        tracing::info!(
            market = %job.market,
            state = ?job.state,
            runs_started = job.runs_started,
            runs_rejected = job.runs_rejected,
            "job summary at shutdown"
        );
    }
    Ok(())
}

async fn backfill(settings: &Settings, market: Market, days: u32) -> anyhow::Result<()> {
    let store = sectorflow_core::storage::open_store(settings).await?;
    let provider = sectorflow_core::ingest::build_provider(market, settings)?;
    let calendar = settings.calendar(market);

    let report =
        sectorflow_core::ingest::backfill(provider.as_ref(), store.as_ref(), &calendar, days)
            .await?;

    tracing::info!(
        %market,
        sectors = report.sectors,
        days_written = report.days_written.len(),
        days_kept = report.days_kept.len(),
        days_repaired = report.days_repaired.len(),
        failures = report.sector_failures.len(),
        "backfill finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn log_report(report: &RunReport) {
    match report.status {
        RunStatus::Succeeded => tracing::info!(
            market = %report.market,
            run_id = %report.run_id,
            sectors = report.sectors_fetched,
            degraded = report.degraded_sectors,
            elapsed_ms = report.elapsed_ms as u64,
            "run succeeded"
        ),
        RunStatus::Failed => {
            let reason = report
                .error
                .as_deref()
                .or(report.store_error.as_deref())
                .unwrap_or("unknown");
            let err = anyhow::anyhow!("{} run {} failed: {reason}", report.market, report.run_id);
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(market = %report.market, run_id = %report.run_id, error = %reason, "run failed");
        }
    }
}

/// The report minus the full analysis bundle, which channels already received.
fn summary(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "market": report.market,
        "as_of_date": report.as_of_date,
        "status": report.status,
        "sectors_fetched": report.sectors_fetched,
        "degraded_sectors": report.degraded_sectors,
        "provider_degraded": report.provider_degraded,
        "store_error": report.store_error,
        "trend_gaps": report.trend_gaps,
        "channels": report.channels,
        "elapsed_ms": report.elapsed_ms as u64,
        "error": report.error,
        "top": report.result.as_ref().map(|r| &r.ranking.entries),
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned()).unwrap()
    }

    #[test]
    fn all_selects_enabled_markets_only() {
        let s = settings(&[("ENABLED_MARKETS", "us,hk")]);
        assert_eq!(select_markets(&s, "all").unwrap(), vec![Market::Us, Market::Hk]);
        assert_eq!(select_markets(&s, "usa").unwrap(), vec![Market::Us]);
        assert!(select_markets(&s, "a_share").is_err());
        assert!(select_markets(&s, "mars").is_err());
    }

    #[test]
    fn cli_parses_backfill() {
        let args = Args::try_parse_from(["sectorflow_worker", "backfill", "--market", "hk", "--days", "10"])
            .unwrap();
        match args.command {
            Command::Backfill { market, days } => {
                assert_eq!(market, Market::Hk);
                assert_eq!(days, 10);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn backfill_days_are_bounded() {
        for days in ["0", "3661", "4294967295"] {
            let parsed = Args::try_parse_from([
                "sectorflow_worker",
                "backfill",
                "--market",
                "us",
                "--days",
                days,
            ]);
            assert!(parsed.is_err(), "--days {days} accepted");
        }
    }

    fn failed_report(market: Market) -> RunReport {
        RunReport {
            run_id: uuid::Uuid::new_v4(),
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
            error: Some("provider returned no sectors".to_string()),
            result: None,
        }
    }

    #[test]
    fn failed_run_reaches_sentry_once() {
        let events = sentry::test::with_captured_events(|| {
            let report = failed_report(Market::Hk);
            log_report(&report);
            report_command_error(&RunsFailed(vec![report.market]).into());
        });
        assert_eq!(events.len(), 1);

        let events = sentry::test::with_captured_events(|| {
            report_command_error(&anyhow::anyhow!("store unreachable"));
        });
        assert_eq!(events.len(), 1);
    }
}
