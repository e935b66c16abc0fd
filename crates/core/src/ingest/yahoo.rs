use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;

use crate::ingest::error::FetchError;
use crate::ingest::types::DailyBar;

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Daily bars for one listed instrument.
#[async_trait::async_trait]
pub trait QuoteSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Bars with `start <= date <= end`, oldest first.
    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct YahooChartClient {
    http: reqwest::Client,
    base_url: String,
}

impl YahooChartClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 sectorflow"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build yahoo chart http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, symbol: &str) -> String {
        format!("{}/v8/finance/chart/{}", self.base_url, symbol)
    }
}

#[async_trait::async_trait]
impl QuoteSource for YahooChartClient {
    fn source_name(&self) -> &'static str {
        "yahoo_chart"
    }

    async fn daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>, FetchError> {
        let period1 = epoch_secs(start);
        let period2 = epoch_secs(end + ChronoDuration::days(1));

        let res = self
            .http
            .get(self.url(symbol))
            .query(&[
                ("period1", period1.to_string()),
                ("period2", period2.to_string()),
                ("interval", "1d".to_string()),
                ("events", "history".to_string()),
            ])
            .send()
            .await?;

        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(FetchError::from_status(status, &text));
        }

        let bars = parse_chart(&text)?;
        Ok(bars
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect())
    }
}

fn epoch_secs(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i32,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Parses a chart response into bars sorted by date. Rows without a close are skipped; a
/// duplicated date keeps the later row (the live bar of an unfinished session).
fn parse_chart(text: &str) -> Result<Vec<DailyBar>, FetchError> {
    let env: ChartEnvelope = serde_json::from_str(text)?;

    if let Some(err) = env.chart.error.filter(|e| !e.is_null()) {
        return Err(FetchError::Malformed(format!("chart error: {err}")));
    }

    let result = env
        .chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| FetchError::Malformed("chart result is empty".to_string()))?;

    let offset = FixedOffset::east_opt(result.meta.gmtoffset)
        .ok_or_else(|| FetchError::Malformed(format!("bad gmtoffset {}", result.meta.gmtoffset)))?;
    let series = result.indicators.quote.into_iter().next().unwrap_or_default();

    let mut bars: Vec<DailyBar> = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let Some(close) = series.close.get(i).copied().flatten() else {
            continue;
        };
        let Some(utc) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };
        let date = utc.with_timezone(&offset).date_naive();
        let open = series.open.get(i).copied().flatten().unwrap_or(close);
        let volume = series
            .volume
            .get(i)
            .copied()
            .flatten()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64)
            .unwrap_or(0);

        let bar = DailyBar {
            date,
            open,
            close,
            volume,
        };
        match bars.last_mut() {
            Some(last) if last.date == date => *last = bar,
            _ => bars.push(bar),
        }
    }

    bars.sort_by_key(|b| b.date);
    Ok(bars)
}
