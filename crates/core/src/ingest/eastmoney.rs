use anyhow::Context;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, REFERER, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::ingest::error::FetchError;
use crate::ingest::types::{RawFlowDay, RawFlowHistory, RawSectorFlow};

pub const DEFAULT_BASE_URL: &str = "https://push2.eastmoney.com";
pub const DEFAULT_HISTORY_BASE_URL: &str = "https://push2his.eastmoney.com";

/// Industry-board filter for the ranking list.
const BOARD_FILTER: &str = "m:90 t:2";
const KLINE_DATE: usize = 0;
const KLINE_MAIN_INFLOW: usize = 1;
const KLINE_CHANGE_PCT: usize = 12;

/// Native sector fund-flow data: a ranking for the latest session and per-board daily history.
#[async_trait::async_trait]
pub trait FlowSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    async fn sector_flows(&self) -> Result<Vec<RawSectorFlow>, FetchError>;

    /// Up to `days` most recent sessions for one board, oldest first.
    async fn sector_flow_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<RawFlowHistory, FetchError>;
}

#[derive(Debug, Clone)]
pub struct EastMoneyClient {
    http: reqwest::Client,
    base_url: String,
    history_base_url: String,
}

impl EastMoneyClient {
    pub fn new(base_url: &str, history_base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0 sectorflow"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(REFERER, HeaderValue::from_static("https://data.eastmoney.com/"));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build eastmoney http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            history_base_url: history_base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, url: String, query: &[(&str, String)]) -> Result<String, FetchError> {
        let res = self.http.get(url).query(query).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(FetchError::from_status(status, &text));
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl FlowSource for EastMoneyClient {
    fn source_name(&self) -> &'static str {
        "eastmoney"
    }

    async fn sector_flows(&self) -> Result<Vec<RawSectorFlow>, FetchError> {
        let url = format!("{}/api/qt/clist/get", self.base_url);
        let text = self
            .get_text(
                url,
                &[
                    ("pn", "1".to_string()),
                    ("pz", "500".to_string()),
                    ("po", "1".to_string()),
                    ("np", "1".to_string()),
                    ("fltt", "2".to_string()),
                    ("invt", "2".to_string()),
                    ("fid", "f62".to_string()),
                    ("fs", BOARD_FILTER.to_string()),
                    ("fields", "f12,f14,f3,f62,f5".to_string()),
                ],
            )
            .await?;
        parse_sector_flows(&text)
    }

    async fn sector_flow_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<RawFlowHistory, FetchError> {
        let url = format!("{}/api/qt/stock/fflow/daykline/get", self.history_base_url);
        let text = self
            .get_text(
                url,
                &[
                    ("lmt", days.to_string()),
                    ("klt", "101".to_string()),
                    ("secid", format!("90.{sector_code}")),
                    ("fields1", "f1,f2,f3,f7".to_string()),
                    (
                        "fields2",
                        "f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61,f62,f63,f64,f65".to_string(),
                    ),
                ],
            )
            .await?;
        parse_flow_history(&text)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ClistData {
    #[serde(default)]
    diff: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    klines: Vec<String>,
}

/// Upstream numbers arrive as JSON numbers, numeric strings, or "-" for missing.
fn num(v: Option<&Value>) -> Option<f64> {
    let x = match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    x.filter(|x| x.is_finite())
}

fn text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() && s.trim() != "-" => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows without a code or name cannot be addressed and are dropped here; rows with missing
/// numbers are kept so the provider can count them as per-sector failures.
fn parse_sector_flows(body: &str) -> Result<Vec<RawSectorFlow>, FetchError> {
    let env: Envelope<ClistData> = serde_json::from_str(body)?;
    let data = env
        .data
        .ok_or_else(|| FetchError::Malformed("sector ranking has no data".to_string()))?;

    let mut out = Vec::with_capacity(data.diff.len());
    for row in &data.diff {
        let (Some(code), Some(name)) = (text(row.get("f12")), text(row.get("f14"))) else {
            continue;
        };
        out.push(RawSectorFlow {
            code,
            name,
            change_pct: num(row.get("f3")),
            main_inflow: num(row.get("f62")),
            volume: num(row.get("f5")).filter(|v| *v >= 0.0).map(|v| v as u64),
        });
    }
    Ok(out)
}

fn parse_flow_history(body: &str) -> Result<RawFlowHistory, FetchError> {
    let env: Envelope<KlineData> = serde_json::from_str(body)?;
    let data = env
        .data
        .ok_or_else(|| FetchError::Malformed("flow history has no data".to_string()))?;

    let mut days = Vec::with_capacity(data.klines.len());
    for line in &data.klines {
        let cols: Vec<&str> = line.split(',').collect();
        let date = cols
            .get(KLINE_DATE)
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
        let main_inflow = cols
            .get(KLINE_MAIN_INFLOW)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|x| x.is_finite());
        let change_pct = cols
            .get(KLINE_CHANGE_PCT)
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|x| x.is_finite());

        match (date, main_inflow, change_pct) {
            (Some(date), Some(main_inflow), Some(change_pct)) => days.push(RawFlowDay {
                date,
                main_inflow,
                change_pct,
            }),
            _ => tracing::debug!(line = %line, "skipping malformed flow kline"),
        }
    }
    days.sort_by_key(|d| d.date);
    days.dedup_by_key(|d| d.date);

    Ok(RawFlowHistory {
        name: data.name.filter(|n| !n.trim().is_empty()),
        days,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ranking_with_placeholders() {
        let body = json!({
            "rc": 0,
            "data": {
                "total": 3,
                "diff": [
                    {"f12": "BK0477", "f14": "酿酒行业", "f3": 1.52, "f62": 812345678.0, "f5": 3456789},
                    {"f12": "BK1036", "f14": "半导体", "f3": "-", "f62": "-", "f5": "-"},
                    {"f12": "", "f14": "无代码", "f3": 0.1, "f62": 1.0, "f5": 1}
                ]
            }
        });
        let rows = parse_sector_flows(&body.to_string()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].code, "BK0477");
        assert_eq!(rows[0].main_inflow, Some(812345678.0));
        assert_eq!(rows[0].volume, Some(3456789));
        assert_eq!(rows[1].main_inflow, None);
        assert_eq!(rows[1].change_pct, None);
    }

    #[test]
    fn null_data_is_malformed() {
        let err = parse_sector_flows(r#"{"rc":0,"data":null}"#).unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[test]
    fn absent_data_is_malformed_for_both_endpoints() {
        for body in [r#"{"rc":102}"#, r#"{"rc":0,"data":null}"#] {
            assert!(matches!(parse_sector_flows(body), Err(FetchError::Malformed(_))));
            assert!(matches!(parse_flow_history(body), Err(FetchError::Malformed(_))));
        }
    }

    #[test]
    fn parses_kline_history_oldest_first() {
        let body = json!({
            "data": {
                "code": "BK0477",
                "name": "酿酒行业",
                "klines": [
                    "2026-03-03,-1200.0,0,0,0,0,0,0,0,0,0,1010.5,-0.80,0,0",
                    "2026-03-02,3400.5,0,0,0,0,0,0,0,0,0,1018.6,1.25,0,0",
                    "broken-row"
                ]
            }
        });
        let hist = parse_flow_history(&body.to_string()).unwrap();
        assert_eq!(hist.name.as_deref(), Some("酿酒行业"));
        assert_eq!(hist.days.len(), 2);
        assert_eq!(hist.days[0].date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(hist.days[0].main_inflow, 3400.5);
        assert_eq!(hist.days[1].change_pct, -0.80);
    }
}
