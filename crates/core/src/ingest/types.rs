use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar in the exchange's local calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub volume: u64,
}

/// A row of a native sector fund-flow ranking. Fields are optional because the upstream marks
/// missing values with placeholders; completeness is checked when converting to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSectorFlow {
    pub code: String,
    pub name: String,
    pub change_pct: Option<f64>,
    pub main_inflow: Option<f64>,
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFlowDay {
    pub date: NaiveDate,
    pub main_inflow: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFlowHistory {
    pub name: Option<String>,
    pub days: Vec<RawFlowDay>,
}
