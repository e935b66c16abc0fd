use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::domain::market::{Currency, Market};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSector {
    /// 1-based.
    pub rank: usize,
    pub sector_code: String,
    pub sector_name: String,
    pub main_inflow: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingResult {
    pub market: Market,
    pub as_of_date: NaiveDate,
    /// The `n` the ranking was computed with, not the number of entries.
    pub top_n: usize,
    pub entries: Vec<RankedSector>,
}

impl RankingResult {
    pub fn codes(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.sector_code.as_str()).collect()
    }

    pub fn rank_of(&self, sector_code: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.sector_code == sector_code)
            .map(|e| e.rank)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub entered: BTreeSet<String>,
    pub exited: BTreeSet<String>,
}

impl RotationEvent {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.exited.is_empty()
    }
}

/// A sector that entered the top ranks, with where it stood in the previous session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSignal {
    pub sector_code: String,
    pub previous_rank: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendScore {
    pub sector_code: String,
    pub window_days: usize,
    /// In [-100, 100].
    pub score: f64,
    pub direction: TrendDirection,
    pub avg_inflow: f64,
    /// In [0, 1].
    pub consistency: f64,
    pub momentum: f64,
}

/// A sector whose trend could not be computed in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendGap {
    pub sector_code: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: uuid::Uuid,
    pub provider: String,
    pub currency: Currency,
    pub generated_at: DateTime<Utc>,
    pub sectors_fetched: usize,
    pub degraded_sectors: usize,
    /// Provider-wide failure: the upstream produced nothing usable.
    pub provider_degraded: bool,
    pub previous_date: Option<NaiveDate>,
    pub store_error: Option<String>,
}

/// The bundle handed to dispatch channels once per market per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub market: Market,
    pub as_of_date: NaiveDate,
    pub ranking: RankingResult,
    pub rotation: Option<RotationEvent>,
    pub rotation_signals: Vec<RotationSignal>,
    pub trends: Vec<TrendScore>,
    pub trend_gaps: Vec<TrendGap>,
    pub meta: RunMetadata,
}
