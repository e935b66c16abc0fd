use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::market::{Currency, Market};

/// One sector's flow record for one trading session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorSnapshot {
    pub market: Market,
    pub as_of_date: NaiveDate,
    pub sector_code: String,
    pub sector_name: String,
    pub change_pct: f64,
    /// Signed net inflow in `currency` units. Estimated for ETF-backed markets.
    pub main_inflow: f64,
    pub volume: u64,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error("sector_code must be non-empty")]
    EmptyCode,
    #[error("sector_name must be non-empty (sector_code={0})")]
    EmptyName(String),
    #[error("field '{field}' must be finite (sector_code={sector_code})")]
    NonFinite {
        sector_code: String,
        field: &'static str,
    },
    #[error("record belongs to {got_market}/{got_date}, set is {market}/{date}")]
    ForeignRecord {
        market: Market,
        date: NaiveDate,
        got_market: Market,
        got_date: NaiveDate,
    },
    #[error("duplicate sector_code {0}")]
    DuplicateSector(String),
}

impl SectorSnapshot {
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.sector_code.trim().is_empty() {
            return Err(SnapshotError::EmptyCode);
        }
        if self.sector_name.trim().is_empty() {
            return Err(SnapshotError::EmptyName(self.sector_code.clone()));
        }
        for (field, v) in [("change_pct", self.change_pct), ("main_inflow", self.main_inflow)] {
            if !v.is_finite() {
                return Err(SnapshotError::NonFinite {
                    sector_code: self.sector_code.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// All sector records for one (market, date). Sector codes are unique; iteration order is by code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredSnapshotSet", into = "StoredSnapshotSet")]
pub struct SnapshotSet {
    market: Market,
    as_of_date: NaiveDate,
    records: BTreeMap<String, SectorSnapshot>,
}

impl SnapshotSet {
    pub fn new(market: Market, as_of_date: NaiveDate) -> Self {
        Self {
            market,
            as_of_date,
            records: BTreeMap::new(),
        }
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn as_of_date(&self) -> NaiveDate {
        self.as_of_date
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sector_code: &str) -> Option<&SectorSnapshot> {
        self.records.get(sector_code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SectorSnapshot> {
        self.records.values()
    }

    pub fn sector_codes(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Adds a validated record. Records for another market/date and duplicate codes are rejected.
    pub fn insert(&mut self, record: SectorSnapshot) -> Result<(), SnapshotError> {
        record.validate()?;
        if record.market != self.market || record.as_of_date != self.as_of_date {
            return Err(SnapshotError::ForeignRecord {
                market: self.market,
                date: self.as_of_date,
                got_market: record.market,
                got_date: record.as_of_date,
            });
        }
        if self.records.contains_key(&record.sector_code) {
            return Err(SnapshotError::DuplicateSector(record.sector_code));
        }
        self.records.insert(record.sector_code.clone(), record);
        Ok(())
    }

    pub fn try_from_records(
        market: Market,
        as_of_date: NaiveDate,
        records: impl IntoIterator<Item = SectorSnapshot>,
    ) -> Result<Self, SnapshotError> {
        let mut set = Self::new(market, as_of_date);
        for r in records {
            set.insert(r)?;
        }
        Ok(set)
    }

    pub fn into_records(self) -> Vec<SectorSnapshot> {
        self.records.into_values().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshotSet {
    market: Market,
    as_of_date: NaiveDate,
    sectors: Vec<SectorSnapshot>,
}

impl TryFrom<StoredSnapshotSet> for SnapshotSet {
    type Error = SnapshotError;

    fn try_from(v: StoredSnapshotSet) -> Result<Self, Self::Error> {
        SnapshotSet::try_from_records(v.market, v.as_of_date, v.sectors)
    }
}

impl From<SnapshotSet> for StoredSnapshotSet {
    fn from(v: SnapshotSet) -> Self {
        Self {
            market: v.market,
            as_of_date: v.as_of_date,
            sectors: v.records.into_values().collect(),
        }
    }
}
