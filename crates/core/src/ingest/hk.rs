use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{Market, SectorSnapshot};
use crate::ingest::error::{FetchError, InvalidRequest};
use crate::ingest::estimate::EstimationStrategy;
use crate::ingest::etf::{EtfBasket, SectorEtf};
use crate::ingest::provider::{FetchOutcome, MarketDataProvider};
use crate::ingest::yahoo::QuoteSource;
use crate::retry::RetryPolicy;
use crate::time::MarketCalendar;

/// Hang Seng index ETFs standing in for sectors.
pub const SECTOR_ETFS: &[SectorEtf] = &[
    SectorEtf { ticker: "3033.HK", sector_name: "Hang Seng TECH" },
    SectorEtf { ticker: "2828.HK", sector_name: "Hang Seng Financials" },
    SectorEtf { ticker: "2801.HK", sector_name: "Hang Seng Property" },
    SectorEtf { ticker: "3037.HK", sector_name: "Hang Seng Consumer" },
    SectorEtf { ticker: "2838.HK", sector_name: "Hang Seng Healthcare" },
];

pub struct HkSectorProvider {
    basket: EtfBasket,
}

impl HkSectorProvider {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        calendar: MarketCalendar,
        estimator: EstimationStrategy,
        retry: RetryPolicy,
        req_delay: Duration,
    ) -> Self {
        Self {
            basket: EtfBasket::new(
                Market::Hk,
                SECTOR_ETFS,
                source,
                calendar,
                estimator,
                retry,
                req_delay,
            ),
        }
    }
}

#[async_trait::async_trait]
impl MarketDataProvider for HkSectorProvider {
    fn market(&self) -> Market {
        Market::Hk
    }

    fn provider_name(&self) -> &'static str {
        "hk_sector_etf"
    }

    async fn fetch_current(
        &self,
        as_of_date: Option<NaiveDate>,
    ) -> Result<FetchOutcome, InvalidRequest> {
        self.basket.fetch_current(as_of_date).await
    }

    async fn sector_codes(&self) -> Result<Vec<String>, FetchError> {
        Ok(self.basket.etfs().iter().map(|e| e.ticker.to_string()).collect())
    }

    async fn fetch_history(
        &self,
        sector_code: &str,
        days: u32,
    ) -> Result<Vec<SectorSnapshot>, FetchError> {
        self.basket.fetch_history(sector_code, days).await
    }
}
