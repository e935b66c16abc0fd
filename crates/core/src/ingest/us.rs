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

/// Select Sector SPDR funds, one per GICS sector.
pub const SECTOR_ETFS: &[SectorEtf] = &[
    SectorEtf { ticker: "XLK", sector_name: "Technology" },
    SectorEtf { ticker: "XLF", sector_name: "Financials" },
    SectorEtf { ticker: "XLV", sector_name: "Health Care" },
    SectorEtf { ticker: "XLY", sector_name: "Consumer Discretionary" },
    SectorEtf { ticker: "XLC", sector_name: "Communication Services" },
    SectorEtf { ticker: "XLI", sector_name: "Industrials" },
    SectorEtf { ticker: "XLP", sector_name: "Consumer Staples" },
    SectorEtf { ticker: "XLE", sector_name: "Energy" },
    SectorEtf { ticker: "XLU", sector_name: "Utilities" },
    SectorEtf { ticker: "XLRE", sector_name: "Real Estate" },
    SectorEtf { ticker: "XLB", sector_name: "Materials" },
];

pub struct UsSectorProvider {
    basket: EtfBasket,
}

impl UsSectorProvider {
    pub fn new(
        source: Arc<dyn QuoteSource>,
        calendar: MarketCalendar,
        estimator: EstimationStrategy,
        retry: RetryPolicy,
        req_delay: Duration,
    ) -> Self {
        Self {
            basket: EtfBasket::new(
                Market::Us,
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
impl MarketDataProvider for UsSectorProvider {
    fn market(&self) -> Market {
        Market::Us
    }

    fn provider_name(&self) -> &'static str {
        "us_sector_etf"
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
