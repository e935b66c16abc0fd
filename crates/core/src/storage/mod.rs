use anyhow::Context;
use chrono::NaiveDate;
use std::sync::Arc;

use crate::config::{Settings, StoreBackend};
use crate::domain::{Market, SectorSnapshot, SnapshotSet};
use crate::time::MarketCalendar;

pub mod file;
pub mod postgres;

pub use file::FileSnapshotStore;
pub use postgres::PgSnapshotStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A persisted day exists but cannot be decoded into a valid snapshot set.
    #[error("snapshot for {market} {date} is corrupt: {detail}")]
    Corruption {
        market: Market,
        date: NaiveDate,
        detail: String,
    },
    #[error("snapshot set for {got_market} {got_date} cannot be saved as {market} {date}")]
    Mismatch {
        market: Market,
        date: NaiveDate,
        got_market: Market,
        got_date: NaiveDate,
    },
    #[error("snapshot store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot store database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }
}

/// Durable per-(market, date) snapshot sets.
///
/// `save` replaces whatever was stored for the same day. A corrupt day reads as an error from
/// `load` and as absent from the range helpers.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn save(
        &self,
        market: Market,
        date: NaiveDate,
        set: &SnapshotSet,
    ) -> Result<(), StoreError>;

    async fn load(&self, market: Market, date: NaiveDate)
        -> Result<Option<SnapshotSet>, StoreError>;

    /// Persisted dates in `[start, end]`, ascending.
    async fn list_dates(
        &self,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError>;

    /// Every readable day in `[start, end]`, oldest first. Missing days are skipped and never
    /// synthesized; corrupt days are logged and skipped.
    async fn load_range(
        &self,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<SnapshotSet>, StoreError> {
        let mut out = Vec::new();
        for date in self.list_dates(market, start, end).await? {
            match self.load(market, date).await {
                Ok(Some(set)) => out.push(set),
                Ok(None) => {}
                Err(err) if err.is_corruption() => {
                    tracing::warn!(%market, as_of_date = %date, error = %err, "skipping corrupt snapshot");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    /// The closest earlier trading day that has a readable snapshot. At most `lookback_limit`
    /// trading days are probed.
    async fn previous_trading_day(
        &self,
        calendar: &MarketCalendar,
        date: NaiveDate,
        lookback_limit: u32,
    ) -> Result<Option<SnapshotSet>, StoreError> {
        let market = calendar.market;
        let mut cursor = date;
        for _ in 0..lookback_limit {
            let Some(prev) = calendar.previous_trading_day(cursor) else {
                return Ok(None);
            };
            match self.load(market, prev).await {
                Ok(Some(set)) => return Ok(Some(set)),
                Ok(None) => {}
                Err(err) if err.is_corruption() => {
                    tracing::warn!(%market, as_of_date = %prev, error = %err, "previous snapshot corrupt; looking further back");
                }
                Err(err) => return Err(err),
            }
            cursor = prev;
        }
        Ok(None)
    }
}

pub(crate) fn ensure_matches(
    market: Market,
    date: NaiveDate,
    set: &SnapshotSet,
) -> Result<(), StoreError> {
    if set.market() != market || set.as_of_date() != date {
        return Err(StoreError::Mismatch {
            market,
            date,
            got_market: set.market(),
            got_date: set.as_of_date(),
        });
    }
    Ok(())
}

/// Records of one sector across loaded days, oldest first.
pub fn sector_history(sets: &[SnapshotSet], sector_code: &str) -> Vec<SectorSnapshot> {
    sets.iter()
        .filter_map(|s| s.get(sector_code).cloned())
        .collect()
}

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("sqlx migrations failed")?;
    Ok(())
}

/// Opens the configured backend. Postgres connects and runs migrations first.
pub async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    match settings.store {
        StoreBackend::File => {
            let store = FileSnapshotStore::new(&settings.data_path);
            tracing::info!(data_path = %settings.data_path.display(), "using file snapshot store");
            Ok(Arc::new(store))
        }
        StoreBackend::Postgres => {
            let db_url = settings.require_database_url()?;
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await
                .context("connect DATABASE_URL failed")?;
            migrate(&pool).await?;
            tracing::info!("using postgres snapshot store");
            Ok(Arc::new(PgSnapshotStore::new(pool)))
        }
    }
}
