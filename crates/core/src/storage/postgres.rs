use chrono::NaiveDate;

use crate::domain::{Currency, Market, SectorSnapshot, SnapshotSet};
use crate::storage::{ensure_matches, SnapshotStore, StoreError};

const INSERT_BATCH: usize = 200;

type SnapshotRow = (String, String, f64, f64, i64, String);

/// Snapshot rows in `sector_snapshots`, one row per (market, date, sector).
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: sqlx::PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn decode_rows(
    market: Market,
    date: NaiveDate,
    rows: Vec<SnapshotRow>,
) -> Result<SnapshotSet, StoreError> {
    let corrupt = |detail: String| StoreError::Corruption {
        market,
        date,
        detail,
    };

    let mut records = Vec::with_capacity(rows.len());
    for (sector_code, sector_name, change_pct, main_inflow, volume, currency) in rows {
        let currency: Currency = currency
            .parse()
            .map_err(|err: String| corrupt(format!("sector {sector_code}: {err}")))?;
        if currency != market.currency() {
            return Err(corrupt(format!(
                "sector {sector_code}: {currency:?} row in a {market} snapshot"
            )));
        }
        let volume = u64::try_from(volume)
            .map_err(|_| corrupt(format!("sector {sector_code}: negative volume {volume}")))?;
        records.push(SectorSnapshot {
            market,
            as_of_date: date,
            sector_code,
            sector_name,
            change_pct,
            main_inflow,
            volume,
            currency,
        });
    }

    SnapshotSet::try_from_records(market, date, records).map_err(|err| corrupt(err.to_string()))
}

#[async_trait::async_trait]
impl SnapshotStore for PgSnapshotStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn save(
        &self,
        market: Market,
        date: NaiveDate,
        set: &SnapshotSet,
    ) -> Result<(), StoreError> {
        ensure_matches(market, date, set)?;

        let records: Vec<&SectorSnapshot> = set.iter().collect();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM sector_snapshots WHERE market = $1 AND as_of_date = $2")
            .persistent(false)
            .bind(market.as_str())
            .bind(date)
            .execute(&mut *tx)
            .await?;

        for chunk in records.chunks(INSERT_BATCH) {
            let mut volumes = Vec::with_capacity(chunk.len());
            for r in chunk {
                volumes.push(i64::try_from(r.volume).map_err(|_| {
                    StoreError::Encode(format!("volume {} out of range for {}", r.volume, r.sector_code))
                })?);
            }

            let mut qb = sqlx::QueryBuilder::new(
                "INSERT INTO sector_snapshots \
                 (market, as_of_date, sector_code, sector_name, change_pct, main_inflow, volume, currency) ",
            );
            qb.push_values(chunk.iter().zip(volumes), |mut b, (r, volume)| {
                b.push_bind(market.as_str())
                    .push_bind(date)
                    .push_bind(r.sector_code.as_str())
                    .push_bind(r.sector_name.as_str())
                    .push_bind(r.change_pct)
                    .push_bind(r.main_inflow)
                    .push_bind(volume)
                    .push_bind(r.currency.as_str());
            });
            qb.build().persistent(false).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::debug!(%market, as_of_date = %date, sectors = records.len(), "saved snapshot rows");
        Ok(())
    }

    async fn load(
        &self,
        market: Market,
        date: NaiveDate,
    ) -> Result<Option<SnapshotSet>, StoreError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT sector_code, sector_name, change_pct, main_inflow, volume, currency \
             FROM sector_snapshots WHERE market = $1 AND as_of_date = $2 ORDER BY sector_code",
        )
        .persistent(false)
        .bind(market.as_str())
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        // Rows are only ever written per whole day, so no rows means the day was never saved.
        if rows.is_empty() {
            return Ok(None);
        }
        decode_rows(market, date, rows).map(Some)
    }

    async fn list_dates(
        &self,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(
            "SELECT DISTINCT as_of_date FROM sector_snapshots \
             WHERE market = $1 AND as_of_date BETWEEN $2 AND $3 ORDER BY as_of_date",
        )
        .persistent(false)
        .bind(market.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(d,)| d).collect())
    }
}
