use chrono::NaiveDate;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::domain::{Market, SnapshotSet};
use crate::storage::{ensure_matches, SnapshotStore, StoreError};

const DATE_FORMAT: &str = "%Y%m%d";

/// One JSON document per (market, date) under `<root>/<market>/<YYYYMMDD>.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn market_dir(&self, market: Market) -> PathBuf {
        self.root.join(market.as_str())
    }

    fn path_for(&self, market: Market, date: NaiveDate) -> PathBuf {
        self.market_dir(market)
            .join(format!("{}.json", date.format(DATE_FORMAT)))
    }
}

fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(".json")?;
    NaiveDate::parse_from_str(stem, DATE_FORMAT).ok()
}

#[async_trait::async_trait]
impl SnapshotStore for FileSnapshotStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn save(
        &self,
        market: Market,
        date: NaiveDate,
        set: &SnapshotSet,
    ) -> Result<(), StoreError> {
        ensure_matches(market, date, set)?;

        let dir = self.market_dir(market);
        tokio::fs::create_dir_all(&dir).await?;

        let body =
            serde_json::to_vec_pretty(set).map_err(|err| StoreError::Encode(err.to_string()))?;
        let path = self.path_for(market, date);
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            date.format(DATE_FORMAT),
            uuid::Uuid::new_v4()
        ));

        tokio::fs::write(&tmp, &body).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }

        tracing::debug!(%market, as_of_date = %date, sectors = set.len(), path = %path.display(), "saved snapshot");
        Ok(())
    }

    async fn load(
        &self,
        market: Market,
        date: NaiveDate,
    ) -> Result<Option<SnapshotSet>, StoreError> {
        let path = self.path_for(market, date);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let set: SnapshotSet =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corruption {
                market,
                date,
                detail: err.to_string(),
            })?;
        if set.market() != market || set.as_of_date() != date {
            return Err(StoreError::Corruption {
                market,
                date,
                detail: format!(
                    "file holds {} {} instead",
                    set.market(),
                    set.as_of_date()
                ),
            });
        }
        Ok(Some(set))
    }

    async fn list_dates(
        &self,
        market: Market,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError> {
        let mut entries = match tokio::fs::read_dir(self.market_dir(market)).await {
            Ok(e) => e,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut dates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(date_from_file_name) else {
                continue;
            };
            if date >= start && date <= end {
                dates.push(date);
            }
        }
        dates.sort_unstable();
        Ok(dates)
    }
}
