pub mod a_share;
pub mod backfill;
pub mod eastmoney;
pub mod error;
pub mod estimate;
pub mod etf;
pub mod hk;
pub mod provider;
pub mod types;
pub mod us;
pub mod yahoo;

pub use backfill::{backfill, BackfillReport};
pub use error::{FetchError, InvalidRequest};
pub use estimate::EstimationStrategy;
pub use provider::{
    build_provider, check_history_days, FetchOutcome, MarketDataProvider, SectorFailure,
    MAX_HISTORY_DAYS,
};
