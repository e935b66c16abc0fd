//! Pure functions over snapshot sets. Nothing here performs I/O or mutates its input.

pub mod rank;
pub mod rotation;
pub mod trend;

pub use rank::rank_by_inflow;
pub use rotation::{detect_rotation, rotation_signals};
pub use trend::calculate_trend_strength;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("insufficient history for {sector_code}: need {required} days, have {available}")]
    InsufficientHistory {
        sector_code: String,
        required: usize,
        available: usize,
    },
    #[error("rankings were computed with different n (today={today}, yesterday={yesterday})")]
    RankingSizeMismatch { today: usize, yesterday: usize },
    #[error("window_days must be >= 1")]
    InvalidWindow,
}
