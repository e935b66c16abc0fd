pub mod analysis;
pub mod market;
pub mod snapshot;

pub use analysis::{
    AnalysisResult, RankedSector, RankingResult, RotationEvent, RotationSignal, RunMetadata,
    TrendDirection, TrendGap, TrendScore,
};
pub use market::{Currency, Market};
pub use snapshot::{SectorSnapshot, SnapshotError, SnapshotSet};
