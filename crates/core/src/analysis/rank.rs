use std::cmp::Ordering;

use crate::domain::{RankedSector, RankingResult, SectorSnapshot, SnapshotSet};

/// Orders by inflow desc, then change_pct desc, then sector_code asc. Codes are unique within a
/// set, so the order is total.
pub fn compare_by_inflow(a: &SectorSnapshot, b: &SectorSnapshot) -> Ordering {
    b.main_inflow
        .total_cmp(&a.main_inflow)
        .then_with(|| b.change_pct.total_cmp(&a.change_pct))
        .then_with(|| a.sector_code.cmp(&b.sector_code))
}

pub fn rank_by_inflow(snapshots: &SnapshotSet, n: usize) -> RankingResult {
    let mut sorted: Vec<&SectorSnapshot> = snapshots.iter().collect();
    sorted.sort_by(|a, b| compare_by_inflow(a, b));

    let entries = sorted
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(idx, s)| RankedSector {
            rank: idx + 1,
            sector_code: s.sector_code.clone(),
            sector_name: s.sector_name.clone(),
            main_inflow: s.main_inflow,
            change_pct: s.change_pct,
        })
        .collect();

    RankingResult {
        market: snapshots.market(),
        as_of_date: snapshots.as_of_date(),
        top_n: n,
        entries,
    }
}
