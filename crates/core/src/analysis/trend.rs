use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::analysis::AnalysisError;
use crate::domain::{SectorSnapshot, TrendDirection, TrendScore};

// Weights for the magnitude of the score: how consistently flow held the prevailing direction,
// and how strongly it accelerated in that direction over the window.
const CONSISTENCY_WEIGHT: f64 = 60.0;
const MOMENTUM_WEIGHT: f64 = 40.0;

const DIRECTION_THRESHOLD: f64 = 20.0;

/// Scores the most recent `window_days` sessions present in `history` for `sector_code`.
///
/// `history` may contain any sectors and dates in any order; one value per date is used (the
/// last one seen for a duplicated date). Gaps between dates are not filled.
pub fn calculate_trend_strength(
    history: &[SectorSnapshot],
    sector_code: &str,
    window_days: usize,
) -> Result<TrendScore, AnalysisError> {
    if window_days == 0 {
        return Err(AnalysisError::InvalidWindow);
    }

    let by_date: BTreeMap<NaiveDate, f64> = history
        .iter()
        .filter(|s| s.sector_code == sector_code)
        .map(|s| (s.as_of_date, s.main_inflow))
        .collect();

    if by_date.len() < window_days {
        return Err(AnalysisError::InsufficientHistory {
            sector_code: sector_code.to_string(),
            required: window_days,
            available: by_date.len(),
        });
    }

    let window: Vec<f64> = by_date
        .values()
        .skip(by_date.len() - window_days)
        .copied()
        .collect();

    Ok(score_window(sector_code, &window))
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn score_window(sector_code: &str, window: &[f64]) -> TrendScore {
    let n = window.len();

    let positives = window.iter().filter(|v| sign(**v) > 0).count();
    let negatives = window.iter().filter(|v| sign(**v) < 0).count();
    let prevailing: i8 = match positives.cmp(&negatives) {
        std::cmp::Ordering::Greater => 1,
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
    };

    let consistency = window.iter().filter(|v| sign(**v) == prevailing).count() as f64 / n as f64;

    // Later half takes the extra day on odd windows.
    let (earlier, later) = window.split_at(n / 2);
    let momentum = if earlier.is_empty() {
        0.0
    } else {
        mean(later) - mean(earlier)
    };

    let scale = mean(&window.iter().map(|v| v.abs()).collect::<Vec<_>>());
    let momentum_norm = if scale > 0.0 {
        (momentum / scale).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    let score = if prevailing == 0 {
        0.0
    } else {
        let d = f64::from(prevailing);
        let magnitude = (CONSISTENCY_WEIGHT * consistency + MOMENTUM_WEIGHT * d * momentum_norm)
            .clamp(0.0, 100.0);
        d * magnitude
    };

    TrendScore {
        sector_code: sector_code.to_string(),
        window_days: n,
        score,
        direction: direction_for(score),
        avg_inflow: mean(window),
        consistency,
        momentum,
    }
}

pub fn direction_for(score: f64) -> TrendDirection {
    if score > DIRECTION_THRESHOLD {
        TrendDirection::Up
    } else if score < -DIRECTION_THRESHOLD {
        TrendDirection::Down
    } else {
        TrendDirection::Neutral
    }
}
