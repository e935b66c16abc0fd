use crate::analysis::AnalysisError;
use crate::domain::{RankingResult, RotationEvent, RotationSignal};

pub fn detect_rotation(
    today: &RankingResult,
    yesterday: &RankingResult,
) -> Result<RotationEvent, AnalysisError> {
    if today.top_n != yesterday.top_n {
        return Err(AnalysisError::RankingSizeMismatch {
            today: today.top_n,
            yesterday: yesterday.top_n,
        });
    }

    let t = today.codes();
    let y = yesterday.codes();

    Ok(RotationEvent {
        entered: t.difference(&y).map(|s| s.to_string()).collect(),
        exited: y.difference(&t).map(|s| s.to_string()).collect(),
    })
}

/// Attaches each entered sector's rank in the previous session's full (untruncated) ranking.
pub fn rotation_signals(
    event: &RotationEvent,
    previous_full: &RankingResult,
) -> Vec<RotationSignal> {
    event
        .entered
        .iter()
        .map(|code| RotationSignal {
            sector_code: code.clone(),
            previous_rank: previous_full.rank_of(code),
        })
        .collect()
}
