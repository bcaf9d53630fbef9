//! Deterministic best-of-N selection.
//!
//! Ranking keys, in order: final score descending, iterations run ascending,
//! status rank ascending (converged before budget exhausted before
//! stagnant), attempt id ascending. The last key makes the order total, so
//! the result never depends on the order results arrived in.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{ConvergeError, Result};
use crate::state::{AttemptId, AttemptResult, AttemptStatus};

/// One row of the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedAttempt {
    pub attempt_id: AttemptId,
    pub strategy: String,
    pub score: f64,
    pub iterations: u32,
    pub status: AttemptStatus,
}

impl From<&AttemptResult> for RankedAttempt {
    fn from(result: &AttemptResult) -> Self {
        Self {
            attempt_id: result.attempt_id.clone(),
            strategy: result.strategy.clone(),
            score: result.final_score,
            iterations: result.iterations_run,
            status: result.status,
        }
    }
}

/// Outcome of a successful selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub attempt_id: AttemptId,
    pub score: f64,
    pub status: AttemptStatus,
    /// Why the winner beat the runner-up.
    pub rationale: String,
    /// Selectable attempts, best first.
    pub ranking: Vec<RankedAttempt>,
}

/// Compare two results, best first.
#[must_use]
pub fn compare(a: &AttemptResult, b: &AttemptResult) -> Ordering {
    b.final_score
        .total_cmp(&a.final_score)
        .then_with(|| a.iterations_run.cmp(&b.iterations_run))
        .then_with(|| a.status.rank().cmp(&b.status.rank()))
        .then_with(|| a.attempt_id.cmp(&b.attempt_id))
}

/// Pick the best selectable attempt.
///
/// Failed, cancelled and unfinished attempts are never selected; when no
/// other attempt exists this returns [`ConvergeError::NoValidAttempts`].
///
/// # Example
///
/// ```rust,ignore
/// let selection = select_best(&results)?;
/// println!("{}: {}", selection.attempt_id, selection.rationale);
/// ```
pub fn select_best(results: &[AttemptResult]) -> Result<Selection> {
    let mut valid: Vec<&AttemptResult> = results
        .iter()
        .filter(|r| r.status.is_selectable())
        .collect();
    if valid.is_empty() {
        return Err(ConvergeError::NoValidAttempts {
            total: results.len(),
        });
    }
    valid.sort_by(|a, b| compare(a, b));

    let best = valid[0];
    let rationale = match valid.get(1) {
        None => format!(
            "{} is the only valid attempt ({} of {} attempts failed or were cancelled)",
            best.attempt_id,
            results.len() - 1,
            results.len()
        ),
        Some(runner_up) => format!(
            "{} {} {}",
            best.attempt_id,
            deciding_key(best, runner_up),
            runner_up.attempt_id
        ),
    };

    Ok(Selection {
        attempt_id: best.attempt_id.clone(),
        score: best.final_score,
        status: best.status,
        rationale,
        ranking: valid.into_iter().map(RankedAttempt::from).collect(),
    })
}

fn deciding_key(best: &AttemptResult, other: &AttemptResult) -> String {
    if best.final_score != other.final_score {
        format!(
            "scored {:.3}, higher than {:.3} from",
            best.final_score, other.final_score
        )
    } else if best.iterations_run != other.iterations_run {
        format!(
            "tied at {:.3} but needed {} iterations against {} for",
            best.final_score, best.iterations_run, other.iterations_run
        )
    } else if best.status != other.status {
        format!(
            "tied on score and iterations with a better status ({} over {}) than",
            best.status, other.status
        )
    } else {
        "tied on every key and sorts by id before".to_string()
    }
}
