//! Stop conditions evaluated after every semantic iteration.
//!
//! Priority when several hold at once: failed, converged, budget exhausted,
//! stagnant.

use crate::state::{AttemptStatus, IterationState};

/// Smallest stagnation window that is meaningful.
pub const MIN_STAGNATION_WINDOW: usize = 3;

/// Inputs to the stop decision, decoupled from [`IterationState`] for testing.
#[derive(Debug, Clone, PartialEq)]
pub struct StopInputs<'a> {
    /// An infrastructure failure exhausted the attempt.
    pub failed: bool,
    pub score: f64,
    pub threshold: f64,
    pub iteration: u32,
    pub max_iterations: u32,
    /// Trailing scores, oldest first.
    pub scores: &'a [f64],
    pub stagnation_window: usize,
    pub stagnation_epsilon: f64,
}

/// True when the last `k` scores exist and their range is below `epsilon`.
///
/// ```
/// use converge::engine::stop::is_stagnant;
///
/// assert!(is_stagnant(&[0.40, 0.40, 0.41], 3, 0.02));
/// assert!(!is_stagnant(&[0.40, 0.50, 0.60], 3, 0.02));
/// ```
#[must_use]
pub fn is_stagnant(scores: &[f64], k: usize, epsilon: f64) -> bool {
    if k < MIN_STAGNATION_WINDOW || scores.len() < k {
        return false;
    }
    let tail = &scores[scores.len() - k..];
    let (min, max) = tail
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(*s), hi.max(*s))
        });
    max - min < epsilon
}

/// Terminal status implied by `inputs`, if any.
#[must_use]
pub fn evaluate(inputs: &StopInputs<'_>) -> Option<AttemptStatus> {
    if inputs.failed {
        Some(AttemptStatus::Failed)
    } else if inputs.score >= inputs.threshold {
        Some(AttemptStatus::Converged)
    } else if inputs.iteration >= inputs.max_iterations {
        Some(AttemptStatus::BudgetExhausted)
    } else if is_stagnant(
        inputs.scores,
        inputs.stagnation_window,
        inputs.stagnation_epsilon,
    ) {
        Some(AttemptStatus::Stagnant)
    } else {
        None
    }
}

/// Evaluate the stop conditions for a committed iteration state.
#[must_use]
pub fn evaluate_state(state: &IterationState) -> Option<AttemptStatus> {
    let k = state.config.stagnation_window;
    let scores = state.history.recent_scores(k).unwrap_or_default();
    evaluate(&StopInputs {
        failed: state.status == AttemptStatus::Failed,
        score: state.current_score(),
        threshold: state.config.threshold,
        iteration: state.iteration,
        max_iterations: state.config.max_iterations,
        scores: &scores,
        stagnation_window: k,
        stagnation_epsilon: state.config.stagnation_epsilon,
    })
}
