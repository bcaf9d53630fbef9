//! Pre-built test data for orchestration tests.

use crate::state::{AttemptConfig, AttemptId, TaskSpec};

/// Attempt configuration with the usual defaults.
///
/// Threshold 0.85, stagnation window 3 with epsilon 0.02, three fast
/// retries and a five-entry history window.
#[must_use]
pub fn attempt_config(index: usize, strategy: &str, max_iterations: u32) -> AttemptConfig {
    AttemptConfig {
        attempt_id: AttemptId::from_index(index),
        baseline: "default".to_string(),
        strategy: strategy.to_string(),
        max_iterations,
        threshold: 0.85,
        stagnation_window: 3,
        stagnation_epsilon: 0.02,
        max_fast_retries: 3,
        history_window: 5,
    }
}

/// A task with no reference files.
#[must_use]
pub fn sample_task() -> TaskSpec {
    TaskSpec::new("a red cube on a wooden table")
}
