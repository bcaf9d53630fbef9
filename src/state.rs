//! State types threaded through the orchestrator.
//!
//! Every stage receives and returns explicit state values; nothing lives in
//! module-level globals. [`IterationState`] is owned by one attempt and
//! mutated only by its engine, [`CoordinatorState`] is owned by the
//! coordinator for the whole run. Both are persisted through the
//! checkpoint store after every transition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::HistoryManager;

/// Current on-disk state schema version.
pub const STATE_VERSION: u32 = 1;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a run.
///
/// # Example
///
/// ```
/// use converge::state::RunId;
///
/// let id = RunId::new();
/// assert!(id.as_str().starts_with("run-"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Create a new random run ID.
    #[must_use]
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("run-{}", &uuid[..12]))
    }

    /// Create a run ID from an existing string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one attempt within a run.
///
/// Ids are derived from the attempt's position so they sort in dispatch
/// order and stay stable across resumes.
///
/// ```
/// use converge::state::AttemptId;
///
/// assert_eq!(AttemptId::from_index(2).as_str(), "attempt-02");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(format!("attempt-{index:02}"))
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Task and Exchange Types
// ============================================================================

/// Immutable description of what the environment should converge to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Natural language target description.
    pub description: String,
    /// Reference files handed to the judge (images, sketches, specs).
    #[serde(default)]
    pub references: Vec<PathBuf>,
}

impl TaskSpec {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            references: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_references(mut self, references: Vec<PathBuf>) -> Self {
        self.references = references;
        self
    }
}

/// Reference to the environment's state after a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Opaque identifier reported by the gateway.
    pub id: String,
    /// Human-readable description of the current state.
    pub description: String,
}

/// Plan and action produced by the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub plan: String,
    pub action: String,
}

/// Outcome of applying one action through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the gateway accepted and executed the action.
    pub ok: bool,
    /// Captured output of the action.
    #[serde(default)]
    pub output: String,
    /// Rejection reason when `ok` is false.
    #[serde(default)]
    pub error: Option<String>,
}

/// Judge verdict on the current snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Score in `[0, 1]`.
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    /// Judge's own opinion that the target is met.
    #[serde(default)]
    pub complete: bool,
}

impl Feedback {
    /// Feedback recorded when the judge never produced a parseable verdict.
    #[must_use]
    pub fn unassessed(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            issues: vec![format!("unassessed: {}", reason.into())],
            suggestions: Vec::new(),
            complete: false,
        }
    }
}

// ============================================================================
// Attempt Status
// ============================================================================

/// Status of an attempt.
///
/// `Running` is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Converged,
    Stagnant,
    BudgetExhausted,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether an attempt in this status may be selected.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Converged | Self::BudgetExhausted | Self::Stagnant)
    }

    /// Tie-break rank used by the selector; lower is better.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Converged => 0,
            Self::BudgetExhausted => 1,
            Self::Stagnant => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
            Self::Running => 5,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Converged => "converged",
            Self::Stagnant => "stagnant",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Attempt Configuration and Result
// ============================================================================

/// Everything one attempt needs to run independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptConfig {
    pub attempt_id: AttemptId,
    /// Baseline reference the environment is reset to.
    pub baseline: String,
    /// Strategy label steering the proposer.
    pub strategy: String,
    pub max_iterations: u32,
    pub threshold: f64,
    /// Number of trailing scores inspected for stagnation (K).
    pub stagnation_window: usize,
    pub stagnation_epsilon: f64,
    /// Shared fast-retry budget for execution and format failures.
    pub max_fast_retries: u32,
    pub history_window: usize,
}

/// Terminal record of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub attempt_id: AttemptId,
    pub strategy: String,
    /// Score of the last semantic iteration, 0 if none was reached.
    pub final_score: f64,
    pub iterations_run: u32,
    pub status: AttemptStatus,
    pub artifact_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Reason for a failed or cancelled status.
    #[serde(default)]
    pub failure: Option<String>,
    /// Worker that ran the attempt, if it was ever dispatched.
    #[serde(default)]
    pub worker_id: Option<usize>,
    /// Set when the worker's environment must be restarted.
    #[serde(default)]
    pub restart_worker: bool,
}

impl AttemptResult {
    /// Result for an attempt that never reached a worker.
    #[must_use]
    pub fn not_dispatched(
        config: &AttemptConfig,
        status: AttemptStatus,
        artifact_path: PathBuf,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: config.attempt_id.clone(),
            strategy: config.strategy.clone(),
            final_score: 0.0,
            iterations_run: 0,
            status,
            artifact_path,
            started_at: now,
            finished_at: now,
            failure: Some(reason.into()),
            worker_id: None,
            restart_worker: false,
        }
    }
}

// ============================================================================
// Iteration State
// ============================================================================

/// Per-attempt mutable state.
///
/// Created from an [`AttemptConfig`] plus the verified baseline, mutated
/// only by the iteration engine driving that attempt. `iteration` counts
/// committed semantic iterations and never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationState {
    pub version: u32,
    pub run_id: RunId,
    pub attempt_id: AttemptId,
    pub iteration: u32,
    pub task: TaskSpec,
    pub config: AttemptConfig,
    /// Fingerprint returned by the verified baseline reset.
    pub baseline_fingerprint: Option<String>,
    pub snapshot: Option<Snapshot>,
    pub last_proposal: Option<Proposal>,
    pub last_result: Option<ExecutionResult>,
    pub last_feedback: Option<Feedback>,
    /// Fast retries spent in the current iteration.
    pub retry_count: u32,
    pub status: AttemptStatus,
    pub failure: Option<String>,
    pub history: HistoryManager,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IterationState {
    #[must_use]
    pub fn new(run_id: RunId, task: TaskSpec, config: AttemptConfig) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            run_id,
            attempt_id: config.attempt_id.clone(),
            iteration: 0,
            task,
            history: HistoryManager::new(config.history_window),
            config,
            baseline_fingerprint: None,
            snapshot: None,
            last_proposal: None,
            last_result: None,
            last_feedback: None,
            retry_count: 0,
            status: AttemptStatus::Running,
            failure: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Score of the last semantic iteration.
    #[must_use]
    pub fn current_score(&self) -> f64 {
        self.last_feedback.as_ref().map_or(0.0, |f| f.score)
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: AttemptStatus, failure: Option<String>) {
        self.status = status;
        self.failure = failure;
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn is_version_compatible(&self) -> bool {
        self.version == STATE_VERSION
    }
}

// ============================================================================
// Coordinator State
// ============================================================================

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Run-wide state, mutated only by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub version: u32,
    pub run_id: RunId,
    pub task: TaskSpec,
    pub worker_count: usize,
    pub configs: Vec<AttemptConfig>,
    pub pending: BTreeSet<AttemptId>,
    pub running: BTreeSet<AttemptId>,
    pub completed: BTreeMap<AttemptId, AttemptResult>,
    pub selected: Option<AttemptId>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CoordinatorState {
    #[must_use]
    pub fn new(
        run_id: RunId,
        task: TaskSpec,
        worker_count: usize,
        configs: Vec<AttemptConfig>,
    ) -> Self {
        let now = Utc::now();
        let pending = configs.iter().map(|c| c.attempt_id.clone()).collect();
        Self {
            version: STATE_VERSION,
            run_id,
            task,
            worker_count,
            configs,
            pending,
            running: BTreeSet::new(),
            completed: BTreeMap::new(),
            selected: None,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record that a worker picked up an attempt.
    pub fn mark_running(&mut self, attempt: &AttemptId) {
        self.pending.remove(attempt);
        self.running.insert(attempt.clone());
        self.updated_at = Utc::now();
    }

    /// Record a terminal result. Later results for the same id replace
    /// earlier ones, which only happens across resumes.
    pub fn mark_completed(&mut self, result: AttemptResult) {
        self.pending.remove(&result.attempt_id);
        self.running.remove(&result.attempt_id);
        self.completed.insert(result.attempt_id.clone(), result);
        self.updated_at = Utc::now();
    }

    /// Move every unfinished or cancelled attempt back to pending, for resume.
    ///
    /// Failed attempts keep their result.
    pub fn requeue_unfinished(&mut self) -> Vec<AttemptId> {
        let running: Vec<AttemptId> = std::mem::take(&mut self.running).into_iter().collect();
        self.pending.extend(running);
        let cancelled: Vec<AttemptId> = self
            .completed
            .iter()
            .filter(|(_, r)| r.status == AttemptStatus::Cancelled)
            .map(|(id, _)| id.clone())
            .collect();
        for id in cancelled {
            self.completed.remove(&id);
            self.pending.insert(id);
        }
        self.status = RunStatus::Running;
        self.selected = None;
        self.updated_at = Utc::now();
        self.pending.iter().cloned().collect()
    }

    #[must_use]
    pub fn config_for(&self, attempt: &AttemptId) -> Option<&AttemptConfig> {
        self.configs.iter().find(|c| &c.attempt_id == attempt)
    }

    /// True once every configured attempt has a terminal result.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.pending.is_empty()
            && self.running.is_empty()
            && self.completed.len() == self.configs.len()
    }

    #[must_use]
    pub fn is_version_compatible(&self) -> bool {
        self.version == STATE_VERSION
    }
}
