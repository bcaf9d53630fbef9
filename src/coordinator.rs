//! Attempt coordinator: fans a task out to N independent attempts, collects
//! their results and selects the best one.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐  configs   ┌────────────┐
//!   run/resume ──>│ Coordinator  │──────────> │ WorkerPool │──> AttemptSupervisor × M
//!                 │              │<────────── │            │
//!                 └──────┬───────┘ PoolEvent  └────────────┘
//!                        │ every event: CoordinatorState checkpoint
//!                        v
//!                 select_best ──> summary.json
//! ```
//!
//! The coordinator is the only writer of [`CoordinatorState`]. It is
//! checkpointed whenever an attempt starts or finishes, so `resume` knows
//! exactly which attempts still need a worker.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, RunMeta};
use crate::capability::{Judge, Proposer};
use crate::checkpoint::CheckpointStore;
use crate::config::Settings;
use crate::error::{ConvergeError, Result};
use crate::gateway::EnvironmentLauncher;
use crate::pool::{PoolContext, PoolEvent, WorkerPool};
use crate::selector::{select_best, Selection};
use crate::state::{
    AttemptConfig, AttemptId, AttemptResult, AttemptStatus, CoordinatorState, RunId, RunStatus,
    TaskSpec,
};

/// Build one config per attempt, assigning strategies round-robin.
///
/// ```
/// use converge::config::Settings;
/// use converge::coordinator::build_attempt_configs;
///
/// let mut settings = Settings::default();
/// settings.run.attempts = 4;
/// settings.run.strategies = vec!["a".into(), "b".into()];
/// let labels: Vec<_> = build_attempt_configs(&settings)
///     .into_iter()
///     .map(|c| c.strategy)
///     .collect();
/// assert_eq!(labels, ["a", "b", "a", "b"]);
/// ```
#[must_use]
pub fn build_attempt_configs(settings: &Settings) -> Vec<AttemptConfig> {
    let run = &settings.run;
    (0..run.attempts)
        .map(|i| AttemptConfig {
            attempt_id: AttemptId::from_index(i + 1),
            baseline: run.baseline.clone(),
            strategy: run.strategies[i % run.strategies.len()].clone(),
            max_iterations: run.max_iterations,
            threshold: run.threshold,
            stagnation_window: run.stagnation_window,
            stagnation_epsilon: run.stagnation_epsilon,
            max_fast_retries: run.max_fast_retries,
            history_window: run.history_window,
        })
        .collect()
}

/// Contents of `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub task: TaskSpec,
    pub status: RunStatus,
    pub threshold: f64,
    pub selection: Option<Selection>,
    /// Why nothing was selected, if so.
    pub selection_error: Option<String>,
    /// Every attempt, in id order.
    pub attempts: Vec<AttemptResult>,
    /// Failed or cancelled attempts with their reason.
    pub failures: Vec<(AttemptId, String)>,
}

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: CoordinatorState,
    pub selection: Option<Selection>,
    pub threshold: f64,
    pub summary_path: PathBuf,
}

impl RunOutcome {
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.state.run_id
    }

    /// The selection, if the run succeeded.
    ///
    /// # Errors
    ///
    /// [`ConvergeError::Cancelled`] if the run was interrupted,
    /// [`ConvergeError::NoValidAttempts`] if nothing could be selected and
    /// [`ConvergeError::BelowThreshold`] if the best attempt fell short.
    pub fn verdict(&self) -> Result<&Selection> {
        if self.state.status == RunStatus::Cancelled {
            return Err(ConvergeError::Cancelled {
                run_id: self.state.run_id.to_string(),
            });
        }
        let selection = self.selection.as_ref().ok_or(ConvergeError::NoValidAttempts {
            total: self.state.completed.len(),
        })?;
        if selection.score < self.threshold {
            return Err(ConvergeError::BelowThreshold {
                attempt: selection.attempt_id.to_string(),
                score: selection.score,
                threshold: self.threshold,
            });
        }
        Ok(selection)
    }
}

/// Runs and resumes convergence runs.
pub struct Coordinator {
    settings: Settings,
    proposer: Arc<dyn Proposer>,
    judge: Arc<dyn Judge>,
    launcher: Arc<dyn EnvironmentLauncher>,
    artifacts: ArtifactStore,
    checkpoints: CheckpointStore,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        settings: Settings,
        proposer: Arc<dyn Proposer>,
        judge: Arc<dyn Judge>,
        launcher: Arc<dyn EnvironmentLauncher>,
    ) -> Self {
        let artifacts = ArtifactStore::new(&settings.run.artifacts_dir);
        let checkpoints = CheckpointStore::new(&settings.run.artifacts_dir);
        Self {
            settings,
            proposer,
            judge,
            launcher,
            artifacts,
            checkpoints,
        }
    }

    /// Build providers and launcher from validated settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let proposer = settings.build_proposer()?;
        let judge = settings.build_judge(&settings.run.artifacts_dir.join(".scratch"))?;
        let launcher = settings.build_launcher()?;
        Ok(Self::new(settings, proposer, judge, launcher))
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start a new run of `task`.
    pub async fn run(&self, task: TaskSpec, cancel: CancellationToken) -> Result<RunOutcome> {
        let run_id = RunId::new();
        self.artifacts.write_run_meta(&RunMeta {
            run_id: run_id.clone(),
            task: task.clone(),
            settings: self.settings.clone(),
            created_at: Utc::now(),
        })?;

        let configs = build_attempt_configs(&self.settings);
        let mut state = CoordinatorState::new(run_id, task, self.settings.effective_workers(), configs);
        self.checkpoints.save(&state)?;

        info!(
            run_id = %state.run_id,
            attempts = state.configs.len(),
            workers = state.worker_count,
            "Run started"
        );
        self.execute(&mut state, cancel).await
    }

    /// Continue an interrupted run.
    ///
    /// Completed results are kept; running, pending and cancelled attempts
    /// are dispatched again and continue from their own checkpoints.
    pub async fn resume(&self, run_id: &RunId, cancel: CancellationToken) -> Result<RunOutcome> {
        let mut state = load_state(&self.checkpoints, run_id)?;
        let requeued = state.requeue_unfinished();
        info!(run_id = %run_id, requeued = requeued.len(), "Resuming run");
        self.checkpoints.save(&state)?;
        self.execute(&mut state, cancel).await
    }

    async fn execute(&self, state: &mut CoordinatorState, cancel: CancellationToken) -> Result<RunOutcome> {
        let queue: Vec<AttemptConfig> = state
            .pending
            .iter()
            .filter_map(|id| state.config_for(id).cloned())
            .collect();

        if !queue.is_empty() {
            let context = PoolContext::new(
                state.run_id.clone(),
                state.task.clone(),
                self.launcher.clone(),
                self.proposer.clone(),
                self.judge.clone(),
                self.artifacts.clone(),
            )
            .with_timeouts(
                self.settings.engine_timeouts(),
                self.settings.reset_timeout(),
                self.settings.readiness_timeout(),
            );
            let pool = WorkerPool::new(context, state.worker_count);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let checkpoints = &self.checkpoints;
            let (report, ()) = tokio::join!(pool.run(queue, tx, cancel.clone()), async {
                while let Some(event) = rx.recv().await {
                    apply_event(state, event);
                    if let Err(e) = checkpoints.save(&*state) {
                        warn!(run_id = %state.run_id, "Failed to save coordinator checkpoint: {}", e);
                    }
                }
            });

            let reason = if cancel.is_cancelled() {
                (AttemptStatus::Cancelled, "cancelled before dispatch".to_string())
            } else {
                let lost: Vec<String> = report
                    .lost_workers
                    .iter()
                    .map(|(w, e)| format!("worker {w}: {e}"))
                    .collect();
                (
                    AttemptStatus::Failed,
                    format!("no worker available ({})", lost.join("; ")),
                )
            };
            for config in report.undispatched {
                self.record_undispatched(state, &config, reason.0, &reason.1);
            }
            let orphaned: Vec<AttemptId> = state.running.iter().cloned().collect();
            for id in orphaned {
                if let Some(config) = state.config_for(&id).cloned() {
                    self.record_undispatched(
                        state,
                        &config,
                        AttemptStatus::Failed,
                        "worker task ended without a result",
                    );
                }
            }
        }

        self.finalize(state, cancel.is_cancelled())
    }

    fn record_undispatched(
        &self,
        state: &mut CoordinatorState,
        config: &AttemptConfig,
        status: AttemptStatus,
        reason: &str,
    ) {
        let artifacts = self.artifacts.attempt(&state.run_id, &config.attempt_id);
        if status == AttemptStatus::Failed {
            if let Err(e) = artifacts.append_error(0, reason) {
                warn!("Failed to record error in artifact trail: {}", e);
            }
        }
        let result =
            AttemptResult::not_dispatched(config, status, artifacts.dir().to_path_buf(), reason);
        state.mark_completed(result);
    }

    /// Select, write the summary and record the final status.
    fn finalize(&self, state: &mut CoordinatorState, cancelled: bool) -> Result<RunOutcome> {
        if !state.all_completed() {
            warn!(
                run_id = %state.run_id,
                pending = state.pending.len(),
                running = state.running.len(),
                "Finalizing with attempts that never reported a result"
            );
        }
        let results: Vec<AttemptResult> = state.completed.values().cloned().collect();
        let selected = select_best(&results);

        state.status = match (&selected, cancelled) {
            (_, true) => RunStatus::Cancelled,
            (Ok(_), false) => RunStatus::Completed,
            (Err(_), false) => RunStatus::Failed,
        };
        state.selected = selected.as_ref().ok().map(|s| s.attempt_id.clone());
        state.updated_at = Utc::now();
        self.checkpoints.save(&*state)?;

        let summary = RunSummary {
            run_id: state.run_id.clone(),
            task: state.task.clone(),
            status: state.status,
            threshold: self.settings.run.threshold,
            selection: selected.as_ref().ok().cloned(),
            selection_error: selected.as_ref().err().map(ToString::to_string),
            failures: results
                .iter()
                .filter(|r| !r.status.is_selectable())
                .map(|r| {
                    (
                        r.attempt_id.clone(),
                        r.failure.clone().unwrap_or_else(|| r.status.to_string()),
                    )
                })
                .collect(),
            attempts: results,
        };
        let summary_path = self.artifacts.write_summary(&state.run_id, &summary)?;

        match &summary.selection {
            Some(selection) => info!(
                run_id = %state.run_id,
                selected = %selection.attempt_id,
                score = selection.score,
                "Run finished: {}", selection.rationale
            ),
            None => warn!(run_id = %state.run_id, status = ?state.status, "Run finished without a valid attempt"),
        }

        Ok(RunOutcome {
            state: state.clone(),
            selection: summary.selection,
            threshold: self.settings.run.threshold,
            summary_path,
        })
    }
}

fn apply_event(state: &mut CoordinatorState, event: PoolEvent) {
    match event {
        PoolEvent::Started { worker, attempt } => {
            info!(run_id = %state.run_id, %attempt, worker, "Attempt dispatched");
            state.mark_running(&attempt);
        }
        PoolEvent::Finished(result) => state.mark_completed(result),
        PoolEvent::WorkerLost { worker, error } => {
            warn!(run_id = %state.run_id, worker, "Worker left the pool: {}", error);
        }
    }
}

fn load_state(checkpoints: &CheckpointStore, run_id: &RunId) -> Result<CoordinatorState> {
    checkpoints
        .load_coordinator(run_id)?
        .ok_or_else(|| ConvergeError::RunNotFound {
            run_id: run_id.to_string(),
        })
}

/// Current coordinator state of a run, for `converge status`.
pub fn run_status(artifacts_dir: &std::path::Path, run_id: &RunId) -> Result<CoordinatorState> {
    load_state(&CheckpointStore::new(artifacts_dir), run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_task, MockGateway, MockLauncher, ScriptedJudge, ScriptedProposer};
    use tempfile::TempDir;

    fn settings(temp: &TempDir, attempts: usize, workers: usize) -> Settings {
        let mut settings = Settings::default();
        settings.run.attempts = attempts;
        settings.run.workers = workers;
        settings.run.max_iterations = 3;
        settings.run.artifacts_dir = temp.path().to_path_buf();
        settings.timeouts.readiness_secs = 1;
        settings
    }

    fn coordinator(
        settings: Settings,
        proposer: ScriptedProposer,
        judge: ScriptedJudge,
        launcher: MockLauncher,
    ) -> Coordinator {
        Coordinator::new(settings, Arc::new(proposer), Arc::new(judge), Arc::new(launcher))
    }

    #[test]
    fn test_round_robin_strategies() {
        let temp = TempDir::new().unwrap();
        let configs = build_attempt_configs(&settings(&temp, 5, 2));
        let labels: Vec<&str> = configs.iter().map(|c| c.strategy.as_str()).collect();
        assert_eq!(
            labels,
            ["direct", "incremental", "exploratory", "direct", "incremental"]
        );
        assert_eq!(configs[4].attempt_id.as_str(), "attempt-05");
    }

    #[tokio::test]
    async fn test_run_selects_best_and_writes_summary() {
        let temp = TempDir::new().unwrap();
        let judge = ScriptedJudge::new()
            .with_rule("direct-move", 0.60)
            .with_rule("incremental-move", 0.88)
            .with_rule("exploratory-move", 0.70);
        let proposer = ScriptedProposer::new()
            .with_action_for_strategy("direct", "direct-move")
            .with_action_for_strategy("incremental", "incremental-move")
            .with_action_for_strategy("exploratory", "exploratory-move");
        let coordinator = coordinator(settings(&temp, 3, 3), proposer, judge, MockLauncher::new());

        let outcome = coordinator
            .run(sample_task(), CancellationToken::new())
            .await
            .unwrap();
        let selection = outcome.verdict().unwrap();
        assert_eq!(selection.attempt_id, AttemptId::from_index(2));
        assert_eq!(outcome.state.status, RunStatus::Completed);
        assert!(outcome.summary_path.exists());

        let summary: RunSummary =
            serde_json::from_str(&std::fs::read_to_string(&outcome.summary_path).unwrap()).unwrap();
        assert_eq!(summary.attempts.len(), 3);
        assert_eq!(
            summary.selection.map(|s| s.attempt_id),
            Some(AttemptId::from_index(2))
        );

        let status = run_status(temp.path(), outcome.run_id()).unwrap();
        assert_eq!(status.selected, Some(AttemptId::from_index(2)));
    }

    #[tokio::test]
    async fn test_below_threshold_is_reported() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(
            settings(&temp, 2, 2),
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.3, 0.5, 0.6]),
            MockLauncher::new(),
        );
        let outcome = coordinator
            .run(sample_task(), CancellationToken::new())
            .await
            .unwrap();
        let err = outcome.verdict().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_all_attempts_failing_is_no_valid_attempts() {
        let temp = TempDir::new().unwrap();
        let launcher = MockLauncher::with_factory(|_| MockGateway::new().with_unreachable_after(0));
        let coordinator = coordinator(
            settings(&temp, 2, 1),
            ScriptedProposer::new(),
            ScriptedJudge::new(),
            launcher,
        );
        let outcome = coordinator
            .run(sample_task(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.state.status, RunStatus::Failed);
        assert!(matches!(
            outcome.verdict(),
            Err(ConvergeError::NoValidAttempts { total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run_records_pending_as_cancelled() {
        let temp = TempDir::new().unwrap();
        let proposer = ScriptedProposer::new();
        let coordinator = coordinator(
            settings(&temp, 3, 1),
            proposer.clone(),
            ScriptedJudge::new(),
            MockLauncher::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = coordinator.run(sample_task(), cancel).await.unwrap();

        assert_eq!(outcome.state.status, RunStatus::Cancelled);
        assert!(outcome
            .state
            .completed
            .values()
            .all(|r| r.status == AttemptStatus::Cancelled));
        assert_eq!(proposer.call_count(), 0);
        assert_eq!(outcome.verdict().unwrap_err().exit_code(), 130);
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(
            settings(&temp, 1, 1),
            ScriptedProposer::new(),
            ScriptedJudge::new(),
            MockLauncher::new(),
        );
        let err = coordinator
            .resume(&RunId::from_string("run-missing"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergeError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resume_after_cancel_completes_run() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let first = coordinator(
            settings(&temp, 2, 1),
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.9]),
            MockLauncher::new(),
        )
        .run(sample_task(), cancel)
        .await
        .unwrap();
        let run_id = first.run_id().clone();

        let proposer = ScriptedProposer::new();
        let resumed = coordinator(
            settings(&temp, 2, 1),
            proposer.clone(),
            ScriptedJudge::new().with_scores(&[0.9]),
            MockLauncher::new(),
        )
        .resume(&run_id, CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(resumed.state.status, RunStatus::Completed);
        assert_eq!(resumed.state.completed.len(), 2);
        assert!(resumed.verdict().is_ok());
        assert_eq!(proposer.call_count(), 2);
    }
}
