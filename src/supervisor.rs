//! Attempt supervisor: drives one attempt on one worker from a verified
//! baseline to a terminal status.
//!
//! # Lifecycle
//!
//! ```text
//! load checkpoint ─> reset ─> verify fingerprint ─> replay (resume only)
//!                                                       │
//!        ┌──────────────────────────────────────────────┘
//!        v
//!   run_iteration ─> write artifacts ─> save checkpoint ─> terminal? ─> AttemptResult
//!        ^                                                    │ no
//!        └────────────────────────────────────────────────────┘
//! ```
//!
//! The checkpoint for iteration `i` is written only after its environment
//! mutation and its artifacts are on disk, so a resumed attempt always
//! continues at "propose the next action".

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, AttemptArtifacts};
use crate::capability::{Judge, Proposer};
use crate::checkpoint::CheckpointStore;
use crate::engine::{guarded, EngineTimeouts, Guarded, IterationEngine};
use crate::error::{ConvergeError, Result};
use crate::gateway::{EnvironmentGateway, GatewayError, Views};
use crate::state::{AttemptConfig, AttemptResult, AttemptStatus, IterationState, RunId, TaskSpec};

/// Default deadline for a reset.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Baseline Ledger
// ============================================================================

/// Fingerprints observed per baseline, shared by every worker of a run.
///
/// The first verified reset of a baseline fixes its fingerprint; every
/// later reset of that baseline, on any worker, must reproduce it.
#[derive(Debug, Clone, Default)]
pub struct BaselineLedger {
    seen: Arc<Mutex<BTreeMap<String, String>>>,
}

impl BaselineLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or check `fingerprint` for `baseline`. Returns the expected
    /// fingerprint on mismatch.
    pub fn verify(&self, baseline: &str, fingerprint: &str) -> std::result::Result<(), String> {
        let mut seen = self
            .seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match seen.get(baseline) {
            Some(expected) if expected != fingerprint => Err(expected.clone()),
            Some(_) => Ok(()),
            None => {
                seen.insert(baseline.to_string(), fingerprint.to_string());
                Ok(())
            }
        }
    }

    /// Fingerprint recorded for `baseline`, if any.
    #[must_use]
    pub fn get(&self, baseline: &str) -> Option<String> {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(baseline)
            .cloned()
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Runs attempts against one worker's environment, one at a time.
pub struct AttemptSupervisor {
    worker_id: usize,
    engine: IterationEngine,
    gateway: Arc<dyn EnvironmentGateway>,
    checkpoints: CheckpointStore,
    artifacts: ArtifactStore,
    ledger: BaselineLedger,
    reset_timeout: Duration,
    apply_timeout: Duration,
    capture_timeout: Duration,
}

impl AttemptSupervisor {
    #[must_use]
    pub fn new(
        worker_id: usize,
        proposer: Arc<dyn Proposer>,
        judge: Arc<dyn Judge>,
        gateway: Arc<dyn EnvironmentGateway>,
        checkpoints: CheckpointStore,
        artifacts: ArtifactStore,
    ) -> Self {
        let engine = IterationEngine::new(proposer, judge, gateway.clone());
        Self {
            worker_id,
            engine,
            gateway,
            checkpoints,
            artifacts,
            ledger: BaselineLedger::new(),
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            apply_timeout: EngineTimeouts::default().apply,
            capture_timeout: EngineTimeouts::default().capture,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: EngineTimeouts, reset: Duration) -> Self {
        self.engine = self.engine.with_timeouts(timeouts);
        self.apply_timeout = timeouts.apply;
        self.capture_timeout = timeouts.capture;
        self.reset_timeout = reset;
        self
    }

    /// Share a baseline ledger with the other workers of the run.
    #[must_use]
    pub fn with_ledger(mut self, ledger: BaselineLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Drive `config` to a terminal status and return its result.
    ///
    /// Never fails: every error ends up in the returned result and in the
    /// attempt's `errors.jsonl`.
    pub async fn run_attempt(
        &self,
        run_id: &RunId,
        task: &TaskSpec,
        config: &AttemptConfig,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let started_at = Utc::now();
        let artifacts = self.artifacts.attempt(run_id, &config.attempt_id);
        let mut state = self.initial_state(run_id, task, config, &artifacts);
        let mut restart_worker = false;

        info!(
            attempt = %config.attempt_id,
            worker = self.worker_id,
            strategy = %config.strategy,
            resume_from = state.iteration,
            "Starting attempt"
        );

        if let Err(e) = self
            .drive(&mut state, &artifacts, cancel, &mut restart_worker)
            .await
        {
            warn!(attempt = %config.attempt_id, "Attempt failed: {}", e);
            restart_worker |= e.is_infrastructure();
            state.finish(AttemptStatus::Failed, Some(e.to_string()));
            self.record_error(&artifacts, state.iteration, &e.to_string());
            self.save_checkpoint(&state);
        }

        let result = AttemptResult {
            attempt_id: config.attempt_id.clone(),
            strategy: config.strategy.clone(),
            final_score: state.current_score(),
            iterations_run: state.iteration,
            status: state.status,
            artifact_path: artifacts.dir().to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            failure: state.failure.clone(),
            worker_id: Some(self.worker_id),
            restart_worker,
        };
        if let Err(e) = artifacts.write_result(&result) {
            warn!(attempt = %config.attempt_id, "Failed to write result: {}", e);
        }

        info!(
            attempt = %result.attempt_id,
            status = %result.status,
            score = result.final_score,
            iterations = result.iterations_run,
            "Attempt finished"
        );
        result
    }

    /// Checkpointed state to continue from, or a fresh one.
    ///
    /// Every reason for discarding an existing checkpoint is written to the
    /// attempt's error trail before restarting from the baseline.
    fn initial_state(
        &self,
        run_id: &RunId,
        task: &TaskSpec,
        config: &AttemptConfig,
        artifacts: &AttemptArtifacts,
    ) -> IterationState {
        let fresh = || IterationState::new(run_id.clone(), task.clone(), config.clone());
        let existed = self.checkpoints.exists(run_id, config.attempt_id.as_str());
        let discarded = match self.checkpoints.load_attempt(run_id, &config.attempt_id) {
            Ok(Some(state)) if state.config == *config => {
                if state.status.is_terminal() && state.status != AttemptStatus::Cancelled {
                    debug!(attempt = %config.attempt_id, "Checkpoint already terminal");
                }
                return state;
            }
            Ok(Some(state)) => format!(
                "checkpoint at iteration {} belongs to a different configuration",
                state.iteration
            ),
            Ok(None) if existed => "checkpoint unreadable or incompatible, set aside".to_string(),
            Ok(None) => return fresh(),
            Err(e) => format!("failed to read checkpoint: {e}"),
        };

        warn!(
            attempt = %config.attempt_id,
            "{}, restarting from baseline", discarded
        );
        self.record_error(
            artifacts,
            0,
            &format!("{discarded}; restarted from baseline"),
        );
        fresh()
    }

    async fn drive(
        &self,
        state: &mut IterationState,
        artifacts: &AttemptArtifacts,
        cancel: &CancellationToken,
        restart_worker: &mut bool,
    ) -> Result<()> {
        if state.status.is_terminal() && state.status != AttemptStatus::Cancelled {
            return Ok(());
        }
        state.status = AttemptStatus::Running;
        state.failure = None;

        artifacts.write_config(&state.config)?;
        let Some(fingerprint) = self.reset_and_verify(state, cancel).await? else {
            state.finish(AttemptStatus::Cancelled, Some("cancelled".to_string()));
            self.save_checkpoint(state);
            return Ok(());
        };

        if state.iteration > 0 && !self.replay(state, artifacts, cancel).await? {
            state.finish(AttemptStatus::Cancelled, Some("cancelled".to_string()));
            self.save_checkpoint(state);
            return Ok(());
        }
        // Fresh start, or replay fell back to the baseline
        if state.iteration == 0 {
            let views = self.capture_baseline(cancel).await;
            artifacts.write_baseline(&fingerprint, &views)?;
        }
        state.baseline_fingerprint = Some(fingerprint);
        self.checkpoints.save(state)?;

        while !state.status.is_terminal() {
            if cancel.is_cancelled() {
                state.finish(AttemptStatus::Cancelled, Some("cancelled".to_string()));
                self.checkpoints.save(state)?;
                break;
            }

            let report = self.engine.run_iteration(state, cancel).await;
            if report.proposal.is_some() || report.committed {
                artifacts.write_iteration(&report)?;
            }
            for retry in &report.retries {
                debug!(
                    attempt = %state.attempt_id,
                    iteration = report.iteration,
                    "{}: {}",
                    retry.class.code(),
                    retry.message
                );
            }
            if let Some(error) = &report.error {
                if state.status == AttemptStatus::Failed {
                    self.record_error(artifacts, report.iteration, error);
                }
            }
            *restart_worker |= report.restart_worker;
            self.checkpoints.save(state)?;
        }
        Ok(())
    }

    /// Reset to the baseline and verify it. `None` means cancelled.
    async fn reset_and_verify(
        &self,
        state: &IterationState,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let baseline = &state.config.baseline;
        let endpoint = self.gateway.endpoint().to_string();
        let outcome = match guarded(cancel, self.reset_timeout, self.gateway.reset(baseline)).await {
            Guarded::Cancelled => return Ok(None),
            Guarded::TimedOut => {
                return Err(GatewayError::Timeout {
                    endpoint,
                    operation: "reset".to_string(),
                    secs: self.reset_timeout.as_secs(),
                }
                .into())
            }
            Guarded::Done(outcome) => outcome?,
        };

        if !outcome.ok || outcome.fingerprint.is_empty() {
            let reason = outcome
                .error
                .unwrap_or_else(|| "reset returned no fingerprint".to_string());
            return Err(GatewayError::protocol(endpoint, format!("reset failed: {reason}")).into());
        }

        let expected = state
            .baseline_fingerprint
            .clone()
            .or_else(|| self.ledger.get(baseline));
        if let Some(expected) = expected {
            if expected != outcome.fingerprint {
                return Err(ConvergeError::BaselineMismatch {
                    attempt: state.attempt_id.to_string(),
                    expected,
                    actual: outcome.fingerprint,
                });
            }
        }
        if let Err(expected) = self.ledger.verify(baseline, &outcome.fingerprint) {
            return Err(ConvergeError::BaselineMismatch {
                attempt: state.attempt_id.to_string(),
                expected,
                actual: outcome.fingerprint,
            });
        }

        debug!(attempt = %state.attempt_id, fingerprint = %outcome.fingerprint, "Baseline verified");
        Ok(Some(outcome.fingerprint))
    }

    /// Views of the freshly reset baseline; best effort.
    async fn capture_baseline(&self, cancel: &CancellationToken) -> Views {
        match guarded(cancel, self.capture_timeout, self.gateway.capture()).await {
            Guarded::Done(Ok(views)) => views,
            Guarded::Done(Err(e)) => {
                warn!("Baseline capture failed: {}", e);
                Views::new()
            }
            Guarded::TimedOut | Guarded::Cancelled => Views::new(),
        }
    }

    /// Re-apply every action of the committed iterations. `false` means
    /// cancelled.
    async fn replay(
        &self,
        state: &mut IterationState,
        artifacts: &AttemptArtifacts,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let actions = match artifacts.applied_actions(state.iteration) {
            Ok(actions) => actions,
            Err(e) => {
                warn!(
                    attempt = %state.attempt_id,
                    "Cannot replay ({}), restarting from baseline", e
                );
                self.record_error(
                    artifacts,
                    state.iteration,
                    &format!("cannot replay committed actions: {e}; restarted from baseline"),
                );
                *state = IterationState::new(
                    state.run_id.clone(),
                    state.task.clone(),
                    state.config.clone(),
                );
                return Ok(true);
            }
        };

        info!(
            attempt = %state.attempt_id,
            iterations = state.iteration,
            actions = actions.len(),
            "Replaying committed actions"
        );
        let endpoint = self.gateway.endpoint().to_string();
        let limit = self.apply_timeout;
        for action in &actions {
            match guarded(cancel, limit, self.gateway.apply(action)).await {
                Guarded::Cancelled => return Ok(false),
                Guarded::TimedOut => {
                    return Err(GatewayError::Timeout {
                        endpoint,
                        operation: "replay".to_string(),
                        secs: limit.as_secs(),
                    }
                    .into())
                }
                Guarded::Done(outcome) => {
                    state.snapshot = Some(outcome?.snapshot);
                }
            }
        }
        Ok(true)
    }

    fn save_checkpoint(&self, state: &IterationState) {
        if let Err(e) = self.checkpoints.save(state) {
            warn!(attempt = %state.attempt_id, "Failed to save checkpoint: {}", e);
        }
    }

    fn record_error(&self, artifacts: &AttemptArtifacts, iteration: u32, message: &str) {
        if let Err(e) = artifacts.append_error(iteration, message) {
            warn!("Failed to record error in artifact trail: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AttemptId;
    use crate::testing::{attempt_config, sample_task, MockGateway, ScriptedJudge, ScriptedProposer};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        checkpoints: CheckpointStore,
        artifacts: ArtifactStore,
    }

    impl Harness {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            Self {
                checkpoints: CheckpointStore::new(temp.path()),
                artifacts: ArtifactStore::new(temp.path()),
                _temp: temp,
            }
        }

        fn supervisor(
            &self,
            proposer: ScriptedProposer,
            judge: ScriptedJudge,
            gateway: MockGateway,
        ) -> AttemptSupervisor {
            AttemptSupervisor::new(
                0,
                Arc::new(proposer),
                Arc::new(judge),
                Arc::new(gateway),
                self.checkpoints.clone(),
                self.artifacts.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_attempt_runs_to_convergence_and_persists() {
        let h = Harness::new();
        let run_id = RunId::from_string("run-s1");
        let config = attempt_config(1, "direct", 10);
        let supervisor = h.supervisor(
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.3, 0.6, 0.9]),
            MockGateway::new(),
        );

        let result = supervisor
            .run_attempt(&run_id, &sample_task(), &config, &CancellationToken::new())
            .await;
        assert_eq!(result.status, AttemptStatus::Converged);
        assert_eq!(result.iterations_run, 3);
        assert_eq!(result.final_score, 0.9);
        assert!(!result.restart_worker);

        let saved = h
            .checkpoints
            .load_attempt(&run_id, &config.attempt_id)
            .unwrap()
            .unwrap();
        assert_eq!(saved.iteration, 3);
        assert_eq!(saved.status, AttemptStatus::Converged);
        assert_eq!(
            saved.baseline_fingerprint,
            Some(MockGateway::fingerprint_for("default"))
        );

        let dir = &result.artifact_path;
        assert!(dir.join("config.json").exists());
        assert!(dir.join("result.json").exists());
        assert!(dir.join("iter-000/fingerprint.txt").exists());
        assert!(dir.join("iter-003/feedback.json").exists());
    }

    #[tokio::test]
    async fn test_gateway_crash_fails_attempt_with_restart() {
        let h = Harness::new();
        let supervisor = h.supervisor(
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.3]),
            MockGateway::new().with_unreachable_after(1),
        );
        let result = supervisor
            .run_attempt(
                &RunId::from_string("run-s2"),
                &sample_task(),
                &attempt_config(1, "direct", 10),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, AttemptStatus::Failed);
        assert_eq!(result.iterations_run, 1);
        assert!(result.restart_worker);
        assert!(result.failure.as_deref().unwrap().contains("E0"));

        let errors = h
            .artifacts
            .attempt(&RunId::from_string("run-s2"), &AttemptId::from_index(1))
            .read_errors()
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_scores_zero() {
        let h = Harness::new();
        let gateway = MockGateway::new().with_crash_on("anything");
        gateway.apply("anything").await.ok();
        let supervisor = h.supervisor(ScriptedProposer::new(), ScriptedJudge::new(), gateway);
        let result = supervisor
            .run_attempt(
                &RunId::from_string("run-s3"),
                &sample_task(),
                &attempt_config(1, "direct", 10),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, AttemptStatus::Failed);
        assert_eq!(result.final_score, 0.0);
        assert_eq!(result.iterations_run, 0);
        assert!(result.restart_worker);
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_rejected() {
        let h = Harness::new();
        let ledger = BaselineLedger::new();
        ledger
            .verify("default", &MockGateway::fingerprint_for("default"))
            .unwrap();
        let supervisor = h
            .supervisor(
                ScriptedProposer::new(),
                ScriptedJudge::new(),
                MockGateway::new().with_fingerprint("dirty"),
            )
            .with_ledger(ledger);
        let result = supervisor
            .run_attempt(
                &RunId::from_string("run-s4"),
                &sample_task(),
                &attempt_config(1, "direct", 10),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, AttemptStatus::Failed);
        assert!(result.failure.unwrap().contains("Baseline mismatch"));
        assert!(result.restart_worker);
    }

    #[tokio::test]
    async fn test_resume_replays_committed_actions() {
        let h = Harness::new();
        let run_id = RunId::from_string("run-s5");
        let config = attempt_config(1, "direct", 4);

        // First run: two committed iterations, then the process goes away.
        let proposer = ScriptedProposer::new();
        let cancel = CancellationToken::new();
        let gateway = MockGateway::new().with_rejections(1);
        {
            let supervisor = h.supervisor(
                proposer.clone(),
                ScriptedJudge::new().with_scores(&[0.1, 0.2, 0.3, 0.5]),
                gateway.clone(),
            );
            let mut state = IterationState::new(run_id.clone(), sample_task(), config.clone());
            let artifacts = h.artifacts.attempt(&run_id, &config.attempt_id);
            let mut restart = false;
            state.status = AttemptStatus::Running;
            artifacts.write_config(&config).unwrap();
            let fp = supervisor
                .reset_and_verify(&state, &cancel)
                .await
                .unwrap()
                .unwrap();
            state.baseline_fingerprint = Some(fp);
            for _ in 0..2 {
                let report = supervisor.engine.run_iteration(&mut state, &cancel).await;
                artifacts.write_iteration(&report).unwrap();
                restart |= report.restart_worker;
                h.checkpoints.save(&state).unwrap();
            }
            assert!(!restart);
        }
        let before = gateway.applied_actions();
        assert_eq!(before, vec!["action 1", "action 2", "action 3"]);

        // Second run on a fresh environment resumes at iteration 3.
        let fresh = MockGateway::new();
        let resumed_proposer = ScriptedProposer::new();
        let supervisor = h.supervisor(
            resumed_proposer.clone(),
            ScriptedJudge::new().with_scores(&[0.3, 0.9]),
            fresh.clone(),
        );
        let result = supervisor
            .run_attempt(&run_id, &sample_task(), &config, &CancellationToken::new())
            .await;

        assert_eq!(result.status, AttemptStatus::Converged);
        assert_eq!(result.iterations_run, 4);
        assert_eq!(resumed_proposer.call_count(), 2);
        let replayed = fresh.applied_actions();
        assert_eq!(&replayed[..3], &before[..]);
        assert_eq!(replayed.len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_before_reset() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let proposer = ScriptedProposer::new();
        let supervisor = h.supervisor(proposer.clone(), ScriptedJudge::new(), MockGateway::new());
        let result = supervisor
            .run_attempt(
                &RunId::from_string("run-s6"),
                &sample_task(),
                &attempt_config(1, "direct", 10),
                &cancel,
            )
            .await;
        assert_eq!(result.status, AttemptStatus::Cancelled);
        assert_eq!(proposer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_restart_is_recorded() {
        let h = Harness::new();
        let run_id = RunId::from_string("run-s7");
        let config = attempt_config(1, "direct", 4);
        let path = h.checkpoints.path_for(&run_id, config.attempt_id.as_str());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ garbage").unwrap();

        let supervisor = h.supervisor(
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.9]),
            MockGateway::new(),
        );
        let result = supervisor
            .run_attempt(&run_id, &sample_task(), &config, &CancellationToken::new())
            .await;
        assert_eq!(result.status, AttemptStatus::Converged);
        assert_eq!(result.iterations_run, 1);

        let errors = h.artifacts.attempt(&run_id, &config.attempt_id).read_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].iteration, 0);
        assert!(errors[0].message.contains("restarted from baseline"));
        assert!(result.artifact_path.join("iter-000/fingerprint.txt").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_for_other_config_restart_is_recorded() {
        let h = Harness::new();
        let run_id = RunId::from_string("run-s8");
        let mut stale = IterationState::new(
            run_id.clone(),
            sample_task(),
            attempt_config(1, "exploratory", 4),
        );
        stale.iteration = 2;
        h.checkpoints.save(&stale).unwrap();

        let config = attempt_config(1, "direct", 4);
        let supervisor = h.supervisor(
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.9]),
            MockGateway::new(),
        );
        let result = supervisor
            .run_attempt(&run_id, &sample_task(), &config, &CancellationToken::new())
            .await;
        assert_eq!(result.iterations_run, 1);

        let errors = h.artifacts.attempt(&run_id, &config.attempt_id).read_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("different configuration"));
    }

    #[tokio::test]
    async fn test_missing_replay_record_restarts_with_baseline_artifacts() {
        let h = Harness::new();
        let run_id = RunId::from_string("run-s9");
        let config = attempt_config(1, "direct", 4);
        // Checkpoint claims two committed iterations, but no iteration artifacts exist
        let mut state = IterationState::new(run_id.clone(), sample_task(), config.clone());
        state.iteration = 2;
        state.baseline_fingerprint = Some(MockGateway::fingerprint_for("default"));
        h.checkpoints.save(&state).unwrap();

        let gateway = MockGateway::new();
        let supervisor = h.supervisor(
            ScriptedProposer::new(),
            ScriptedJudge::new().with_scores(&[0.9]),
            gateway.clone(),
        );
        let result = supervisor
            .run_attempt(&run_id, &sample_task(), &config, &CancellationToken::new())
            .await;
        assert_eq!(result.status, AttemptStatus::Converged);
        assert_eq!(result.iterations_run, 1);
        assert_eq!(gateway.applied_actions(), vec!["action 1"]);

        let errors = h.artifacts.attempt(&run_id, &config.attempt_id).read_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("cannot replay"));
        assert!(result.artifact_path.join("iter-000/fingerprint.txt").exists());
    }
}
