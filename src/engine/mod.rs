//! Iteration engine: one propose, act, observe cycle with bounded
//! self-correction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  action   ┌─────────┐  outcome  ┌────────────┐
//! │ Proposer │ ────────> │ Gateway │ ────────> │ transition │──FastRetry──┐
//! └──────────┘           └─────────┘           └────────────┘             │
//!       ^                                            │ Judge/Exhausted    │
//!       └──────────── correction note ───────────────┼────────────────────┘
//!                                                    v
//!                              capture ──> Judge ──> history ──> stop conditions
//! ```
//!
//! The engine only mutates the [`IterationState`] it is handed. Suspension
//! points are the provider and gateway calls; each one has its own timeout
//! and observes the cancellation token.

pub mod retry;
pub mod stop;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::prompt::{COMPLETION_MARKER, VERDICT_FORMAT_REMINDER};
use crate::capability::{AssessmentRequest, Judge, ProposalRequest, Proposer, ProviderError};
use crate::gateway::{EnvironmentGateway, Views};
use crate::history::HistoryEntry;
use crate::state::{AttemptStatus, ExecutionResult, Feedback, IterationState, Proposal};

use retry::{
    transition, FailureClass, FailureSource, FastRetryBudget, RetryRecord, StepOutcome,
    Transition,
};

/// Default per-call timeouts.
pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_ASSESS_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-call deadlines enforced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    pub propose: Duration,
    pub assess: Duration,
    pub apply: Duration,
    pub capture: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            propose: DEFAULT_PROPOSE_TIMEOUT,
            assess: DEFAULT_ASSESS_TIMEOUT,
            apply: DEFAULT_APPLY_TIMEOUT,
            capture: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

/// Outcome of awaiting a suspension point.
#[derive(Debug)]
pub(crate) enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Await `fut` under a deadline, giving up early on cancellation.
pub(crate) async fn guarded<F: Future>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: F,
) -> Guarded<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Guarded::Cancelled,
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(value) => Guarded::Done(value),
            Err(_) => Guarded::TimedOut,
        },
    }
}

/// Everything produced by one call to [`IterationEngine::run_iteration`].
///
/// The supervisor persists it as the iteration's artifacts.
#[derive(Debug, Clone, Default)]
pub struct IterationReport {
    /// 1-based index of the iteration.
    pub iteration: u32,
    /// Last proposal, if any parsed.
    pub proposal: Option<Proposal>,
    /// Result of the last applied action.
    pub result: Option<ExecutionResult>,
    pub feedback: Option<Feedback>,
    pub views: Views,
    /// Every action sent to the gateway, in order, including rejected ones.
    pub applied_actions: Vec<String>,
    pub retries: Vec<RetryRecord>,
    /// The iteration completed and was folded into the state.
    pub committed: bool,
    /// Attempt-fatal error, if the iteration aborted.
    pub error: Option<String>,
    /// The worker's environment must be restarted.
    pub restart_worker: bool,
}

impl IterationReport {
    fn new(iteration: u32) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }
}

/// Drives iterations of one attempt.
#[derive(Clone)]
pub struct IterationEngine {
    proposer: Arc<dyn Proposer>,
    judge: Arc<dyn Judge>,
    gateway: Arc<dyn EnvironmentGateway>,
    timeouts: EngineTimeouts,
}

impl IterationEngine {
    #[must_use]
    pub fn new(
        proposer: Arc<dyn Proposer>,
        judge: Arc<dyn Judge>,
        gateway: Arc<dyn EnvironmentGateway>,
    ) -> Self {
        Self {
            proposer,
            judge,
            gateway,
            timeouts: EngineTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: EngineTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Run one iteration against `state`.
    ///
    /// On return `state` is either advanced by exactly one committed
    /// iteration (possibly with a terminal status from the stop
    /// conditions), or marked `failed`/`cancelled` with `iteration`
    /// unchanged.
    pub async fn run_iteration(
        &self,
        state: &mut IterationState,
        cancel: &CancellationToken,
    ) -> IterationReport {
        let index = state.iteration + 1;
        let mut report = IterationReport::new(index);
        let mut budget = FastRetryBudget::new(state.config.max_fast_retries);
        let mut correction: Option<String> = None;
        state.retry_count = 0;

        debug!(attempt = %state.attempt_id, iteration = index, "Starting iteration");

        // Act: propose and apply until something is judgeable.
        loop {
            let outcome = match self.act(state, &mut report, correction.as_deref(), cancel).await {
                Some(outcome) => outcome,
                None => return Self::cancelled(state, report),
            };

            match transition(&outcome, &mut budget) {
                Transition::Judge => break,
                Transition::FastRetry {
                    class,
                    message,
                    correction: note,
                } => {
                    state.retry_count = budget.used();
                    debug!(
                        attempt = %state.attempt_id,
                        iteration = index,
                        retry = budget.used(),
                        remaining = budget.remaining(),
                        "{}: {}",
                        class.code(),
                        message
                    );
                    report
                        .retries
                        .push(RetryRecord::new(budget.used(), class, message));
                    correction = Some(note);
                }
                Transition::Exhausted { class, message } => {
                    warn!(
                        attempt = %state.attempt_id,
                        iteration = index,
                        "Fast retries exhausted ({}), judging last result",
                        class.code()
                    );
                    report
                        .retries
                        .push(RetryRecord::new(budget.used(), class, message));
                    break;
                }
                Transition::Abort { source, message } => {
                    return Self::aborted(state, report, source, message);
                }
            }
        }

        // Observe: capture views for the judge and the artifact trail.
        match guarded(cancel, self.timeouts.capture, self.gateway.capture()).await {
            Guarded::Cancelled => return Self::cancelled(state, report),
            Guarded::TimedOut => {
                let message = format!("capture timed out after {}s", self.timeouts.capture.as_secs());
                return Self::aborted(state, report, FailureSource::Gateway, message);
            }
            Guarded::Done(Err(e)) => {
                return Self::aborted(state, report, FailureSource::Gateway, e.to_string());
            }
            Guarded::Done(Ok(views)) => report.views = views,
        }

        // Judge, sharing the remaining fast-retry budget for format errors.
        let mut judge_correction: Option<&str> = None;
        let feedback = loop {
            let request = AssessmentRequest {
                task: &state.task,
                snapshot: state.snapshot.as_ref(),
                views: &report.views,
                references: &state.task.references,
                correction: judge_correction,
            };
            let verdict = match guarded(cancel, self.timeouts.assess, self.judge.assess(&request)).await {
                Guarded::Cancelled => return Self::cancelled(state, report),
                Guarded::TimedOut => Err(ProviderError::Timeout {
                    secs: self.timeouts.assess.as_secs(),
                }),
                Guarded::Done(verdict) => verdict,
            };
            match verdict {
                Ok(feedback) => break feedback,
                Err(e) if e.is_format() => {
                    let message = e.to_string();
                    if budget.try_consume() {
                        state.retry_count = budget.used();
                        report
                            .retries
                            .push(RetryRecord::new(budget.used(), FailureClass::Format, message));
                        judge_correction = Some(VERDICT_FORMAT_REMINDER);
                    } else {
                        warn!(
                            attempt = %state.attempt_id,
                            iteration = index,
                            "Judge output unparseable after retries; recording as unassessed"
                        );
                        report.retries.push(RetryRecord::new(
                            budget.used(),
                            FailureClass::Format,
                            message.clone(),
                        ));
                        break Feedback::unassessed(message);
                    }
                }
                Err(e) => {
                    return Self::aborted(state, report, FailureSource::Judge, e.to_string());
                }
            }
        };

        self.commit(state, &mut report, feedback);
        report
    }

    /// One propose-then-apply step. `None` means cancelled.
    async fn act(
        &self,
        state: &mut IterationState,
        report: &mut IterationReport,
        correction: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<StepOutcome> {
        let request = ProposalRequest {
            task: &state.task,
            strategy: &state.config.strategy,
            iteration: report.iteration,
            snapshot: state.snapshot.as_ref(),
            feedback: state.last_feedback.as_ref(),
            history: &state.history,
            last_result: correction.and(report.result.as_ref()),
            correction,
        };
        let proposed = match guarded(cancel, self.timeouts.propose, self.proposer.propose(&request)).await {
            Guarded::Cancelled => return None,
            Guarded::TimedOut => Err(ProviderError::Timeout {
                secs: self.timeouts.propose.as_secs(),
            }),
            Guarded::Done(proposed) => proposed,
        };

        let proposal = match proposed {
            Ok(proposal) => proposal,
            Err(e) if e.is_format() => {
                return Some(StepOutcome::Unparseable {
                    message: e.to_string(),
                })
            }
            Err(e) => {
                return Some(StepOutcome::Infrastructure {
                    source: FailureSource::Proposer,
                    message: e.to_string(),
                })
            }
        };

        if proposal.plan.contains(COMPLETION_MARKER) {
            info!(
                attempt = %state.attempt_id,
                iteration = report.iteration,
                "Proposer reports the objective complete"
            );
        }

        report.applied_actions.push(proposal.action.clone());
        let applied = guarded(cancel, self.timeouts.apply, self.gateway.apply(&proposal.action)).await;
        report.proposal = Some(proposal.clone());
        state.last_proposal = Some(proposal);

        let outcome = match applied {
            Guarded::Cancelled => return None,
            Guarded::TimedOut => StepOutcome::Infrastructure {
                source: FailureSource::Gateway,
                message: format!("apply timed out after {}s", self.timeouts.apply.as_secs()),
            },
            Guarded::Done(Err(e)) => StepOutcome::Infrastructure {
                source: FailureSource::Gateway,
                message: e.to_string(),
            },
            Guarded::Done(Ok(outcome)) => {
                state.snapshot = Some(outcome.snapshot.clone());
                state.last_result = Some(outcome.result.clone());
                report.result = Some(outcome.result.clone());
                if outcome.result.ok {
                    StepOutcome::Applied(outcome)
                } else {
                    StepOutcome::Rejected(outcome)
                }
            }
        };
        Some(outcome)
    }

    /// Fold a judged iteration into the state and evaluate stop conditions.
    fn commit(&self, state: &mut IterationState, report: &mut IterationReport, feedback: Feedback) {
        let plan = report
            .proposal
            .as_ref()
            .map(|p| p.plan.as_str())
            .unwrap_or_default();
        state
            .history
            .push(HistoryEntry::from_feedback(report.iteration, plan, &feedback));
        state.iteration = report.iteration;
        state.last_feedback = Some(feedback.clone());
        state.updated_at = Utc::now();
        report.feedback = Some(feedback);
        report.committed = true;

        if let Some(status) = stop::evaluate_state(state) {
            state.finish(status, None);
        }

        info!(
            attempt = %state.attempt_id,
            iteration = state.iteration,
            score = state.current_score(),
            retries = state.retry_count,
            recorded = state.history.total_recorded(),
            status = %state.status,
            "Iteration committed"
        );
    }

    fn aborted(
        state: &mut IterationState,
        mut report: IterationReport,
        source: FailureSource,
        message: String,
    ) -> IterationReport {
        let reason = format!(
            "{} from {}: {}",
            FailureClass::Infrastructure,
            source,
            message
        );
        warn!(attempt = %state.attempt_id, iteration = report.iteration, "Attempt aborted: {reason}");
        state.finish(AttemptStatus::Failed, Some(reason.clone()));
        report.error = Some(reason);
        report.restart_worker = source.requires_worker_restart();
        report
    }

    fn cancelled(state: &mut IterationState, mut report: IterationReport) -> IterationReport {
        info!(attempt = %state.attempt_id, iteration = report.iteration, "Attempt cancelled");
        state.finish(AttemptStatus::Cancelled, Some("cancelled".to_string()));
        report.error = Some("cancelled".to_string());
        report
    }
}
