//! Failure taxonomy and the fast-retry transition table.
//!
//! Every action-execution attempt yields a [`StepOutcome`]. The engine feeds
//! it, together with the iteration's [`FastRetryBudget`], through
//! [`transition`] and does whatever the returned [`Transition`] says. There
//! is no exception-style control flow: the table below is the whole policy.
//!
//! ```text
//! outcome                 budget left      budget spent
//! ─────────────────────── ──────────────── ─────────────────
//! Applied      (E3/ok)    Judge            Judge
//! Rejected     (E1)       FastRetry        Exhausted → Judge
//! Unparseable  (E2)       FastRetry        Exhausted → Judge
//! Infrastructure (E0)     Abort            Abort
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::prompt::PROPOSAL_FORMAT_REMINDER;
use crate::gateway::ApplyOutcome;

/// Default fast-retry budget per iteration.
pub const DEFAULT_MAX_FAST_RETRIES: u32 = 3;

// ============================================================================
// Failure Classes
// ============================================================================

/// Class of a failed action-execution attempt.
///
/// Semantic shortfalls (E3) are not failures and have no class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// E0: the environment or a provider is unreachable.
    Infrastructure,
    /// E1: the gateway rejected the action.
    Execution,
    /// E2: provider output could not be parsed.
    Format,
}

impl FailureClass {
    /// Short code used in logs and artifacts.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Infrastructure => "E0",
            Self::Execution => "E1",
            Self::Format => "E2",
        }
    }

    /// Get a human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Infrastructure => "infrastructure failure",
            Self::Execution => "action rejected by environment",
            Self::Format => "unparseable provider output",
        }
    }

    /// Whether the class is retried in place.
    #[must_use]
    pub fn is_fast_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Format)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.description())
    }
}

/// Component an infrastructure failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Gateway,
    Proposer,
    Judge,
}

impl FailureSource {
    /// Only a broken environment instance warrants restarting the worker.
    #[must_use]
    pub fn requires_worker_restart(&self) -> bool {
        matches!(self, Self::Gateway)
    }
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gateway => "gateway",
            Self::Proposer => "proposer",
            Self::Judge => "judge",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Step Outcome and Transitions
// ============================================================================

/// Tagged result of one propose-then-apply step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Action applied; the goal may still be unmet (E3), which the judge decides.
    Applied(ApplyOutcome),
    /// Gateway executed but rejected the action (E1).
    Rejected(ApplyOutcome),
    /// Proposer output unparseable (E2).
    Unparseable { message: String },
    /// Unreachable gateway or provider (E0).
    Infrastructure {
        source: FailureSource,
        message: String,
    },
}

impl StepOutcome {
    /// Failure class, `None` for an applied action.
    #[must_use]
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected(_) => Some(FailureClass::Execution),
            Self::Unparseable { .. } => Some(FailureClass::Format),
            Self::Infrastructure { .. } => Some(FailureClass::Infrastructure),
        }
    }

    /// Failure message, `None` for an applied action.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Applied(_) => None,
            Self::Rejected(outcome) => Some(
                outcome
                    .result
                    .error
                    .clone()
                    .unwrap_or_else(|| "action rejected".to_string()),
            ),
            Self::Unparseable { message } | Self::Infrastructure { message, .. } => {
                Some(message.clone())
            }
        }
    }
}

/// What the engine does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Proceed to the judge.
    Judge,
    /// Re-propose with a correction note; one unit of budget was consumed.
    FastRetry {
        class: FailureClass,
        message: String,
        correction: String,
    },
    /// Budget spent; proceed to the judge with the last attempted result.
    Exhausted { class: FailureClass, message: String },
    /// Attempt-fatal; stop the attempt.
    Abort {
        source: FailureSource,
        message: String,
    },
}

/// Fast-retry budget shared by E1 and E2 within one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastRetryBudget {
    max: u32,
    used: u32,
}

impl FastRetryBudget {
    #[must_use]
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Consume one retry if any is left.
    pub fn try_consume(&mut self) -> bool {
        if self.used < self.max {
            self.used += 1;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn used(&self) -> u32 {
        self.used
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.max - self.used
    }
}

/// Correction note shown to the proposer after a rejected action.
#[must_use]
pub fn execution_correction(error: &str) -> String {
    format!(
        "The previous action failed in the environment with:\n{}\nFix the action and try again.",
        error.trim()
    )
}

/// Apply the transition table to one outcome.
pub fn transition(outcome: &StepOutcome, budget: &mut FastRetryBudget) -> Transition {
    match outcome {
        StepOutcome::Applied(_) => Transition::Judge,
        StepOutcome::Infrastructure { source, message } => Transition::Abort {
            source: *source,
            message: message.clone(),
        },
        StepOutcome::Rejected(_) | StepOutcome::Unparseable { .. } => {
            let class = outcome.class().unwrap_or(FailureClass::Execution);
            let message = outcome.message().unwrap_or_default();
            if class.is_fast_retryable() && budget.try_consume() {
                let correction = match class {
                    FailureClass::Format => PROPOSAL_FORMAT_REMINDER.to_string(),
                    _ => execution_correction(&message),
                };
                Transition::FastRetry {
                    class,
                    message,
                    correction,
                }
            } else {
                Transition::Exhausted { class, message }
            }
        }
    }
}

/// One failed step, written to the attempt's artifact trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Fast retries consumed when this failure was recorded.
    pub retry: u32,
    pub class: FailureClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RetryRecord {
    #[must_use]
    pub fn new(retry: u32, class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            retry,
            class,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
