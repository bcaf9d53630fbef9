//! Pluggable reasoning capabilities: the proposer and the judge.
//!
//! The orchestrator only talks to these two traits. Concrete backends are
//! chosen at configuration time and handed around as `Arc<dyn Proposer>` /
//! `Arc<dyn Judge>`, which keeps the engine testable with the scripted
//! doubles in [`crate::testing`].
//!
//! # Architecture
//!
//! ```text
//! ProposalRequest ──render──> prompt ──CommandProposer──> stdout ──parse──> Proposal
//! AssessmentRequest ─render─> prompt ──CommandJudge─────> stdout ──parse──> Feedback
//! ```
//!
//! Both traits are:
//!
//! - **Object-safe**: used via `Arc<dyn Trait>`
//! - **Thread-safe**: `Send + Sync`, shared across workers
//! - **Fallible by class**: errors carry a [`ProviderError`] whose variant
//!   decides how the engine reacts (format errors are fast-retried,
//!   unavailability aborts the attempt)

pub mod command;
pub mod parse;
pub mod prompt;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::gateway::Views;
use crate::history::HistoryManager;
use crate::state::{ExecutionResult, Feedback, Proposal, Snapshot, TaskSpec};

pub use command::{CommandJudge, CommandProposer, CommandSpec};

/// Errors returned by a capability provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Output could not be parsed into the expected shape.
    #[error("Unparseable output: {message}")]
    Format { message: String, raw: String },

    /// Provider could not be reached or exited abnormally.
    #[error("Provider unavailable: {message}")]
    Unavailable { message: String },

    /// Provider did not answer within its deadline.
    #[error("Provider timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl ProviderError {
    /// Create a format error keeping the offending output.
    pub fn format(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Whether the engine may fast-retry this error.
    #[must_use]
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format { .. })
    }
}

/// Everything the proposer sees for one proposal.
#[derive(Debug, Clone, Copy)]
pub struct ProposalRequest<'a> {
    pub task: &'a TaskSpec,
    pub strategy: &'a str,
    /// 1-based index of the iteration being proposed.
    pub iteration: u32,
    pub snapshot: Option<&'a Snapshot>,
    pub feedback: Option<&'a Feedback>,
    pub history: &'a HistoryManager,
    /// Result of the previous fast-retry action, if any.
    pub last_result: Option<&'a ExecutionResult>,
    /// Correction note for a fast retry (execution error or format reminder).
    pub correction: Option<&'a str>,
}

/// Everything the judge sees for one assessment.
#[derive(Debug, Clone, Copy)]
pub struct AssessmentRequest<'a> {
    pub task: &'a TaskSpec,
    pub snapshot: Option<&'a Snapshot>,
    pub views: &'a Views,
    pub references: &'a [PathBuf],
    /// Format reminder after an unparseable verdict.
    pub correction: Option<&'a str>,
}

/// Produces the next plan and action.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Propose a plan and action for the current state.
    async fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal, ProviderError>;

    /// Name used in logs and artifacts.
    fn name(&self) -> &str;
}

/// Scores the environment against the task.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Assess the current snapshot; scores are in `[0, 1]`.
    async fn assess(&self, request: &AssessmentRequest<'_>) -> Result<Feedback, ProviderError>;

    /// Name used in logs and artifacts.
    fn name(&self) -> &str;
}
