//! Converge - Best-of-N Convergence Orchestrator
//!
//! Drives external environments toward a target by running several
//! independent propose→act→observe loops in parallel and keeping the best
//! result. Reasoning is delegated to pluggable proposer and judge providers;
//! the orchestrator owns retries, stopping, checkpoints and selection.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`coordinator`] - Fans a task out to N attempts and selects the best
//! - [`pool`] - Fixed-size worker pool, one environment instance per worker
//! - [`supervisor`] - Runs one attempt on one worker: reset, verify, iterate
//! - [`engine`] - One iteration, the failure taxonomy and stop rules
//! - [`history`] - Bounded iteration history with a rolling summary
//! - [`checkpoint`] - Atomic, versioned state persistence
//! - [`selector`] - Deterministic best-of-N ranking
//! - [`capability`] - Proposer and judge interfaces plus command providers
//! - [`gateway`] - Environment gateway interface, socket client, launchers
//! - [`artifacts`] - Per-run, per-attempt artifact trail
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Scripted providers and mock environments
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::{Coordinator, Settings, TaskSpec};
//! use tokio_util::sync::CancellationToken;
//!
//! let settings = Settings::load(".")?;
//! let coordinator = Coordinator::from_settings(settings)?;
//! let outcome = coordinator
//!     .run(TaskSpec::new("model a mounting bracket"), CancellationToken::new())
//!     .await?;
//!
//! let selection = outcome.verdict()?;
//! println!("{} scored {:.2}", selection.attempt_id, selection.score);
//! ```

pub mod artifacts;
pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod history;
pub mod pool;
pub mod selector;
pub mod state;
pub mod supervisor;
pub mod testing;

// Re-export commonly used types
pub use error::{ConvergeError, Result};

pub use config::{Overrides, Settings, CONFIG_FILE};
pub use coordinator::{run_status, Coordinator, RunOutcome, RunSummary};
pub use selector::{select_best, Selection};

pub use capability::{Judge, Proposer, ProviderError};
pub use gateway::{EnvironmentGateway, EnvironmentLauncher, GatewayError};

pub use state::{
    AttemptConfig, AttemptId, AttemptResult, AttemptStatus, CoordinatorState, Feedback,
    IterationState, RunId, RunStatus, TaskSpec,
};
