//! Environment gateway: the remote, stateful environment being converged.
//!
//! A gateway applies one action at a time, resets to a named baseline and
//! captures diagnostic views. Every [`GatewayError`] is an infrastructure
//! failure: the engine never retries it in place, it aborts the attempt and
//! asks the worker pool to restart the instance.
//!
//! Instances are started by an [`EnvironmentLauncher`]; see [`launcher`].

pub mod launcher;
pub mod socket;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{ExecutionResult, Snapshot};

pub use launcher::{AttachLauncher, EnvironmentInstance, EnvironmentLauncher, ProcessLauncher};
pub use socket::SocketGateway;

/// Named diagnostic images (view name to encoded bytes).
pub type Views = BTreeMap<String, Vec<u8>>;

/// Errors talking to an environment instance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Instance could not be reached.
    #[error("Gateway {endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    /// Instance did not answer in time.
    #[error("Gateway {endpoint} timed out after {secs}s during {operation}")]
    Timeout {
        endpoint: String,
        operation: String,
        secs: u64,
    },

    /// Instance answered with something that is not a valid reply.
    #[error("Gateway {endpoint} protocol error: {message}")]
    Protocol { endpoint: String, message: String },
}

impl GatewayError {
    pub fn unreachable(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn protocol(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }
}

/// Reply to `apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub result: ExecutionResult,
    /// State after the action, also reported when it was rejected since a
    /// rejected action may still have partially mutated the environment.
    pub snapshot: Snapshot,
}

/// Reply to `reset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub ok: bool,
    /// Deterministic fingerprint of the environment after reset.
    pub fingerprint: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote environment an attempt mutates.
#[async_trait]
pub trait EnvironmentGateway: Send + Sync {
    /// Apply one action.
    async fn apply(&self, action: &str) -> Result<ApplyOutcome, GatewayError>;

    /// Reset to the named baseline.
    async fn reset(&self, baseline: &str) -> Result<ResetOutcome, GatewayError>;

    /// Capture diagnostic views of the current state.
    async fn capture(&self) -> Result<Views, GatewayError>;

    /// Address of the bound instance.
    fn endpoint(&self) -> &str;
}
