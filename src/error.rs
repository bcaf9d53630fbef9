//! Custom error types for converge.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the orchestrator.
//! Failures inside an attempt are classified separately (see
//! [`crate::engine::retry`]); the variants here are what escapes an
//! attempt, a worker or a run.

use std::path::PathBuf;
use thiserror::Error;

use crate::gateway::GatewayError;

/// Main error type for converge operations
#[derive(Error, Debug)]
pub enum ConvergeError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Environment Errors
    // =========================================================================
    /// Environment gateway failure
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Environment instance failed to launch or become ready
    #[error("Worker {worker} failed to start: {message}")]
    WorkerStart { worker: usize, message: String },

    // =========================================================================
    // Attempt Errors
    // =========================================================================
    /// Reset did not reproduce the expected baseline
    #[error("Baseline mismatch for {attempt}: expected {expected}, got {actual}")]
    BaselineMismatch {
        attempt: String,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // Coordination Errors
    // =========================================================================
    /// Every attempt failed; nothing can be selected
    #[error("No valid attempts: all {total} attempts failed or were cancelled")]
    NoValidAttempts { total: usize },

    /// A selection was made but it does not meet the threshold
    #[error("Selected attempt {attempt} scored {score:.3}, below threshold {threshold:.3}")]
    BelowThreshold {
        attempt: String,
        score: f64,
        threshold: f64,
    },

    /// Run cancelled by the operator
    #[error("Run {run_id} cancelled")]
    Cancelled { run_id: String },

    /// No coordinator checkpoint for the run
    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Checkpoint store failure
    #[error("Checkpoint error: {message}")]
    Checkpoint { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConvergeError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker start error
    pub fn worker_start(worker: usize, message: impl Into<String>) -> Self {
        Self::WorkerStart {
            worker,
            message: message.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error means the environment instance is unusable
    /// and the owning worker must be restarted.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Gateway(_) | Self::WorkerStart { .. } | Self::BaselineMismatch { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BelowThreshold { .. } => 2,
            Self::NoValidAttempts { .. } => 3,
            Self::RunNotFound { .. } => 4,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::Toml(_) => 7,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }
}

/// Type alias for converge results
pub type Result<T> = std::result::Result<T, ConvergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConvergeError::BelowThreshold {
            attempt: "attempt-02".into(),
            score: 0.7,
            threshold: 0.85,
        };
        let msg = err.to_string();
        assert!(msg.contains("attempt-02"));
        assert!(msg.contains("0.700"));
        assert!(msg.contains("0.850"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ConvergeError::config("bad").exit_code(), 7);
        assert_eq!(ConvergeError::NoValidAttempts { total: 3 }.exit_code(), 3);
        assert_eq!(
            ConvergeError::Cancelled {
                run_id: "r".into()
            }
            .exit_code(),
            130
        );
        assert_eq!(ConvergeError::checkpoint("disk").exit_code(), 1);
    }

    #[test]
    fn test_is_infrastructure() {
        let gateway = ConvergeError::Gateway(GatewayError::Unreachable {
            endpoint: "127.0.0.1:1".into(),
            message: "refused".into(),
        });
        assert!(gateway.is_infrastructure());
        assert!(ConvergeError::worker_start(0, "timeout").is_infrastructure());
        assert!(!ConvergeError::config("x").is_infrastructure());
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/tmp/converge.toml");
        let err = ConvergeError::config_with_path("failed to parse", path.clone());
        if let ConvergeError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }
}
