//! Configuration management for converge.
//!
//! Settings come from `converge.toml` in the project directory (or an
//! explicit `--config` path). Every section is optional; a missing file
//! yields the defaults. Command-line flags are applied on top through
//! [`Overrides`], then [`Settings::validate`] checks the result.
//!
//! # Example
//!
//! ```toml
//! [run]
//! attempts = 4
//! workers = 2
//! threshold = 0.9
//! strategies = ["direct", "incremental"]
//!
//! [proposer]
//! command = ["llm", "-m", "gpt-4o"]
//!
//! [judge]
//! command = ["./judge.sh"]
//!
//! [environment]
//! command = ["blender", "--background", "--python", "gateway.py", "--", "--port", "{port}"]
//! base_port = 9876
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capability::{CommandJudge, CommandProposer, CommandSpec, Judge, Proposer};
use crate::engine::stop::MIN_STAGNATION_WINDOW;
use crate::engine::EngineTimeouts;
use crate::error::{ConvergeError, Result};
use crate::gateway::socket::GatewayTimeouts;
use crate::gateway::{AttachLauncher, EnvironmentLauncher, ProcessLauncher};

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "converge.toml";

/// Strategy labels assigned round-robin when none are configured.
pub const DEFAULT_STRATEGIES: &[&str] = &["direct", "incremental", "exploratory"];

// ============================================================================
// Sections
// ============================================================================

/// `[run]`: attempt fan-out and per-attempt limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub attempts: usize,
    pub workers: usize,
    pub max_iterations: u32,
    pub threshold: f64,
    pub stagnation_window: usize,
    pub stagnation_epsilon: f64,
    pub max_fast_retries: u32,
    pub history_window: usize,
    /// Baseline reference every attempt resets to.
    pub baseline: String,
    /// Strategy catalog, assigned to attempts round-robin.
    pub strategies: Vec<String>,
    pub artifacts_dir: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            workers: 3,
            max_iterations: 10,
            threshold: 0.85,
            stagnation_window: 3,
            stagnation_epsilon: 0.02,
            max_fast_retries: 3,
            history_window: 5,
            baseline: "default".to_string(),
            strategies: DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
            artifacts_dir: PathBuf::from(".converge/runs"),
        }
    }
}

/// `[timeouts]`, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub propose_secs: u64,
    pub assess_secs: u64,
    pub apply_secs: u64,
    pub reset_secs: u64,
    pub capture_secs: u64,
    pub readiness_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            propose_secs: 300,
            assess_secs: 300,
            apply_secs: 120,
            reset_secs: 120,
            capture_secs: 60,
            readiness_secs: 60,
        }
    }
}

/// `[proposer]` / `[judge]`: program invoked per call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ProviderSettings {
    fn to_spec(&self, section: &str, timeout_secs: u64) -> Result<CommandSpec> {
        let (program, args) = self.command.split_first().ok_or_else(|| {
            ConvergeError::invalid_config(
                format!("{section}.command"),
                "must name a program to run",
            )
        })?;
        let mut spec = CommandSpec::new(program.clone(), args.to_vec()).with_timeout_secs(timeout_secs);
        spec.env = self.env.clone();
        Ok(spec)
    }
}

/// `[environment]`: how workers get an environment instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentSettings {
    /// Pre-started gateways, one per worker.
    pub endpoints: Vec<String>,
    /// Launch command; `{port}` is replaced per worker.
    pub command: Vec<String>,
    pub host: String,
    pub base_port: u16,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            command: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 9876,
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Complete configuration of a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub run: RunSettings,
    pub timeouts: TimeoutSettings,
    pub proposer: ProviderSettings,
    pub judge: ProviderSettings,
    pub environment: EnvironmentSettings,
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub attempts: Option<usize>,
    pub workers: Option<usize>,
    pub max_iterations: Option<u32>,
    pub threshold: Option<f64>,
    pub baseline: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
}

impl Settings {
    /// Load `converge.toml` from `project_dir`, or defaults if absent.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load_from(&path)
        } else {
            debug!("No {} in {}, using defaults", CONFIG_FILE, project_dir.display());
            Ok(Self::default())
        }
    }

    /// Load an explicit configuration file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::config_with_path(format!("cannot read {}: {e}", path.display()), path.to_path_buf())
        })?;
        Self::parse(&content)
            .map_err(|e| ConvergeError::config_with_path(e.to_string(), path.to_path_buf()))
    }

    /// Parse settings from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(attempts) = overrides.attempts {
            self.run.attempts = attempts;
        }
        if let Some(workers) = overrides.workers {
            self.run.workers = workers;
        }
        if let Some(max_iterations) = overrides.max_iterations {
            self.run.max_iterations = max_iterations;
        }
        if let Some(threshold) = overrides.threshold {
            self.run.threshold = threshold;
        }
        if let Some(baseline) = &overrides.baseline {
            self.run.baseline = baseline.clone();
        }
        if let Some(dir) = &overrides.artifacts_dir {
            self.run.artifacts_dir = dir.clone();
        }
    }

    /// Check every value the orchestrator relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConvergeError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let run = &self.run;
        if run.attempts == 0 {
            return Err(ConvergeError::invalid_config("run.attempts", "must be at least 1"));
        }
        if run.workers == 0 {
            return Err(ConvergeError::invalid_config("run.workers", "must be at least 1"));
        }
        if run.max_iterations == 0 {
            return Err(ConvergeError::invalid_config(
                "run.max_iterations",
                "must be at least 1",
            ));
        }
        for (field, value) in [
            ("run.threshold", run.threshold),
            ("run.stagnation_epsilon", run.stagnation_epsilon),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConvergeError::invalid_config(
                    field,
                    format!("must be within [0, 1], got {value}"),
                ));
            }
        }
        if run.stagnation_window < MIN_STAGNATION_WINDOW {
            return Err(ConvergeError::invalid_config(
                "run.stagnation_window",
                format!("must be at least {MIN_STAGNATION_WINDOW}"),
            ));
        }
        if run.history_window < run.stagnation_window {
            return Err(ConvergeError::invalid_config(
                "run.history_window",
                "must be at least run.stagnation_window",
            ));
        }
        if run.strategies.is_empty() || run.strategies.iter().any(|s| s.trim().is_empty()) {
            return Err(ConvergeError::invalid_config(
                "run.strategies",
                "must list at least one non-empty label",
            ));
        }
        if run.baseline.trim().is_empty() {
            return Err(ConvergeError::invalid_config("run.baseline", "must not be empty"));
        }

        let t = &self.timeouts;
        for (field, secs) in [
            ("timeouts.propose_secs", t.propose_secs),
            ("timeouts.assess_secs", t.assess_secs),
            ("timeouts.apply_secs", t.apply_secs),
            ("timeouts.reset_secs", t.reset_secs),
            ("timeouts.capture_secs", t.capture_secs),
            ("timeouts.readiness_secs", t.readiness_secs),
        ] {
            if secs == 0 {
                return Err(ConvergeError::invalid_config(field, "must be positive"));
            }
        }
        Ok(())
    }

    /// Number of workers actually needed.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.run.workers.min(self.run.attempts).max(1)
    }

    #[must_use]
    pub fn engine_timeouts(&self) -> EngineTimeouts {
        let t = &self.timeouts;
        EngineTimeouts {
            propose: Duration::from_secs(t.propose_secs),
            assess: Duration::from_secs(t.assess_secs),
            apply: Duration::from_secs(t.apply_secs),
            capture: Duration::from_secs(t.capture_secs),
        }
    }

    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.reset_secs)
    }

    #[must_use]
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.readiness_secs)
    }

    fn gateway_timeouts(&self) -> GatewayTimeouts {
        GatewayTimeouts {
            apply: Duration::from_secs(self.timeouts.apply_secs),
            reset: self.reset_timeout(),
            capture: Duration::from_secs(self.timeouts.capture_secs),
        }
    }

    /// Build the configured proposer.
    pub fn build_proposer(&self) -> Result<Arc<dyn Proposer>> {
        let spec = self.proposer.to_spec("proposer", self.timeouts.propose_secs)?;
        Ok(Arc::new(CommandProposer::new(spec)?))
    }

    /// Build the configured judge, with scratch space under `scratch_root`.
    pub fn build_judge(&self, scratch_root: &Path) -> Result<Arc<dyn Judge>> {
        let spec = self.judge.to_spec("judge", self.timeouts.assess_secs)?;
        Ok(Arc::new(CommandJudge::new(spec)?.with_scratch_root(scratch_root)))
    }

    /// Build the configured environment launcher.
    pub fn build_launcher(&self) -> Result<Arc<dyn EnvironmentLauncher>> {
        let env = &self.environment;
        if !env.endpoints.is_empty() {
            let workers = self.effective_workers();
            if env.endpoints.len() < workers {
                return Err(ConvergeError::invalid_config(
                    "environment.endpoints",
                    format!("{} endpoint(s) for {} worker(s)", env.endpoints.len(), workers),
                ));
            }
            return Ok(Arc::new(
                AttachLauncher::new(env.endpoints.clone()).with_timeouts(self.gateway_timeouts()),
            ));
        }

        let (program, args) = env.command.split_first().ok_or_else(|| {
            ConvergeError::invalid_config(
                "environment",
                "set either endpoints or a launch command",
            )
        })?;
        Ok(Arc::new(
            ProcessLauncher::new(program.clone(), args.to_vec())
                .with_host(env.host.clone())
                .with_base_port(env.base_port)
                .with_timeouts(self.gateway_timeouts()),
        ))
    }
}
