//! Command-backed providers.
//!
//! Each call spawns the configured program, writes the rendered prompt to
//! its stdin and reads the answer from stdout. The child is killed if the
//! per-call timeout elapses. Any model CLI that reads a prompt on stdin
//! (or a shell script wrapping an HTTP API) can serve as proposer or judge.
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::capability::{CommandProposer, CommandSpec};
//!
//! let spec = CommandSpec::new("llm", vec!["-m".into(), "gpt-4o".into()]);
//! let proposer = CommandProposer::new(spec)?;
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::parse::{parse_feedback, parse_proposal};
use super::prompt::{render_assessment, render_proposal};
use super::{AssessmentRequest, Judge, ProposalRequest, Proposer, ProviderError};
use crate::error::{ConvergeError, Result};
use crate::state::{Feedback, Proposal};

/// Default per-call timeout for provider programs.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 300;

/// Maximum stderr bytes quoted in an error.
const STDERR_EXCERPT: usize = 500;

/// How to invoke a provider program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            timeout_secs: DEFAULT_PROVIDER_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Resolve the program on `PATH` so a typo fails at startup rather
    /// than on the first iteration.
    pub fn resolve(&self) -> Result<PathBuf> {
        which::which(&self.program).map_err(|e| {
            ConvergeError::invalid_config("command", format!("'{}': {e}", self.program))
        })
    }

    /// Run the program with `input` on stdin and return its stdout.
    pub async fn run(&self, program: &Path, input: &str) -> std::result::Result<String, ProviderError> {
        let mut child = AsyncCommand::new(program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::unavailable(format!("failed to spawn {}: {e}", self.program))
            })?;

        // The prompt is written while the output is drained, both under the
        // timeout, so a child that never reads stdin cannot stall the call.
        // Dropping the future on timeout drops the child, which kills it.
        let stdin = child.stdin.take();
        let write_prompt = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(input.as_bytes()).await?;
                stdin.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = match tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            async { tokio::join!(write_prompt, child.wait_with_output()) },
        )
        .await
        {
            Ok(pair) => pair,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    secs: self.timeout_secs,
                })
            }
        };

        let output = output
            .map_err(|e| ProviderError::unavailable(format!("failed to read output: {e}")))?;
        match written {
            Ok(()) => {}
            // The program exited without reading all of its input
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!(program = %self.program, "Prompt not fully read before exit");
            }
            Err(e) => {
                return Err(ProviderError::unavailable(format!(
                    "failed to write prompt to stdin: {e}"
                )))
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            return Err(ProviderError::unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                excerpt.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ============================================================================
// Proposer
// ============================================================================

/// Proposer backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandProposer {
    spec: CommandSpec,
    program: PathBuf,
    name: String,
}

impl CommandProposer {
    /// Create a proposer, resolving the program on `PATH`.
    pub fn new(spec: CommandSpec) -> Result<Self> {
        let program = spec.resolve()?;
        let name = format!("command:{}", spec.program);
        Ok(Self {
            spec,
            program,
            name,
        })
    }
}

#[async_trait]
impl Proposer for CommandProposer {
    async fn propose(
        &self,
        request: &ProposalRequest<'_>,
    ) -> std::result::Result<Proposal, ProviderError> {
        let prompt = render_proposal(request);
        debug!(
            proposer = %self.name,
            iteration = request.iteration,
            "Requesting proposal ({} chars prompt)",
            prompt.len()
        );
        let raw = self.spec.run(&self.program, &prompt).await?;
        parse_proposal(&raw)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Judge
// ============================================================================

/// Judge backed by an external program.
///
/// Diagnostic views are written to a per-call scratch directory so the
/// program can open them; the directory is removed after the call.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    spec: CommandSpec,
    program: PathBuf,
    name: String,
    scratch_root: PathBuf,
}

impl CommandJudge {
    /// Create a judge, resolving the program on `PATH`.
    pub fn new(spec: CommandSpec) -> Result<Self> {
        let program = spec.resolve()?;
        let name = format!("command:{}", spec.program);
        Ok(Self {
            spec,
            program,
            name,
            scratch_root: std::env::temp_dir(),
        })
    }

    /// Place scratch directories under `root` instead of the system temp dir.
    #[must_use]
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    async fn assess_in(
        &self,
        scratch: &Path,
        request: &AssessmentRequest<'_>,
    ) -> std::result::Result<Feedback, ProviderError> {
        let mut view_paths = Vec::with_capacity(request.views.len());
        if !request.views.is_empty() {
            tokio::fs::create_dir_all(scratch).await.map_err(|e| {
                ProviderError::unavailable(format!("failed to create scratch dir: {e}"))
            })?;
            for (index, (name, bytes)) in request.views.iter().enumerate() {
                let path = scratch.join(view_file_name(index, name));
                tokio::fs::write(&path, bytes).await.map_err(|e| {
                    ProviderError::unavailable(format!("failed to write view {name}: {e}"))
                })?;
                view_paths.push(path);
            }
        }

        let refs: Vec<&Path> = view_paths.iter().map(PathBuf::as_path).collect();
        let prompt = render_assessment(request, &refs);
        debug!(judge = %self.name, views = refs.len(), "Requesting assessment");
        let raw = self.spec.run(&self.program, &prompt).await?;
        parse_feedback(&raw)
    }
}

#[async_trait]
impl Judge for CommandJudge {
    async fn assess(
        &self,
        request: &AssessmentRequest<'_>,
    ) -> std::result::Result<Feedback, ProviderError> {
        let scratch = self
            .scratch_root
            .join(format!("converge-judge-{}", uuid::Uuid::new_v4().simple()));
        let result = self.assess_in(&scratch, request).await;
        if scratch.exists() {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
        }
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// File name for the `index`-th view. The index keeps names unique when
/// two view names sanitize to the same string.
pub(crate) fn view_file_name(index: usize, name: &str) -> String {
    format!("{index:02}-{}.png", sanitize(name))
}

/// Keep view names safe to use as file names.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "view".to_string()
    } else {
        cleaned
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::gateway::Views;
    use crate::history::HistoryManager;
    use crate::state::TaskSpec;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".into(), script.into()]).with_timeout_secs(10)
    }

    fn proposal_request<'a>(task: &'a TaskSpec, history: &'a HistoryManager) -> ProposalRequest<'a> {
        ProposalRequest {
            task,
            strategy: "direct",
            iteration: 1,
            snapshot: None,
            feedback: None,
            history,
            last_result: None,
            correction: None,
        }
    }

    #[test]
    fn test_resolve_missing_program_is_config_error() {
        let spec = CommandSpec::new("definitely-not-a-real-program-4821", vec![]);
        let err = CommandProposer::new(spec).unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_command_proposer_parses_stdout() {
        let proposer = CommandProposer::new(sh(
            "cat > /dev/null; printf 'Plan: go\\n```python\\nstep()\\n```\\n'",
        ))
        .unwrap();
        let task = TaskSpec::new("t");
        let history = HistoryManager::new(3);
        let proposal = proposer
            .propose(&proposal_request(&task, &history))
            .await
            .unwrap();
        assert_eq!(proposal.plan, "go");
        assert_eq!(proposal.action, "step()");
    }

    #[tokio::test]
    async fn test_command_proposer_receives_prompt_on_stdin() {
        // Echo the prompt back inside a code block.
        let proposer = CommandProposer::new(sh(
            "printf '```\\n'; grep -c 'a very specific task' ; printf '```\\n'",
        ))
        .unwrap();
        let task = TaskSpec::new("a very specific task");
        let history = HistoryManager::new(3);
        let proposal = proposer
            .propose(&proposal_request(&task, &history))
            .await
            .unwrap();
        assert_eq!(proposal.action, "1");
    }

    #[tokio::test]
    async fn test_command_proposer_non_zero_exit_is_unavailable() {
        let proposer = CommandProposer::new(sh("cat > /dev/null; echo boom >&2; exit 3")).unwrap();
        let task = TaskSpec::new("t");
        let history = HistoryManager::new(3);
        let err = proposer
            .propose(&proposal_request(&task, &history))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { ref message } if message.contains("boom")));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let proposer =
            CommandProposer::new(sh("sleep 5").with_timeout_secs(1)).unwrap();
        let task = TaskSpec::new("t");
        let history = HistoryManager::new(3);
        let err = proposer
            .propose(&proposal_request(&task, &history))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout { secs: 1 });
    }

    #[tokio::test]
    async fn test_timeout_covers_a_child_that_never_reads_its_prompt() {
        let spec = sh("sleep 5").with_timeout_secs(1);
        let program = spec.resolve().unwrap();
        // Larger than any pipe buffer, so the write alone would block
        let prompt = "x".repeat(4 * 1024 * 1024);

        let result = tokio::time::timeout(Duration::from_secs(4), spec.run(&program, &prompt))
            .await
            .expect("run must return once its own timeout elapses");
        assert_eq!(result.unwrap_err(), ProviderError::Timeout { secs: 1 });
    }

    #[tokio::test]
    async fn test_program_ignoring_stdin_still_succeeds() {
        let spec = sh("echo done");
        let program = spec.resolve().unwrap();
        let prompt = "x".repeat(1024 * 1024);
        let output = spec.run(&program, &prompt).await.unwrap();
        assert_eq!(output.trim(), "done");
    }

    #[tokio::test]
    async fn test_command_judge_writes_views_and_cleans_up() {
        let scratch = tempfile::TempDir::new().unwrap();
        // Count listed view files that exist while the judge runs.
        let judge = CommandJudge::new(sh(
            "n=0; for f in $(grep '^- ' | sed 's/^- //'); do [ -f \"$f\" ] && n=$((n+1)); done; \
             printf '{\"score\": 0.%s, \"issues\": []}' \"$n\"",
        ))
        .unwrap()
        .with_scratch_root(scratch.path());

        let task = TaskSpec::new("t");
        let mut views = Views::new();
        views.insert("front".into(), vec![1, 2, 3]);
        views.insert("side/../x".into(), vec![4]);
        let request = AssessmentRequest {
            task: &task,
            snapshot: None,
            views: &views,
            references: &[],
            correction: None,
        };
        let feedback = judge.assess(&request).await.unwrap();
        assert_eq!(feedback.score, 0.2);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("front view"), "front_view");
        assert_eq!(sanitize("../x"), "___x");
        assert_eq!(sanitize(""), "view");
    }

    #[test]
    fn test_view_file_names_stay_unique() {
        assert_eq!(view_file_name(0, "front view"), "00-front_view.png");
        assert_ne!(view_file_name(0, "front view"), view_file_name(1, "front_view"));
    }

    #[tokio::test]
    async fn test_command_judge_keeps_colliding_view_names_apart() {
        let scratch = tempfile::TempDir::new().unwrap();
        let judge = CommandJudge::new(sh(
            "n=0; for f in $(grep '^- ' | sed 's/^- //'); do [ -f \"$f\" ] && n=$((n+1)); done; \
             printf '{\"score\": 0.%s, \"issues\": []}' \"$n\"",
        ))
        .unwrap()
        .with_scratch_root(scratch.path());

        let task = TaskSpec::new("t");
        let mut views = Views::new();
        views.insert("front view".into(), vec![1]);
        views.insert("front_view".into(), vec![2]);
        views.insert("front/view".into(), vec![3]);
        let request = AssessmentRequest {
            task: &task,
            snapshot: None,
            views: &views,
            references: &[],
            correction: None,
        };
        let feedback = judge.assess(&request).await.unwrap();
        assert_eq!(feedback.score, 0.3);
    }
}
