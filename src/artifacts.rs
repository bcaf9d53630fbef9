//! On-disk artifact trail of a run.
//!
//! Layout under the artifacts directory:
//!
//! ```text
//! <run_id>/
//!   run.json                 run metadata
//!   summary.json             selection, ranking and failures
//!   checkpoints/             see crate::checkpoint
//!   attempts/<attempt_id>/
//!     config.json
//!     result.json
//!     errors.jsonl
//!     iter-000/              baseline fingerprint and views
//!     iter-001/              plan.md, action.txt, applied.jsonl, result.json,
//!                            feedback.json, retries.jsonl, views/<nn>-<name>.png
//! ```
//!
//! Every path is keyed by run and attempt id, so concurrent attempts never
//! write to the same file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::command::view_file_name;
use crate::config::Settings;
use crate::engine::IterationReport;
use crate::error::{ConvergeError, Result};
use crate::gateway::Views;
use crate::state::{AttemptConfig, AttemptId, AttemptResult, RunId, TaskSpec};

/// Metadata written once when a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: RunId,
    pub task: TaskSpec,
    pub settings: Settings,
    pub created_at: DateTime<Utc>,
}

/// One line of `errors.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub iteration: u32,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Root of all run directories.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    /// Whether anything was recorded for `run_id`.
    pub fn run_exists(&self, run_id: &RunId) -> bool {
        self.run_dir(run_id).join("run.json").exists()
    }

    pub fn write_run_meta(&self, meta: &RunMeta) -> Result<()> {
        let dir = self.run_dir(&meta.run_id);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join("run.json"), meta)
    }

    /// Read `run.json`, `None` if the run is unknown.
    pub fn read_run_meta(&self, run_id: &RunId) -> Result<Option<RunMeta>> {
        let path = self.run_dir(run_id).join("run.json");
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write `summary.json`.
    pub fn write_summary<T: Serialize>(&self, run_id: &RunId, summary: &T) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join("summary.json");
        write_json(&path, summary)?;
        Ok(path)
    }

    /// Artifact directory of one attempt.
    pub fn attempt(&self, run_id: &RunId, attempt_id: &AttemptId) -> AttemptArtifacts {
        AttemptArtifacts {
            dir: self
                .run_dir(run_id)
                .join("attempts")
                .join(attempt_id.as_str()),
        }
    }
}

/// Writer for one attempt's directory.
#[derive(Debug, Clone)]
pub struct AttemptArtifacts {
    dir: PathBuf,
}

impl AttemptArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory of iteration `iteration` (`0` is the baseline).
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.dir.join(format!("iter-{iteration:03}"))
    }

    pub fn write_config(&self, config: &AttemptConfig) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_json(&self.dir.join("config.json"), config)
    }

    /// Record the verified baseline.
    pub fn write_baseline(&self, fingerprint: &str, views: &Views) -> Result<()> {
        let dir = self.iteration_dir(0);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("fingerprint.txt"), format!("{fingerprint}\n"))?;
        write_views(&dir, views)
    }

    /// Persist everything one iteration produced.
    pub fn write_iteration(&self, report: &IterationReport) -> Result<PathBuf> {
        let dir = self.iteration_dir(report.iteration);
        fs::create_dir_all(&dir)?;

        if let Some(proposal) = &report.proposal {
            fs::write(dir.join("plan.md"), &proposal.plan)?;
            fs::write(dir.join("action.txt"), &proposal.action)?;
        }
        write_lines(&dir.join("applied.jsonl"), &report.applied_actions)?;
        write_lines(&dir.join("retries.jsonl"), &report.retries)?;
        if let Some(result) = &report.result {
            write_json(&dir.join("result.json"), result)?;
        }
        if let Some(feedback) = &report.feedback {
            write_json(&dir.join("feedback.json"), feedback)?;
        }
        write_views(&dir, &report.views)?;
        Ok(dir)
    }

    /// Append to `errors.jsonl`.
    pub fn append_error(&self, iteration: u32, message: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let record = ErrorRecord {
            iteration,
            message: message.to_string(),
            at: Utc::now(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("errors.jsonl"))?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// Read the error trail.
    pub fn read_errors(&self) -> Result<Vec<ErrorRecord>> {
        let path = self.dir.join("errors.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_lines(&path)
    }

    pub fn write_result(&self, result: &AttemptResult) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_json(&self.dir.join("result.json"), result)
    }

    /// Actions sent to the gateway in iterations `1..=through`, in order.
    ///
    /// Fails when a committed iteration left no record; such an attempt
    /// cannot be replayed.
    pub fn applied_actions(&self, through: u32) -> Result<Vec<String>> {
        let mut actions = Vec::new();
        for iteration in 1..=through {
            let path = self.iteration_dir(iteration).join("applied.jsonl");
            if !path.exists() {
                return Err(ConvergeError::checkpoint(format!(
                    "no applied actions recorded for iteration {iteration} in {}",
                    self.dir.display()
                )));
            }
            actions.extend(read_lines::<String>(&path)?);
        }
        Ok(actions)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn write_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let mut file = File::create(path)?;
    for item in items {
        writeln!(file, "{}", serde_json::to_string(item)?)?;
    }
    Ok(())
}

fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut items = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        items.push(serde_json::from_str(&line)?);
    }
    Ok(items)
}

fn write_views(dir: &Path, views: &Views) -> Result<()> {
    if views.is_empty() {
        return Ok(());
    }
    let views_dir = dir.join("views");
    fs::create_dir_all(&views_dir)?;
    for (index, (name, bytes)) in views.iter().enumerate() {
        fs::write(views_dir.join(view_file_name(index, name)), bytes)?;
    }
    Ok(())
}
