//! Integration tests for the converge CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command for the converge binary
fn converge() -> Command {
    Command::new(cargo::cargo_bin!("converge"))
}

#[test]
fn test_help() {
    converge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Best-of-N convergence orchestrator"));
}

#[test]
fn test_version() {
    converge()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_run_help_lists_fan_out_flags() {
    converge()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--attempts"))
        .stdout(predicate::str::contains("--iterations"))
        .stdout(predicate::str::contains("--threshold"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_run_without_proposer_is_a_config_error() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "a red cube", "--attempts", "2"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("proposer.command"));
}

#[test]
fn test_run_rejects_out_of_range_threshold() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "a red cube", "--threshold", "1.5"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("run.threshold"));
}

#[test]
fn test_run_rejects_zero_attempts() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "a red cube", "--attempts", "0"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("run.attempts"));
}

#[test]
fn test_malformed_config_file() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("converge.toml"), "[run\nattempts = ").unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["run", "a red cube"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_explicit_config_must_exist() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .arg("--config")
        .arg(temp.path().join("missing.toml"))
        .args(["status", "run-1"])
        .assert()
        .code(7);
}

#[test]
fn test_status_of_unknown_run() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["status", "no-such-run"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Run not found: no-such-run"));
}

#[test]
fn test_resume_of_unknown_run() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path())
        .args(["resume", "no-such-run"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Run not found"));
}

#[test]
fn test_missing_project_directory() {
    let temp = TempDir::new().unwrap();

    converge()
        .arg("--project")
        .arg(temp.path().join("nope"))
        .args(["status", "run-1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Project directory does not exist"));
}
