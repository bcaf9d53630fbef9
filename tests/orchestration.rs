//! End-to-end orchestration tests against scripted providers and mock
//! environments.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use converge::artifacts::ArtifactStore;
use converge::coordinator::Coordinator;
use converge::testing::{sample_task, MockGateway, MockLauncher, ScriptedJudge, ScriptedProposer};
use converge::{AttemptId, AttemptStatus, ConvergeError, RunStatus, Settings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn settings(temp: &TempDir, attempts: usize, workers: usize, max_iterations: u32) -> Settings {
    let mut settings = Settings::default();
    settings.run.attempts = attempts;
    settings.run.workers = workers;
    settings.run.max_iterations = max_iterations;
    settings.run.artifacts_dir = temp.path().to_path_buf();
    settings.timeouts.readiness_secs = 2;
    settings
}

fn strategy_proposer() -> ScriptedProposer {
    ScriptedProposer::new()
        .with_action_for_strategy("direct", "direct-move")
        .with_action_for_strategy("incremental", "incremental-move")
        .with_action_for_strategy("exploratory", "exploratory-move")
}

#[tokio::test]
async fn test_selects_highest_scoring_attempt() {
    let temp = TempDir::new().unwrap();
    let judge = ScriptedJudge::new()
        .with_rule("direct-move", 0.60)
        .with_rule("incremental-move", 0.88)
        .with_rule("exploratory-move", 0.70);
    let coordinator = Coordinator::new(
        settings(&temp, 3, 3, 5),
        Arc::new(strategy_proposer()),
        Arc::new(judge),
        Arc::new(MockLauncher::new()),
    );

    let outcome = coordinator
        .run(sample_task(), CancellationToken::new())
        .await
        .unwrap();

    let selection = outcome.verdict().unwrap();
    assert_eq!(selection.attempt_id, AttemptId::from_index(2));
    assert!((selection.score - 0.88).abs() < f64::EPSILON);
    assert_eq!(selection.ranking.len(), 3);
    assert!(outcome.state.all_completed());

    let winner = &outcome.state.completed[&AttemptId::from_index(2)];
    assert_eq!(winner.status, AttemptStatus::Converged);
    assert_eq!(winner.iterations_run, 1);
}

#[tokio::test]
async fn test_worker_crash_is_isolated_to_its_attempt() {
    let temp = TempDir::new().unwrap();
    let judge = ScriptedJudge::new()
        .with_rule("direct-move", 0.60)
        .with_rule("exploratory-move", 0.70);
    let launcher =
        MockLauncher::with_factory(|_| MockGateway::new().with_crash_on("incremental-move"));
    let coordinator = Coordinator::new(
        settings(&temp, 3, 3, 4),
        Arc::new(strategy_proposer()),
        Arc::new(judge),
        Arc::new(launcher),
    );

    let outcome = coordinator
        .run(sample_task(), CancellationToken::new())
        .await
        .unwrap();

    let completed = &outcome.state.completed;
    assert_eq!(completed.len(), 3);
    let crashed = &completed[&AttemptId::from_index(2)];
    assert_eq!(crashed.status, AttemptStatus::Failed);
    assert!(crashed.restart_worker);
    assert!(completed[&AttemptId::from_index(1)].status.is_selectable());
    assert!(completed[&AttemptId::from_index(3)].status.is_selectable());

    // Best of the two survivors, still short of the 0.85 threshold
    assert_eq!(outcome.selection.as_ref().unwrap().attempt_id, AttemptId::from_index(3));
    assert!(matches!(
        outcome.verdict(),
        Err(ConvergeError::BelowThreshold { .. })
    ));

    let errors = ArtifactStore::new(temp.path())
        .attempt(outcome.run_id(), &AttemptId::from_index(2))
        .read_errors()
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("instance crashed"));
}

#[tokio::test]
async fn test_attempts_sharing_a_worker_start_from_the_same_baseline() {
    let temp = TempDir::new().unwrap();
    let launcher = MockLauncher::new();
    let coordinator = Coordinator::new(
        settings(&temp, 3, 1, 2),
        Arc::new(ScriptedProposer::new()),
        Arc::new(ScriptedJudge::new().with_scores(&[0.2, 0.4])),
        Arc::new(launcher.clone()),
    );

    let outcome = coordinator
        .run(sample_task(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.state.status, RunStatus::Completed);
    assert_eq!(launcher.launches(), vec![0]);

    let store = ArtifactStore::new(temp.path());
    let expected = MockGateway::fingerprint_for("default");
    for index in 1..=3 {
        let attempt = store.attempt(outcome.run_id(), &AttemptId::from_index(index));
        let fingerprint =
            fs::read_to_string(attempt.iteration_dir(0).join("fingerprint.txt")).unwrap();
        assert_eq!(fingerprint.trim(), expected);
    }

    // Only the last attempt's actions survive on the shared instance
    let gateway = &launcher.gateways()[0];
    assert_eq!(gateway.reset_count(), 3);
    assert_eq!(gateway.applied_actions().len(), 2);
}

#[tokio::test]
async fn test_resume_continues_without_repeating_committed_iterations() {
    let temp = TempDir::new().unwrap();
    let mut config = settings(&temp, 2, 1, 4);
    // Constant scores must not stop the attempts early
    config.run.stagnation_window = 10;
    config.run.history_window = 10;

    let cancel = CancellationToken::new();
    let first = Coordinator::new(
        config.clone(),
        Arc::new(ScriptedProposer::new().with_delay(Duration::from_millis(50))),
        Arc::new(ScriptedJudge::new()),
        Arc::new(MockLauncher::new()),
    );
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(130)).await;
        trigger.cancel();
    });
    let interrupted = first.run(sample_task(), cancel).await.unwrap();
    assert_eq!(interrupted.state.status, RunStatus::Cancelled);

    let committed: u32 = interrupted
        .state
        .completed
        .values()
        .map(|r| r.iterations_run)
        .sum();
    assert!(committed < 8);

    let proposer = ScriptedProposer::new();
    let resumed = Coordinator::new(
        config,
        Arc::new(proposer.clone()),
        Arc::new(ScriptedJudge::new()),
        Arc::new(MockLauncher::new()),
    )
    .resume(interrupted.run_id(), CancellationToken::new())
    .await
    .unwrap();

    assert_eq!(resumed.state.status, RunStatus::Completed);
    assert!(resumed.state.all_completed());
    for result in resumed.state.completed.values() {
        assert_eq!(result.status, AttemptStatus::BudgetExhausted);
        assert_eq!(result.iterations_run, 4);
    }
    assert_eq!(proposer.call_count(), 8 - committed);
}
