//! Prompt rendering for command-backed providers.

use std::fmt::Write as _;
use std::path::Path;

use super::{AssessmentRequest, ProposalRequest};

/// Marker a proposer may emit in its plan when it believes the task is done.
pub const COMPLETION_MARKER: &str = "OBJECTIVE COMPLETE";

/// Reminder appended after an unparseable proposal.
pub const PROPOSAL_FORMAT_REMINDER: &str = "Your previous answer could not be parsed. \
Reply with a short plan followed by exactly one fenced ```python code block containing the action.";

/// Reminder appended after an unparseable verdict.
pub const VERDICT_FORMAT_REMINDER: &str = "Your previous verdict could not be parsed. \
Reply with a single JSON object: {\"overall_score\": <0..1>, \"is_satisfactory\": <bool>, \
\"issues\": [...], \"specific_suggestions\": [...]}.";

/// Render the proposer prompt.
#[must_use]
pub fn render_proposal(request: &ProposalRequest<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task\n{}\n", request.task.description.trim());
    let _ = writeln!(out, "# Strategy\n{}\n", request.strategy);
    let _ = writeln!(out, "# Iteration\n{}\n", request.iteration);

    match request.snapshot {
        Some(snapshot) => {
            let _ = writeln!(
                out,
                "# Current State ({})\n{}\n",
                snapshot.id,
                snapshot.description.trim()
            );
        }
        None => out.push_str("# Current State\nBaseline, nothing applied yet.\n\n"),
    }

    if let Some(feedback) = request.feedback {
        let _ = writeln!(out, "# Last Feedback\nScore: {:.2}", feedback.score);
        push_list(&mut out, "Issues", &feedback.issues);
        push_list(&mut out, "Suggestions", &feedback.suggestions);
        out.push('\n');
    }

    if !request.history.is_empty() || request.history.summary().is_some() {
        let _ = writeln!(out, "# History\n{}", request.history.render());
    }

    if let Some(correction) = request.correction {
        out.push_str("# Correction Needed\n");
        if let Some(result) = request.last_result {
            if !result.output.trim().is_empty() {
                let _ = writeln!(out, "Output of the rejected action:\n{}", result.output.trim());
            }
        }
        let _ = writeln!(out, "{}\n", correction.trim());
    }

    out.push_str(
        "# Response Format\nWrite a short plan, then one fenced ```python block with the action.\n",
    );
    let _ = writeln!(
        out,
        "If the task is already satisfied, say {COMPLETION_MARKER} in the plan."
    );
    out
}

/// Render the judge prompt. `view_paths` are files the judge can open.
#[must_use]
pub fn render_assessment(request: &AssessmentRequest<'_>, view_paths: &[&Path]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task\n{}\n", request.task.description.trim());

    if let Some(snapshot) = request.snapshot {
        let _ = writeln!(
            out,
            "# Current State ({})\n{}\n",
            snapshot.id,
            snapshot.description.trim()
        );
    }

    if !request.references.is_empty() {
        out.push_str("# Reference Files\n");
        for path in request.references {
            let _ = writeln!(out, "- {}", path.display());
        }
        out.push('\n');
    }

    if !view_paths.is_empty() {
        out.push_str("# Diagnostic Views\n");
        for path in view_paths {
            let _ = writeln!(out, "- {}", path.display());
        }
        out.push('\n');
    }

    if let Some(correction) = request.correction {
        let _ = writeln!(out, "# Correction Needed\n{}\n", correction.trim());
    }

    out.push_str(
        "# Response Format\nReply with one JSON object with keys \
overall_score (0..1), is_satisfactory (bool), issues (list), specific_suggestions (list).\n",
    );
    out
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{title}:");
    for item in items {
        let _ = writeln!(out, "- {item}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Views;
    use crate::history::{HistoryEntry, HistoryManager};
    use crate::state::{ExecutionResult, Feedback, Snapshot, TaskSpec};
    use std::path::PathBuf;

    #[test]
    fn test_render_proposal_includes_context() {
        let task = TaskSpec::new("a red cube");
        let mut history = HistoryManager::new(3);
        history.push(HistoryEntry::new(1, "add cube", 0.4, &["too small".to_string()]));
        let snapshot = Snapshot {
            id: "s1".into(),
            description: "one grey cube".into(),
        };
        let feedback = Feedback {
            score: 0.4,
            issues: vec!["too small".into()],
            suggestions: vec!["scale up".into()],
            complete: false,
        };
        let request = ProposalRequest {
            task: &task,
            strategy: "incremental",
            iteration: 2,
            snapshot: Some(&snapshot),
            feedback: Some(&feedback),
            history: &history,
            last_result: None,
            correction: None,
        };

        let prompt = render_proposal(&request);
        assert!(prompt.contains("a red cube"));
        assert!(prompt.contains("incremental"));
        assert!(prompt.contains("one grey cube"));
        assert!(prompt.contains("- scale up"));
        assert!(prompt.contains("## Iteration 1"));
        assert!(!prompt.contains("# Correction Needed"));
    }

    #[test]
    fn test_render_proposal_with_correction() {
        let task = TaskSpec::new("t");
        let history = HistoryManager::new(3);
        let result = ExecutionResult {
            ok: false,
            output: "Traceback: NameError".into(),
            error: Some("NameError".into()),
        };
        let request = ProposalRequest {
            task: &task,
            strategy: "direct",
            iteration: 1,
            snapshot: None,
            feedback: None,
            history: &history,
            last_result: Some(&result),
            correction: Some("Execution failed: NameError"),
        };
        let prompt = render_proposal(&request);
        assert!(prompt.contains("Baseline, nothing applied yet."));
        assert!(prompt.contains("# Correction Needed"));
        assert!(prompt.contains("Traceback: NameError"));
        assert!(!prompt.contains("# History"));
    }

    #[test]
    fn test_render_assessment_lists_files() {
        let task = TaskSpec::new("t").with_references(vec![PathBuf::from("ref.png")]);
        let views = Views::new();
        let request = AssessmentRequest {
            task: &task,
            snapshot: None,
            views: &views,
            references: &task.references,
            correction: Some(VERDICT_FORMAT_REMINDER),
        };
        let view = PathBuf::from("/tmp/front.png");
        let prompt = render_assessment(&request, &[view.as_path()]);
        assert!(prompt.contains("- ref.png"));
        assert!(prompt.contains("- /tmp/front.png"));
        assert!(prompt.contains("overall_score"));
    }
}
