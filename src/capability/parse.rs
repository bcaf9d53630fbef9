//! Parsing of free-form provider output.
//!
//! Proposers answer with prose plus a fenced code block, judges with a
//! JSON verdict that may be wrapped in prose or a ```json fence. Anything
//! that does not fit becomes a [`ProviderError::Format`], which the engine
//! answers with a format reminder on its next fast retry.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::ProviderError;
use crate::state::{Feedback, Proposal};

/// Languages preferred when a response contains several code blocks.
const PREFERRED_LANGUAGES: &[&str] = &["python", "py"];

/// Plan text used when the proposer gave none.
const NO_PLAN: &str = "(no plan given)";

/// A fenced code block found in provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock<'a> {
    /// Info string after the opening fence, lowercased by the caller.
    pub language: &'a str,
    pub body: &'a str,
    /// Byte offset of the opening fence.
    pub start: usize,
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```([A-Za-z0-9_+\-]*)[ \t]*\r?\n(.*?)```").ok())
        .as_ref()
}

/// All fenced blocks in order of appearance.
#[must_use]
pub fn code_blocks(text: &str) -> Vec<CodeBlock<'_>> {
    let Some(re) = fence_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(CodeBlock {
                language: caps.get(1).map_or("", |m| m.as_str()),
                body: caps.get(2).map_or("", |m| m.as_str()),
                start: whole.start(),
            })
        })
        .collect()
}

/// Pick the action block: a preferred-language block first, else the first
/// block that is not JSON.
///
/// ```
/// use converge::capability::parse::extract_code_block;
///
/// let text = "Plan\n```json\n{}\n```\n```python\nprint(1)\n```";
/// assert_eq!(extract_code_block(text).map(|b| b.body.trim()), Some("print(1)"));
/// ```
#[must_use]
pub fn extract_code_block(text: &str) -> Option<CodeBlock<'_>> {
    let blocks = code_blocks(text);
    blocks
        .iter()
        .find(|b| {
            PREFERRED_LANGUAGES
                .iter()
                .any(|l| b.language.eq_ignore_ascii_case(l))
        })
        .or_else(|| {
            blocks
                .iter()
                .find(|b| !b.language.eq_ignore_ascii_case("json"))
        })
        .cloned()
}

/// Parse proposer output into a plan and an action.
pub fn parse_proposal(raw: &str) -> Result<Proposal, ProviderError> {
    let block = extract_code_block(raw)
        .ok_or_else(|| ProviderError::format("no fenced code block with an action", raw))?;

    let action = block.body.trim();
    if action.is_empty() {
        return Err(ProviderError::format("action code block is empty", raw));
    }

    let plan = clean_plan(&raw[..block.start]);
    Ok(Proposal {
        plan: if plan.is_empty() {
            NO_PLAN.to_string()
        } else {
            plan
        },
        action: action.to_string(),
    })
}

/// Strip a leading "Plan:" or "## Plan" header from the prose.
fn clean_plan(prose: &str) -> String {
    let trimmed = prose.trim();
    let without_header = trimmed
        .strip_prefix("## Plan")
        .or_else(|| trimmed.strip_prefix("Plan:"))
        .unwrap_or(trimmed);
    without_header.trim().to_string()
}

/// Locate the JSON object in judge output: a ```json block first, else the
/// outermost braces.
///
/// ```
/// use converge::capability::parse::extract_json_object;
///
/// assert_eq!(extract_json_object("verdict: {\"score\": 1} done"), Some("{\"score\": 1}"));
/// assert_eq!(extract_json_object("no json here"), None);
/// ```
#[must_use]
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(block) = code_blocks(text)
        .into_iter()
        .find(|b| b.language.eq_ignore_ascii_case("json"))
    {
        return Some(block.body.trim());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse judge output into [`Feedback`].
///
/// Accepts `overall_score`/`score`, `is_satisfactory`/`complete`,
/// `issues` and `specific_suggestions`/`suggestions`.
pub fn parse_feedback(raw: &str) -> Result<Feedback, ProviderError> {
    let json = extract_json_object(raw)
        .ok_or_else(|| ProviderError::format("no JSON object in verdict", raw))?;

    let value: Value = serde_json::from_str(json)
        .map_err(|e| ProviderError::format(format!("invalid JSON verdict: {e}"), raw))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ProviderError::format("verdict is not a JSON object", raw))?;

    let score = obj
        .get("overall_score")
        .or_else(|| obj.get("score"))
        .and_then(Value::as_f64)
        .ok_or_else(|| ProviderError::format("verdict has no numeric score", raw))?;
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(ProviderError::format(
            format!("score {score} is outside [0, 1]"),
            raw,
        ));
    }

    let complete = obj
        .get("is_satisfactory")
        .or_else(|| obj.get("complete"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(Feedback {
        score,
        issues: string_list(obj.get("issues")),
        suggestions: string_list(
            obj.get("specific_suggestions")
                .or_else(|| obj.get("suggestions")),
        ),
        complete,
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .filter(|s| !s.trim().is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proposal_with_python_block() {
        let raw = "Plan: add a red cube at the origin\n\n```python\nadd_cube(color='red')\n```\n";
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.plan, "add a red cube at the origin");
        assert_eq!(proposal.action, "add_cube(color='red')");
    }

    #[test]
    fn test_parse_proposal_falls_back_to_generic_block() {
        let raw = "## Plan\nMove it\n```\nmove(1, 2)\n```";
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.plan, "Move it");
        assert_eq!(proposal.action, "move(1, 2)");
    }

    #[test]
    fn test_parse_proposal_prefers_python_over_earlier_block() {
        let raw = "```text\nnot this\n```\n```python\nthis()\n```";
        assert_eq!(parse_proposal(raw).unwrap().action, "this()");
    }

    #[test]
    fn test_parse_proposal_without_block_is_format_error() {
        let err = parse_proposal("I would add a cube").unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_parse_proposal_empty_block_is_format_error() {
        let err = parse_proposal("```python\n   \n```").unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_parse_proposal_without_plan_uses_placeholder() {
        let proposal = parse_proposal("```python\nx()\n```").unwrap();
        assert_eq!(proposal.plan, NO_PLAN);
    }

    #[test]
    fn test_parse_feedback_alternate_field_names() {
        let raw = r#"Here is my verdict:
```json
{"overall_score": 0.72, "is_satisfactory": false,
 "issues": ["too dark"], "specific_suggestions": ["add a light"]}
```"#;
        let feedback = parse_feedback(raw).unwrap();
        assert_eq!(feedback.score, 0.72);
        assert!(!feedback.complete);
        assert_eq!(feedback.issues, vec!["too dark"]);
        assert_eq!(feedback.suggestions, vec!["add a light"]);
    }

    #[test]
    fn test_parse_feedback_bare_object_short_names() {
        let raw = r#"{"score": 1.0, "complete": true, "issues": [], "suggestions": "none needed"}"#;
        let feedback = parse_feedback(raw).unwrap();
        assert_eq!(feedback.score, 1.0);
        assert!(feedback.complete);
        assert!(feedback.issues.is_empty());
        assert_eq!(feedback.suggestions, vec!["none needed"]);
    }

    #[test]
    fn test_parse_feedback_rejects_out_of_range_score() {
        assert!(parse_feedback(r#"{"score": 7}"#).unwrap_err().is_format());
        assert!(parse_feedback(r#"{"score": -0.1}"#).unwrap_err().is_format());
    }

    #[test]
    fn test_parse_feedback_rejects_missing_score() {
        assert!(parse_feedback(r#"{"issues": []}"#).unwrap_err().is_format());
    }

    #[test]
    fn test_parse_feedback_rejects_garbage() {
        assert!(parse_feedback("looks great!").unwrap_err().is_format());
        assert!(parse_feedback("{not json}").unwrap_err().is_format());
    }
}
