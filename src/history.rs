//! Bounded iteration history with a rolling summary fold.
//!
//! The history keeps the last `window` iterations verbatim (as compressed
//! [`HistoryEntry`] values, never full payloads) and folds anything older
//! into a single [`RollingSummary`]. Memory stays bounded no matter how many
//! iterations an attempt runs, and the fold is a pure function of the entry
//! sequence so replaying the same outcomes reproduces the same history.
//!
//! # Example
//!
//! ```
//! use converge::history::{HistoryEntry, HistoryManager};
//!
//! let mut history = HistoryManager::new(2);
//! for (i, score) in [0.2, 0.4, 0.6].into_iter().enumerate() {
//!     history.push(HistoryEntry::new(i as u32 + 1, "plan", score, &[]));
//! }
//! assert_eq!(history.len(), 2);
//! assert_eq!(history.summary().map(|s| s.folded), Some(1));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::state::Feedback;

/// Default number of entries kept verbatim.
pub const DEFAULT_HISTORY_WINDOW: usize = 5;

/// Maximum characters of a plan kept in its digest.
const PLAN_DIGEST_CHARS: usize = 120;

/// Maximum issue tags recorded per entry.
const MAX_TAGS_PER_ENTRY: usize = 3;

/// Maximum distinct tags tracked by the rolling summary.
const MAX_SUMMARY_TAGS: usize = 32;

/// Words kept when normalizing an issue into a tag.
const TAG_WORDS: usize = 4;

/// Scores closer than this are reported as a flat trend.
const TREND_EPSILON: f64 = 0.01;

// ============================================================================
// History Entry
// ============================================================================

/// Compressed record of one semantic iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    /// Truncated first line of the plan plus a short content hash.
    pub plan_digest: String,
    pub score: f64,
    pub issue_count: usize,
    /// Normalized tags for the first few issues.
    pub issue_tags: Vec<String>,
}

impl HistoryEntry {
    /// Build an entry from raw iteration data.
    #[must_use]
    pub fn new(iteration: u32, plan: &str, score: f64, issues: &[String]) -> Self {
        Self {
            iteration,
            plan_digest: digest_plan(plan),
            score,
            issue_count: issues.len(),
            issue_tags: issues
                .iter()
                .map(|i| issue_tag(i))
                .filter(|t| !t.is_empty())
                .take(MAX_TAGS_PER_ENTRY)
                .collect(),
        }
    }

    /// Build an entry from a judged iteration.
    #[must_use]
    pub fn from_feedback(iteration: u32, plan: &str, feedback: &Feedback) -> Self {
        Self::new(iteration, plan, feedback.score, &feedback.issues)
    }
}

/// Compress a plan into a bounded digest.
fn digest_plan(plan: &str) -> String {
    let first_line = plan.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let head: String = first_line.chars().take(PLAN_DIGEST_CHARS).collect();
    let hash = hex::encode(Sha256::digest(plan.as_bytes()));
    format!("{head} [{}]", &hash[..8])
}

/// Normalize an issue description into a short, comparable tag.
///
/// ```
/// use converge::history::issue_tag;
///
/// assert_eq!(issue_tag("The Cube is TOO small!"), "the-cube-is-too");
/// ```
#[must_use]
pub fn issue_tag(issue: &str) -> String {
    issue
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .take(TAG_WORDS)
        .collect::<Vec<_>>()
        .join("-")
}

// ============================================================================
// Rolling Summary
// ============================================================================

/// Direction of the folded scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreTrend {
    Improving,
    Declining,
    Flat,
}

/// Fold of every entry evicted from the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingSummary {
    /// Number of entries folded so far.
    pub folded: u32,
    pub first_iteration: u32,
    pub last_iteration: u32,
    pub first_score: f64,
    pub last_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub score_sum: f64,
    /// Occurrence count per issue tag.
    pub tag_counts: BTreeMap<String, u32>,
}

impl RollingSummary {
    fn start(entry: &HistoryEntry) -> Self {
        let mut summary = Self {
            folded: 0,
            first_iteration: entry.iteration,
            last_iteration: entry.iteration,
            first_score: entry.score,
            last_score: entry.score,
            min_score: entry.score,
            max_score: entry.score,
            score_sum: 0.0,
            tag_counts: BTreeMap::new(),
        };
        summary.fold(entry);
        summary
    }

    fn fold(&mut self, entry: &HistoryEntry) {
        if self.folded > 0 {
            self.last_iteration = entry.iteration;
            self.last_score = entry.score;
            self.min_score = self.min_score.min(entry.score);
            self.max_score = self.max_score.max(entry.score);
        }
        self.folded += 1;
        self.score_sum += entry.score;
        for tag in &entry.issue_tags {
            self.count_tag(tag);
        }
    }

    fn count_tag(&mut self, tag: &str) {
        if let Some(count) = self.tag_counts.get_mut(tag) {
            *count += 1;
            return;
        }
        if self.tag_counts.len() >= MAX_SUMMARY_TAGS {
            // Evict the rarest tag; ties go to the lexicographically last so
            // the choice does not depend on insertion order.
            let victim = self
                .tag_counts
                .iter()
                .min_by(|(ta, ca), (tb, cb)| ca.cmp(cb).then_with(|| tb.cmp(ta)))
                .map(|(t, _)| t.clone());
            if let Some(victim) = victim {
                self.tag_counts.remove(&victim);
            }
        }
        self.tag_counts.insert(tag.to_string(), 1);
    }

    #[must_use]
    pub fn mean_score(&self) -> f64 {
        if self.folded == 0 {
            0.0
        } else {
            self.score_sum / f64::from(self.folded)
        }
    }

    #[must_use]
    pub fn trend(&self) -> ScoreTrend {
        let delta = self.last_score - self.first_score;
        if delta > TREND_EPSILON {
            ScoreTrend::Improving
        } else if delta < -TREND_EPSILON {
            ScoreTrend::Declining
        } else {
            ScoreTrend::Flat
        }
    }

    /// Tags seen at least twice, most frequent first.
    #[must_use]
    pub fn recurring_tags(&self, limit: usize) -> Vec<(&str, u32)> {
        let mut tags: Vec<(&str, u32)> = self
            .tag_counts
            .iter()
            .filter(|(_, c)| **c >= 2)
            .map(|(t, c)| (t.as_str(), *c))
            .collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        tags.truncate(limit);
        tags
    }
}

// ============================================================================
// History Manager
// ============================================================================

/// Bounded ordered history of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryManager {
    window: usize,
    entries: VecDeque<HistoryEntry>,
    summary: Option<RollingSummary>,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_WINDOW)
    }
}

impl HistoryManager {
    /// Create a history keeping `window` entries verbatim (at least one).
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            entries: VecDeque::with_capacity(window + 1),
            summary: None,
        }
    }

    /// Append an entry, folding the oldest one if the window is full.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.window {
            if let Some(evicted) = self.entries.pop_front() {
                match self.summary.as_mut() {
                    Some(summary) => summary.fold(&evicted),
                    None => self.summary = Some(RollingSummary::start(&evicted)),
                }
            }
        }
    }

    #[must_use]
    pub fn entries(&self) -> &VecDeque<HistoryEntry> {
        &self.entries
    }

    #[must_use]
    pub fn summary(&self) -> Option<&RollingSummary> {
        self.summary.as_ref()
    }

    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of entries ever recorded, folded or not.
    #[must_use]
    pub fn total_recorded(&self) -> u32 {
        let folded = self.summary.as_ref().map_or(0, |s| s.folded);
        folded + self.entries.len() as u32
    }

    /// The last `k` scores in order, or `None` if fewer than `k` exist in
    /// the window.
    #[must_use]
    pub fn recent_scores(&self, k: usize) -> Option<Vec<f64>> {
        if k == 0 || self.entries.len() < k {
            return None;
        }
        Some(
            self.entries
                .iter()
                .skip(self.entries.len() - k)
                .map(|e| e.score)
                .collect(),
        )
    }

    /// Render the summary and window as prompt text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.summary {
            let _ = writeln!(
                out,
                "## Earlier iterations {}-{} ({} folded)",
                summary.first_iteration, summary.last_iteration, summary.folded
            );
            let _ = writeln!(
                out,
                "Scores: first {:.2}, last {:.2}, min {:.2}, max {:.2}, mean {:.2} ({:?})",
                summary.first_score,
                summary.last_score,
                summary.min_score,
                summary.max_score,
                summary.mean_score(),
                summary.trend()
            );
            let recurring = summary.recurring_tags(5);
            if !recurring.is_empty() {
                let tags: Vec<String> =
                    recurring.iter().map(|(t, c)| format!("{t} (x{c})")).collect();
                let _ = writeln!(out, "Recurring issues: {}", tags.join(", "));
            }
            out.push('\n');
        }
        for entry in &self.entries {
            let _ = writeln!(out, "## Iteration {}", entry.iteration);
            let _ = writeln!(out, "Plan: {}", entry.plan_digest);
            let _ = write!(
                out,
                "Feedback: score {:.2}, {} issue(s)",
                entry.score, entry.issue_count
            );
            if !entry.issue_tags.is_empty() {
                let _ = write!(out, " [{}]", entry.issue_tags.join(", "));
            }
            out.push_str("\n\n");
        }
        out
    }
}
