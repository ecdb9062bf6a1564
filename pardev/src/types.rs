//! Value types shared across the cycle pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One competitor in a cycle. Immutable once built: the orchestrator
/// assembles the candidate set after forking and hands it unchanged to
/// selection and scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateInfo {
    /// Stable key, e.g. `worker-2` or `main`.
    pub key: String,
    /// Human-facing label for scoreboard rendering.
    pub label: String,
    /// Session id the candidate's agent is bound to.
    pub session_id: String,
    /// Branch carrying the candidate's work. `None` for the base session,
    /// which has nothing to merge.
    pub branch: Option<String>,
    /// Isolated checkout the candidate worked in.
    pub workspace: Option<PathBuf>,
}

/// Per-session completion state reported by the monitor.
///
/// `score` is populated only on the external-judge path, where the judge
/// writes its verdict into the completion data before selection runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
}

/// A selector's verdict: exactly one selected key, which must be a member
/// of the candidate set, plus per-candidate scores and optional comments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionDecision {
    pub selected: String,
    pub scores: BTreeMap<String, i64>,
    pub comments: BTreeMap<String, String>,
}

/// One scoreboard row, produced by merging a decision with completion data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoreEntry {
    pub score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub done: bool,
}

/// Return value for a full orchestration cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestrationResult {
    /// Session promoted to the main lineage.
    pub selected_session: String,
    /// Candidate key -> score/comment/done.
    pub scoreboard: BTreeMap<String, ScoreEntry>,
    /// Informational outcome: the instruction asked the live main session
    /// to continue, so no race was run and no state should advance.
    pub continue_requested: bool,
}

/// Stable pane identifiers for the fixed one-main/one-boss/N-worker
/// topology, in creation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneLayout {
    pub main: String,
    pub boss: String,
    pub workers: Vec<String>,
}

impl PaneLayout {
    /// Total pane count; always `workers + 2` for a well-formed layout.
    pub fn pane_count(&self) -> usize {
        self.workers.len() + 2
    }
}
