//! Winner selection and scoreboard assembly.
//!
//! Two selection paths exist: a score-driven one where an external judge
//! has already written numeric scores into the completion data, and a
//! heuristic one that measures the size of each finished candidate's
//! change against the main line. The exact weights of the heuristic are a
//! private policy; the load-bearing guarantee is the ordering — larger
//! meaningful diff plus done beats smaller, ties go to declaration order,
//! and a candidate with no change stays at the floor.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::error::ContractViolation;
use crate::io::git::Git;
use crate::types::{CandidateInfo, CompletionStatus, ScoreEntry, SelectionDecision};

/// Score for a finished candidate whose workspace shows no change.
const NO_CHANGE_FLOOR: i64 = 10;
/// Base score for a finished candidate with a non-empty diff.
const DIFF_BASE: i64 = 60;
/// Diff size contribution is capped so huge diffs cannot dominate forever.
const DIFF_CAP: i64 = 35;

/// Capability the orchestrator requires of any judge.
pub trait Selector {
    /// Produce exactly one selected key drawn from the candidate set.
    fn select_best(
        &self,
        candidates: &[CandidateInfo],
        completion: &BTreeMap<String, CompletionStatus>,
    ) -> Result<SelectionDecision>;
}

/// Merge, per candidate, the decision's score/comment with the
/// candidate's completion flag. Candidates missing from the decision
/// default to score 0 with no comment; the output always has exactly one
/// entry per candidate.
pub fn finalize_scores(
    candidates: &[CandidateInfo],
    decision: &SelectionDecision,
    completion: &BTreeMap<String, CompletionStatus>,
) -> BTreeMap<String, ScoreEntry> {
    candidates
        .iter()
        .map(|candidate| {
            let score = decision.scores.get(&candidate.key).copied().unwrap_or(0);
            let comment = decision.comments.get(&candidate.key).cloned();
            let done = completion
                .get(&candidate.session_id)
                .map(|status| status.done)
                .unwrap_or(false);
            (
                candidate.key.clone(),
                ScoreEntry {
                    score,
                    comment,
                    done,
                },
            )
        })
        .collect()
}

/// Score-driven path: pick the candidate whose session carries the
/// maximum numeric score in the completion data, ties broken by
/// declaration order.
pub fn select_best(
    candidates: &[CandidateInfo],
    completion: &BTreeMap<String, CompletionStatus>,
) -> Result<SelectionDecision> {
    ensure_candidates(candidates)?;

    let mut scores = BTreeMap::new();
    let mut best: Option<(&CandidateInfo, i64)> = None;
    for candidate in candidates {
        let score = completion
            .get(&candidate.session_id)
            .and_then(|status| status.score)
            .unwrap_or(0);
        scores.insert(candidate.key.clone(), score);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }

    // ensure_candidates guarantees at least one entry.
    let (winner, score) = best.ok_or_else(|| ContractViolation::new("empty candidate set"))?;
    debug!(selected = %winner.key, score, "score-driven selection");
    Ok(SelectionDecision {
        selected: winner.key.clone(),
        scores,
        comments: BTreeMap::new(),
    })
}

/// Heuristic path: measure each finished candidate's change size with
/// `measure` and let the largest meaningful change win.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub fn auto_select<F>(
    candidates: &[CandidateInfo],
    completion: &BTreeMap<String, CompletionStatus>,
    measure: F,
) -> Result<(SelectionDecision, BTreeMap<String, ScoreEntry>)>
where
    F: Fn(&CandidateInfo) -> Result<u64>,
{
    ensure_candidates(candidates)?;

    let mut scores = BTreeMap::new();
    let mut comments = BTreeMap::new();
    let mut best: Option<(&CandidateInfo, i64)> = None;
    for candidate in candidates {
        let done = completion
            .get(&candidate.session_id)
            .map(|status| status.done)
            .unwrap_or(false);
        let score = if !done {
            0
        } else if candidate.workspace.is_none() {
            // The base session has no isolated workspace to diff.
            0
        } else {
            let diff_size = measure(candidate)?;
            comments.insert(
                candidate.key.clone(),
                format!("{diff_size} lines changed"),
            );
            if diff_size == 0 {
                NO_CHANGE_FLOOR
            } else {
                DIFF_BASE + (diff_size as i64).min(DIFF_CAP)
            }
        };
        scores.insert(candidate.key.clone(), score);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }

    let (winner, score) = best.ok_or_else(|| ContractViolation::new("empty candidate set"))?;
    debug!(selected = %winner.key, score, "auto selection");
    let decision = SelectionDecision {
        selected: winner.key.clone(),
        scores,
        comments,
    };
    let scoreboard = finalize_scores(candidates, &decision, completion);
    Ok((decision, scoreboard))
}

fn ensure_candidates(candidates: &[CandidateInfo]) -> Result<()> {
    if candidates.is_empty() {
        return Err(ContractViolation::new("selection requires a non-empty candidate set").into());
    }
    Ok(())
}

/// Judge that trusts scores already present in the completion data.
#[derive(Debug, Default)]
pub struct ScoreSelector;

impl Selector for ScoreSelector {
    fn select_best(
        &self,
        candidates: &[CandidateInfo],
        completion: &BTreeMap<String, CompletionStatus>,
    ) -> Result<SelectionDecision> {
        select_best(candidates, completion)
    }
}

/// Judge that measures real diff sizes against the main line inside each
/// candidate's worktree.
#[derive(Debug)]
pub struct AutoSelector {
    main_ref: String,
}

impl AutoSelector {
    pub fn new(main_ref: impl Into<String>) -> Self {
        Self {
            main_ref: main_ref.into(),
        }
    }
}

impl Selector for AutoSelector {
    fn select_best(
        &self,
        candidates: &[CandidateInfo],
        completion: &BTreeMap<String, CompletionStatus>,
    ) -> Result<SelectionDecision> {
        let (decision, _) = auto_select(candidates, completion, |candidate| {
            let workspace = candidate
                .workspace
                .as_ref()
                .ok_or_else(|| ContractViolation::new("candidate without workspace measured"))?;
            Git::new(workspace).diff_size(&self.main_ref)
        })?;
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, session: &str, with_workspace: bool) -> CandidateInfo {
        CandidateInfo {
            key: key.to_string(),
            label: key.to_string(),
            session_id: session.to_string(),
            branch: with_workspace.then(|| format!("pardev/test/{key}")),
            workspace: with_workspace.then(|| std::path::PathBuf::from(format!("/tmp/{key}"))),
        }
    }

    fn status(done: bool, score: Option<i64>) -> CompletionStatus {
        CompletionStatus { done, score }
    }

    #[test]
    fn select_best_prefers_highest_score() {
        let candidates = vec![
            candidate("worker-1", "session-a", true),
            candidate("worker-2", "session-b", true),
            candidate("worker-3", "session-c", true),
        ];
        let completion = BTreeMap::from([
            ("session-a".to_string(), status(true, Some(75))),
            ("session-b".to_string(), status(true, Some(90))),
            ("session-c".to_string(), status(true, Some(40))),
        ]);

        let decision = select_best(&candidates, &completion).expect("select");
        assert_eq!(decision.selected, "worker-2");
        assert_eq!(decision.scores["worker-2"], 90);
    }

    #[test]
    fn select_best_breaks_ties_by_declaration_order() {
        let candidates = vec![
            candidate("worker-1", "session-a", true),
            candidate("worker-2", "session-b", true),
        ];
        let completion = BTreeMap::from([
            ("session-a".to_string(), status(true, Some(50))),
            ("session-b".to_string(), status(true, Some(50))),
        ]);

        let decision = select_best(&candidates, &completion).expect("select");
        assert_eq!(decision.selected, "worker-1");
    }

    #[test]
    fn select_best_rejects_empty_candidate_set() {
        let err = select_best(&[], &BTreeMap::new()).unwrap_err();
        assert!(err.downcast_ref::<ContractViolation>().is_some());
    }

    #[test]
    fn finalize_scores_covers_every_candidate() {
        let candidates = vec![
            candidate("main", "session-main", false),
            candidate("worker-1", "session-a", true),
        ];
        let decision = SelectionDecision {
            selected: "worker-1".to_string(),
            scores: BTreeMap::from([("worker-1".to_string(), 88)]),
            comments: BTreeMap::from([("worker-1".to_string(), "solid".to_string())]),
        };
        let completion = BTreeMap::from([("session-a".to_string(), status(true, None))]);

        let scoreboard = finalize_scores(&candidates, &decision, &completion);
        assert_eq!(scoreboard.len(), candidates.len());
        assert_eq!(scoreboard["worker-1"].score, 88);
        assert_eq!(scoreboard["worker-1"].comment.as_deref(), Some("solid"));
        assert!(scoreboard["worker-1"].done);
        // Missing from the decision: zero score, no comment, not done.
        assert_eq!(scoreboard["main"].score, 0);
        assert!(scoreboard["main"].comment.is_none());
        assert!(!scoreboard["main"].done);
    }

    #[test]
    fn auto_select_prefers_largest_done_diff() {
        let candidates = vec![
            candidate("worker-1", "session-a", true),
            candidate("worker-2", "session-b", true),
            candidate("worker-3", "session-c", true),
        ];
        let completion = BTreeMap::from([
            ("session-a".to_string(), status(true, None)),
            ("session-b".to_string(), status(true, None)),
            ("session-c".to_string(), status(false, None)),
        ]);
        let sizes =
            BTreeMap::from([("worker-1".to_string(), 12u64), ("worker-2".to_string(), 40)]);

        let (decision, scoreboard) = auto_select(&candidates, &completion, |candidate| {
            Ok(sizes.get(&candidate.key).copied().unwrap_or(0))
        })
        .expect("auto select");

        assert_eq!(decision.selected, "worker-2");
        assert!(decision.scores["worker-2"] > decision.scores["worker-1"]);
        assert_eq!(decision.scores["worker-3"], 0);
        assert_eq!(scoreboard.len(), candidates.len());
        assert!(!scoreboard["worker-3"].done);
    }

    #[test]
    fn auto_select_floors_no_change_candidates() {
        let candidates = vec![
            candidate("worker-1", "session-a", true),
            candidate("worker-2", "session-b", true),
        ];
        let completion = BTreeMap::from([
            ("session-a".to_string(), status(true, None)),
            ("session-b".to_string(), status(true, None)),
        ]);

        let (decision, _) = auto_select(&candidates, &completion, |candidate| {
            Ok(if candidate.key == "worker-2" { 3 } else { 0 })
        })
        .expect("auto select");

        assert_eq!(decision.selected, "worker-2");
        assert!(decision.scores["worker-1"] <= NO_CHANGE_FLOOR);
        assert!(decision.scores["worker-1"] > 0, "done still beats not-done");
    }

    #[test]
    fn auto_select_ties_go_to_declaration_order() {
        let candidates = vec![
            candidate("worker-1", "session-a", true),
            candidate("worker-2", "session-b", true),
        ];
        let completion = BTreeMap::from([
            ("session-a".to_string(), status(true, None)),
            ("session-b".to_string(), status(true, None)),
        ]);

        let (decision, _) =
            auto_select(&candidates, &completion, |_| Ok(7)).expect("auto select");
        assert_eq!(decision.selected, "worker-1");
    }

    #[test]
    fn auto_select_rejects_empty_candidate_set() {
        let err = auto_select(&[], &BTreeMap::new(), |_| Ok(0)).unwrap_err();
        assert!(err.downcast_ref::<ContractViolation>().is_some());
    }
}
