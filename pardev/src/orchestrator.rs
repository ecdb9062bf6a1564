//! One full race cycle: provision, fork, dispatch, await, select, promote.
//!
//! The orchestrator owns no policy of its own beyond sequencing. Workspace
//! provisioning, terminal control, completion monitoring, and judging all
//! arrive as trait objects of the caller's choosing, which is also how the
//! cycle pipeline is exercised without tmux or a live agent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::error::{ConfigurationError, ContractViolation};
use crate::io::cycle_log::{CycleLog, CycleRecord};
use crate::io::git::Git;
use crate::io::monitor::SessionWatcher;
use crate::io::tmux::LayoutDriver;
use crate::io::worktree::{WorkspaceProvider, WorktreeManager};
use crate::selection::{Selector, finalize_scores};
use crate::types::{CandidateInfo, OrchestrationResult, PaneLayout};

/// An instruction equal to this marker asks the live main session to keep
/// going instead of racing workers.
pub const CONTINUE_MARKER: &str = "/continue";

/// Candidate key reserved for the base session racing in place.
pub const MAIN_KEY: &str = "main";

/// Sequences one cycle end to end over pluggable collaborators.
pub struct Orchestrator<L, W, M> {
    layout: L,
    workspace: W,
    monitor: M,
    log: CycleLog,
    session_name: String,
    worker_count: usize,
    completion_timeout: Duration,
    poll_interval: Duration,
    auto_commit: bool,
}

impl<L, W, M> Orchestrator<L, W, M>
where
    L: LayoutDriver,
    W: WorkspaceProvider,
    M: SessionWatcher,
{
    pub fn new(
        layout: L,
        workspace: W,
        monitor: M,
        log: CycleLog,
        session_name: impl Into<String>,
        worker_count: usize,
    ) -> Self {
        Self {
            layout,
            workspace,
            monitor,
            log,
            session_name: session_name.into(),
            worker_count,
            completion_timeout: Duration::from_secs(1800),
            poll_interval: Duration::from_secs(2),
            auto_commit: false,
        }
    }

    pub fn with_completion_window(mut self, timeout: Duration, interval: Duration) -> Self {
        self.completion_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Run one cycle for `instruction`.
    ///
    /// `resume_session_id` overrides the captured main-pane session as the
    /// fork base, which is how a later cycle builds on an earlier winner.
    /// `on_main_session` fires as soon as the base session for this cycle
    /// is known, before any long wait, so the caller can target a
    /// cancellation rollback at it.
    #[instrument(skip_all, fields(session_name = %self.session_name))]
    pub fn run_cycle<S: Selector>(
        &mut self,
        instruction: &str,
        selector: &S,
        resume_session_id: Option<&str>,
        on_main_session: &mut dyn FnMut(&str),
    ) -> Result<OrchestrationResult> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(ContractViolation::new("instruction must be non-empty").into());
        }

        let workspaces = self.workspace.prepare()?;
        let layout = self
            .layout
            .ensure_layout(&self.session_name, self.worker_count)?;
        if layout.workers.len() != self.worker_count {
            return Err(ConfigurationError::new(format!(
                "layout has {} worker panes, wanted {}",
                layout.workers.len(),
                self.worker_count
            ))
            .into());
        }

        self.layout.launch_main_session(&layout.main)?;
        self.layout.launch_boss_session(&layout.boss)?;

        // The instruction lands in the main pane first so the base session
        // owns it in its history, then the pane is interrupted: workers
        // race it, not main.
        self.layout
            .send_instruction_to_pane(&layout.main, instruction)?;
        self.layout.interrupt_pane(&layout.main)?;
        let captured = self.monitor.capture_instruction(&layout.main, instruction)?;
        let base_session = resume_session_id.unwrap_or(&captured).to_string();
        on_main_session(&base_session);

        if instruction == CONTINUE_MARKER {
            info!(session_id = %base_session, "continue requested, skipping race");
            return Ok(OrchestrationResult {
                selected_session: base_session,
                scoreboard: BTreeMap::new(),
                continue_requested: true,
            });
        }

        let fork_map = self.layout.fork_workers(&layout.workers, &base_session)?;
        let pane_paths = pane_workspaces(&layout, &workspaces);
        self.layout.resume_workers(&fork_map, &pane_paths)?;
        self.layout
            .send_instruction_to_workers(&fork_map, instruction)?;

        let session_ids: Vec<String> = fork_map.values().cloned().collect();
        let completion = self.monitor.await_completion(
            &session_ids,
            self.completion_timeout,
            self.poll_interval,
        );

        let candidates = self.build_candidates(&layout, &fork_map, &workspaces, &base_session);
        let decision = selector.select_best(&candidates, &completion)?;
        let winner = candidates
            .iter()
            .find(|candidate| candidate.key == decision.selected)
            .ok_or_else(|| {
                ContractViolation::new(format!(
                    "selector chose '{}' which is not a candidate",
                    decision.selected
                ))
            })?;
        let scoreboard = finalize_scores(&candidates, &decision, &completion);
        info!(winner = %winner.key, session_id = %winner.session_id, "cycle winner");

        if winner.session_id != base_session {
            self.layout
                .promote_to_main(&winner.session_id, &layout.main)?;
        }
        if let Some(branch) = &winner.branch {
            if self.auto_commit
                && let Some(path) = &winner.workspace
            {
                commit_outstanding(path, instruction)?;
            }
            self.workspace.merge_into_main(branch)?;
        }

        let result = OrchestrationResult {
            selected_session: winner.session_id.clone(),
            scoreboard,
            continue_requested: false,
        };
        // Audit only; a failed write never undoes a completed cycle.
        if let Err(err) = self.log.record_cycle(&CycleRecord {
            instruction,
            layout: &layout,
            fork_map: &fork_map,
            completion: &completion,
            result: &result,
        }) {
            warn!(err = %err, "failed to record cycle audit document");
        }
        Ok(result)
    }

    /// The base session always competes; a worker competes only if its
    /// pane rebound to a forked session.
    fn build_candidates(
        &self,
        layout: &PaneLayout,
        fork_map: &BTreeMap<String, String>,
        workspaces: &BTreeMap<String, PathBuf>,
        base_session: &str,
    ) -> Vec<CandidateInfo> {
        let mut candidates = vec![CandidateInfo {
            key: MAIN_KEY.to_string(),
            label: MAIN_KEY.to_string(),
            session_id: base_session.to_string(),
            branch: None,
            workspace: None,
        }];
        for (index, pane) in layout.workers.iter().enumerate() {
            let Some(session_id) = fork_map.get(pane) else {
                warn!(pane, "worker pane missing from fork map, not a candidate");
                continue;
            };
            let key = WorktreeManager::worker_key(index + 1);
            candidates.push(CandidateInfo {
                label: key.clone(),
                session_id: session_id.clone(),
                branch: Some(self.workspace.worker_branch(&key)),
                workspace: workspaces.get(&key).cloned(),
                key,
            });
        }
        candidates
    }
}

/// Map worker panes (creation order) onto their worker-keyed checkouts.
fn pane_workspaces(
    layout: &PaneLayout,
    workspaces: &BTreeMap<String, PathBuf>,
) -> BTreeMap<String, PathBuf> {
    layout
        .workers
        .iter()
        .enumerate()
        .filter_map(|(index, pane)| {
            let key = WorktreeManager::worker_key(index + 1);
            workspaces.get(&key).map(|path| (pane.clone(), path.clone()))
        })
        .collect()
}

/// Stage and commit whatever the winning workspace left uncommitted so
/// the merge carries the full result.
fn commit_outstanding(workspace: &std::path::Path, instruction: &str) -> Result<()> {
    let git = Git::new(workspace);
    git.add_all()?;
    if git.has_staged_changes()? {
        let subject: String = instruction.chars().take(50).collect();
        git.commit_staged(&format!("Auto-commit: {subject}"))
            .context("auto-commit winning workspace")?;
    }
    Ok(())
}
