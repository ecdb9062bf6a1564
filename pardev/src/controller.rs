//! Instruction-stream control: cancellation, rollback, and queue replay.
//!
//! Cycles are synchronous and long; the controller's job is deciding what
//! a finished cycle is allowed to change. A cycle that was cancelled while
//! running commits nothing, rolls the session lineage back to the snapshot
//! taken at cycle start, and replays the single queued instruction if one
//! arrived in the meantime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::monitor::SessionWatcher;
use crate::io::tmux::LayoutDriver;
use crate::io::worktree::WorkspaceProvider;
use crate::orchestrator::Orchestrator;
use crate::selection::Selector;
use crate::types::{OrchestrationResult, ScoreEntry};

/// One cycle run, however the cycle is implemented.
pub trait CycleRunner {
    fn run_cycle(
        &mut self,
        instruction: &str,
        resume_session_id: Option<&str>,
        on_main_session: &mut dyn FnMut(&str),
    ) -> Result<OrchestrationResult>;
}

/// The production runner: an orchestrator paired with a judge.
pub struct SelectorRunner<L, W, M, S> {
    orchestrator: Orchestrator<L, W, M>,
    selector: S,
}

impl<L, W, M, S> SelectorRunner<L, W, M, S> {
    pub fn new(orchestrator: Orchestrator<L, W, M>, selector: S) -> Self {
        Self {
            orchestrator,
            selector,
        }
    }
}

impl<L, W, M, S> CycleRunner for SelectorRunner<L, W, M, S>
where
    L: LayoutDriver,
    W: WorkspaceProvider,
    M: SessionWatcher,
    S: Selector,
{
    fn run_cycle(
        &mut self,
        instruction: &str,
        resume_session_id: Option<&str>,
        on_main_session: &mut dyn FnMut(&str),
    ) -> Result<OrchestrationResult> {
        self.orchestrator
            .run_cycle(instruction, &self.selector, resume_session_id, on_main_session)
    }
}

#[derive(Default)]
struct ControlState {
    /// Cycle ids marked cancelled. Checked once, after the cycle returns.
    cancelled: Mutex<BTreeSet<u64>>,
    /// Single replacement slot; a newer queued instruction overwrites an
    /// older one that never got to run.
    queued: Mutex<Option<String>>,
    current_cycle: AtomicU64,
}

/// Clonable handle for cancelling and queueing from outside the cycle
/// thread.
#[derive(Clone, Default)]
pub struct ControlHandle {
    inner: Arc<ControlState>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whichever cycle is currently running. A no-op between
    /// cycles (cycle id 0 is never run).
    pub fn cancel_current(&self) {
        let current = self.inner.current_cycle.load(Ordering::SeqCst);
        if current > 0 {
            self.cancel_cycle(current);
        }
    }

    pub fn cancel_cycle(&self, cycle_id: u64) {
        info!(cycle_id, "cancellation requested");
        lock(&self.inner.cancelled).insert(cycle_id);
    }

    /// Queue `instruction` to run after the current cycle settles,
    /// replacing anything already queued.
    pub fn queue_instruction(&self, instruction: impl Into<String>) {
        let instruction = instruction.into();
        let mut slot = lock(&self.inner.queued);
        if let Some(previous) = slot.replace(instruction) {
            warn!(dropped = %previous, "queued instruction replaced");
        }
    }

    fn is_cancelled(&self, cycle_id: u64) -> bool {
        lock(&self.inner.cancelled).contains(&cycle_id)
    }

    fn enter_cycle(&self, cycle_id: u64) {
        self.inner.current_cycle.store(cycle_id, Ordering::SeqCst);
    }

    fn take_queued(&self) -> Option<String> {
        lock(&self.inner.queued).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome notification per settled cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleNotice {
    Completed {
        cycle_id: u64,
        selected_session: String,
    },
    Cancelled {
        cycle_id: u64,
    },
    ContinueRequested {
        cycle_id: u64,
        session_id: String,
    },
}

/// Bookkeeping row kept per committed cycle.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_id: u64,
    pub instruction: String,
    pub selected_session: String,
}

/// Drives a stream of instructions through a [`CycleRunner`], applying the
/// settlement rules: cancelled cycles roll back, continue cycles advance
/// only the session lineage, completed cycles advance everything.
pub struct CycleController<R> {
    runner: R,
    handle: ControlHandle,
    cycle_counter: u64,
    /// Winner of the last committed cycle; next cycle's fork base.
    last_selected_session: Option<String>,
    /// Session currently live in the main pane, shared so observers see
    /// rollbacks as they happen.
    active_main_session: Arc<Mutex<Option<String>>>,
    last_scoreboard: BTreeMap<String, ScoreEntry>,
    history: Vec<CycleSummary>,
}

impl<R: CycleRunner> CycleController<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            handle: ControlHandle::new(),
            cycle_counter: 0,
            last_selected_session: None,
            active_main_session: Arc::new(Mutex::new(None)),
            last_scoreboard: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    pub fn last_selected_session(&self) -> Option<&str> {
        self.last_selected_session.as_deref()
    }

    pub fn active_main_session(&self) -> Option<String> {
        lock(&self.active_main_session).clone()
    }

    pub fn last_scoreboard(&self) -> &BTreeMap<String, ScoreEntry> {
        &self.last_scoreboard
    }

    pub fn history(&self) -> &[CycleSummary] {
        &self.history
    }

    /// Run `text`, then drain any instructions queued while cycles were in
    /// flight. Each settled cycle fires `on_notice` exactly once.
    #[instrument(skip_all)]
    pub fn run_instruction(
        &mut self,
        text: &str,
        mut on_notice: impl FnMut(CycleNotice),
    ) -> Result<()> {
        let mut next = Some(text.to_string());
        while let Some(instruction) = next.take() {
            self.cycle_counter += 1;
            let cycle_id = self.cycle_counter;
            self.handle.enter_cycle(cycle_id);

            let prev_selected = self.last_selected_session.clone();
            let prev_main = self.active_main_session();

            let active = Arc::clone(&self.active_main_session);
            let outcome = self.runner.run_cycle(
                &instruction,
                prev_selected.as_deref(),
                &mut |session_id| {
                    *lock(&active) = Some(session_id.to_string());
                },
            );
            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    *lock(&self.active_main_session) = prev_main;
                    return Err(err);
                }
            };

            if self.handle.is_cancelled(cycle_id) {
                info!(cycle_id, "cycle cancelled, rolling back");
                self.last_selected_session = prev_selected;
                *lock(&self.active_main_session) = prev_main;
                on_notice(CycleNotice::Cancelled { cycle_id });
            } else if result.continue_requested {
                // The live session keeps going; the session it continues in
                // is already the resume target, so nothing advances.
                on_notice(CycleNotice::ContinueRequested {
                    cycle_id,
                    session_id: result.selected_session,
                });
            } else {
                self.last_selected_session = Some(result.selected_session.clone());
                *lock(&self.active_main_session) = Some(result.selected_session.clone());
                self.last_scoreboard = result.scoreboard;
                self.history.push(CycleSummary {
                    cycle_id,
                    instruction,
                    selected_session: result.selected_session.clone(),
                });
                on_notice(CycleNotice::Completed {
                    cycle_id,
                    selected_session: result.selected_session,
                });
            }

            next = self.handle.take_queued();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Runner that records every call and lets a hook fiddle with the
    /// handle mid-cycle, standing in for a user acting while a cycle runs.
    struct ScriptedRunner {
        calls: Vec<(String, Option<String>)>,
        mid_cycle: Box<dyn FnMut(u64, &ControlHandle)>,
        handle: Option<ControlHandle>,
        counter: u64,
        continue_markers: bool,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                mid_cycle: Box::new(|_, _| {}),
                handle: None,
                counter: 0,
                continue_markers: false,
            }
        }
    }

    impl CycleRunner for ScriptedRunner {
        fn run_cycle(
            &mut self,
            instruction: &str,
            resume_session_id: Option<&str>,
            on_main_session: &mut dyn FnMut(&str),
        ) -> Result<OrchestrationResult> {
            self.counter += 1;
            self.calls
                .push((instruction.to_string(), resume_session_id.map(str::to_string)));
            let session = format!("session-{}", self.counter);
            on_main_session(resume_session_id.unwrap_or(&session));
            if let Some(handle) = &self.handle {
                (self.mid_cycle)(self.counter, handle);
            }
            if self.continue_markers && instruction == "/continue" {
                return Ok(OrchestrationResult {
                    selected_session: resume_session_id.unwrap_or(&session).to_string(),
                    scoreboard: BTreeMap::new(),
                    continue_requested: true,
                });
            }
            Ok(OrchestrationResult {
                selected_session: session,
                scoreboard: BTreeMap::from([(
                    "worker-1".to_string(),
                    ScoreEntry {
                        score: 80,
                        comment: None,
                        done: true,
                    },
                )]),
                continue_requested: false,
            })
        }
    }

    fn notices(controller: &mut CycleController<ScriptedRunner>, text: &str) -> Vec<CycleNotice> {
        let mut out = Vec::new();
        controller
            .run_instruction(text, |notice| out.push(notice))
            .expect("run");
        out
    }

    #[test]
    fn completed_cycle_advances_state_and_history() {
        let mut controller = CycleController::new(ScriptedRunner::new());

        let seen = notices(&mut controller, "Build");

        assert_eq!(
            seen,
            vec![CycleNotice::Completed {
                cycle_id: 1,
                selected_session: "session-1".to_string(),
            }]
        );
        assert_eq!(controller.last_selected_session(), Some("session-1"));
        assert_eq!(controller.active_main_session().as_deref(), Some("session-1"));
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.last_scoreboard()["worker-1"].score, 80);
    }

    #[test]
    fn second_cycle_resumes_from_previous_winner() {
        let mut controller = CycleController::new(ScriptedRunner::new());
        notices(&mut controller, "First");
        notices(&mut controller, "Second");

        assert_eq!(
            controller.runner.calls,
            vec![
                ("First".to_string(), None),
                ("Second".to_string(), Some("session-1".to_string())),
            ]
        );
    }

    #[test]
    fn cancelled_cycle_rolls_back_and_replays_queue() {
        let mut runner = ScriptedRunner::new();
        runner.mid_cycle = Box::new(|cycle, handle| {
            if cycle == 2 {
                handle.cancel_current();
                handle.queue_instruction("Retry it differently");
            }
        });
        let mut controller = CycleController::new(runner);
        let handle = controller.handle();
        controller.runner.handle = Some(handle);

        notices(&mut controller, "First");
        let seen = notices(&mut controller, "Second");

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], CycleNotice::Cancelled { cycle_id: 2 });
        assert!(matches!(seen[1], CycleNotice::Completed { cycle_id: 3, .. }));
        // The replay resumed from cycle 1's winner, not the cancelled run.
        assert_eq!(
            controller.runner.calls[2],
            (
                "Retry it differently".to_string(),
                Some("session-1".to_string())
            )
        );
        // Only committed cycles make history.
        assert_eq!(controller.history().len(), 2);
    }

    #[test]
    fn cancelled_first_cycle_restores_empty_state() {
        let mut runner = ScriptedRunner::new();
        runner.mid_cycle = Box::new(|_, handle| handle.cancel_current());
        let mut controller = CycleController::new(runner);
        let handle = controller.handle();
        controller.runner.handle = Some(handle);

        let seen = notices(&mut controller, "First");

        assert_eq!(seen, vec![CycleNotice::Cancelled { cycle_id: 1 }]);
        assert_eq!(controller.last_selected_session(), None);
        assert_eq!(controller.active_main_session(), None);
        assert!(controller.history().is_empty());
    }

    #[test]
    fn queue_keeps_only_the_newest_instruction() {
        let mut runner = ScriptedRunner::new();
        runner.mid_cycle = Box::new(|cycle, handle| {
            if cycle == 1 {
                handle.queue_instruction("Older");
                handle.queue_instruction("Newer");
            }
        });
        let mut controller = CycleController::new(runner);
        let handle = controller.handle();
        controller.runner.handle = Some(handle);

        let seen = notices(&mut controller, "First");

        assert_eq!(seen.len(), 2);
        assert_eq!(controller.runner.calls[1].0, "Newer");
        assert!(
            !controller
                .runner
                .calls
                .iter()
                .any(|(instruction, _)| instruction == "Older")
        );
    }

    #[test]
    fn continue_request_leaves_controller_state_unchanged() {
        let mut runner = ScriptedRunner::new();
        runner.continue_markers = true;
        let mut controller = CycleController::new(runner);
        notices(&mut controller, "First");

        let seen = notices(&mut controller, "/continue");

        assert_eq!(
            seen,
            vec![CycleNotice::ContinueRequested {
                cycle_id: 2,
                session_id: "session-1".to_string(),
            }]
        );
        // Scoreboard and history still reflect the last real race.
        assert_eq!(controller.last_scoreboard()["worker-1"].score, 80);
        assert_eq!(controller.history().len(), 1);
        assert_eq!(controller.last_selected_session(), Some("session-1"));
    }

    #[test]
    fn failed_cycle_restores_active_session_and_propagates() {
        struct FailingRunner;
        impl CycleRunner for FailingRunner {
            fn run_cycle(
                &mut self,
                _instruction: &str,
                _resume_session_id: Option<&str>,
                on_main_session: &mut dyn FnMut(&str),
            ) -> Result<OrchestrationResult> {
                on_main_session("session-doomed");
                anyhow::bail!("tmux went away")
            }
        }

        let mut controller = CycleController::new(FailingRunner);
        let err = controller
            .run_instruction("Build", |_| panic!("no notice for a failed cycle"))
            .unwrap_err();

        assert!(err.to_string().contains("tmux went away"));
        assert_eq!(controller.active_main_session(), None);
        assert_eq!(controller.last_selected_session(), None);
    }
}
