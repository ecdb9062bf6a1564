//! Parallel agent cycle orchestrator.
//!
//! `pardev` races N isolated copies of a long-running interactive agent
//! (a `codex`-style terminal program) against one instruction, judges the
//! outcomes, and promotes exactly one winner back into the main line of
//! work. Each worker runs in its own tmux pane, bound to its own git
//! worktree, so candidates diverge under full isolation from an identical
//! forked starting point. The architecture keeps a strict separation:
//!
//! - **[`io`]**: side-effecting collaborators (git, tmux, session
//!   registry, audit logs, settings). Each sits behind a small trait so
//!   orchestration can be tested with scripted fakes.
//! - **[`orchestrator`]**: one full instruction cycle — provision,
//!   layout, dispatch, fork, await, select, promote, merge, record.
//! - **[`controller`]**: sequences cycles over time with cooperative
//!   cancellation and a single-slot instruction queue.

pub mod controller;
pub mod error;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod selection;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod types;
