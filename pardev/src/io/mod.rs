//! Side-effecting collaborators: git, tmux, session registry, audit logs,
//! settings. Each externally-driven concern sits behind a small trait
//! (`WorkspaceProvider`, `LayoutDriver`, `SessionWatcher`) so
//! orchestration logic can be exercised with scripted fakes.

pub mod cycle_log;
pub mod git;
pub mod monitor;
pub mod settings;
pub mod tmux;
pub mod worktree;
