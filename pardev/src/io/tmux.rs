//! Tmux adapter: terminal topology and the agent keystroke protocol.
//!
//! The driven agent is a long-running interactive terminal program with no
//! API surface besides keystrokes, so this component's entire value is
//! sequencing a small, strictly-ordered set of control actions
//! idempotently: ensure the 1-main/1-boss/N-worker pane layout, type
//! instructions, fork sessions, rebind forks to their worktrees, and
//! promote a winner in the main pane.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::error::ConfigurationError;
use crate::io::monitor::{SessionMonitor, SessionWatcher};
use crate::types::PaneLayout;

/// Capability consumed by the orchestrator to drive the terminal topology.
pub trait LayoutDriver {
    /// Idempotently locate or create the named topology with exactly
    /// `worker_count + 2` panes; returns stable ids in creation order.
    fn ensure_layout(&mut self, name: &str, worker_count: usize) -> Result<PaneLayout>;

    /// Idempotently start the agent process in the main pane.
    fn launch_main_session(&mut self, pane: &str) -> Result<()>;

    /// Idempotently start the agent process in the boss pane.
    fn launch_boss_session(&mut self, pane: &str) -> Result<()>;

    /// Type `instruction` plus an Enter keystroke into the pane.
    fn send_instruction_to_pane(&mut self, pane: &str, instruction: &str) -> Result<()>;

    /// Send a single interrupt keystroke into the pane.
    fn interrupt_pane(&mut self, pane: &str) -> Result<()>;

    /// Fork one new session per worker pane from the base session,
    /// confirming each via new-session detection. Panes that never rebind
    /// within the window are absent from the result.
    fn fork_workers(
        &mut self,
        workers: &[String],
        base_session_id: &str,
    ) -> Result<BTreeMap<String, String>>;

    /// Rebind each forked session to its isolated workspace path.
    fn resume_workers(
        &mut self,
        fork_map: &BTreeMap<String, String>,
        pane_paths: &BTreeMap<String, PathBuf>,
    ) -> Result<()>;

    /// Clear transient pane state and redispatch the instruction into
    /// every forked context.
    fn send_instruction_to_workers(
        &mut self,
        fork_map: &BTreeMap<String, String>,
        instruction: &str,
    ) -> Result<()>;

    /// Switch the main pane's live process onto `session_id`; later forks
    /// branch from this lineage.
    fn promote_to_main(&mut self, session_id: &str, pane: &str) -> Result<()>;
}

/// Drives `tmux` via subprocess.
pub struct TmuxLayoutManager {
    agent_command: String,
    monitor: SessionMonitor,
    fork_timeout: Duration,
    poll_interval: Duration,
    launched: BTreeSet<String>,
}

impl TmuxLayoutManager {
    pub fn new(agent_command: impl Into<String>, monitor: SessionMonitor) -> Self {
        Self {
            agent_command: agent_command.into(),
            monitor,
            fork_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            launched: BTreeSet::new(),
        }
    }

    pub fn with_fork_window(mut self, timeout: Duration, interval: Duration) -> Self {
        self.fork_timeout = timeout;
        self.poll_interval = interval;
        self
    }

    fn session_exists(&self, name: &str) -> Result<bool> {
        let status = self.tmux(&["has-session", "-t", name])?.status;
        Ok(status.success())
    }

    fn list_panes(&self, name: &str) -> Result<Vec<String>> {
        let out = self.tmux_capture(&["list-panes", "-t", name, "-F", "#{pane_id}"])?;
        Ok(parse_pane_ids(&out))
    }

    fn send_literal(&self, pane: &str, text: &str) -> Result<()> {
        self.tmux_checked(&["send-keys", "-t", pane, "-l", "--", text])?;
        self.tmux_checked(&["send-keys", "-t", pane, "Enter"])?;
        Ok(())
    }

    fn send_key(&self, pane: &str, key: &str) -> Result<()> {
        self.tmux_checked(&["send-keys", "-t", pane, key])?;
        Ok(())
    }

    fn launch_agent(&mut self, pane: &str, role: &str) -> Result<()> {
        if self.launched.contains(pane) {
            debug!(pane, role, "agent already launched");
            return Ok(());
        }
        info!(pane, role, "launching agent");
        let command = self.agent_command.clone();
        self.send_literal(pane, &command)?;
        self.launched.insert(pane.to_string());
        Ok(())
    }

    fn tmux_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.tmux_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn tmux_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.tmux(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("tmux {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn tmux(&self, args: &[&str]) -> Result<Output> {
        Command::new("tmux")
            .args(args)
            .output()
            .with_context(|| format!("spawn tmux {}", args.join(" ")))
    }
}

impl LayoutDriver for TmuxLayoutManager {
    #[instrument(skip_all, fields(name, worker_count))]
    fn ensure_layout(&mut self, name: &str, worker_count: usize) -> Result<PaneLayout> {
        let wanted = worker_count + 2;
        if !self.session_exists(name)? {
            info!(name, "creating tmux session");
            self.tmux_checked(&["new-session", "-d", "-s", name])?;
        }

        let mut panes = self.list_panes(name)?;
        while panes.len() < wanted {
            self.tmux_checked(&["split-window", "-d", "-t", name])?;
            self.tmux_checked(&["select-layout", "-t", name, "tiled"])?;
            panes = self.list_panes(name)?;
        }

        build_layout(&panes, worker_count).map_err(|err| {
            ConfigurationError::new(format!("tmux session '{name}': {err}")).into()
        })
    }

    fn launch_main_session(&mut self, pane: &str) -> Result<()> {
        self.launch_agent(pane, "main")
    }

    fn launch_boss_session(&mut self, pane: &str) -> Result<()> {
        self.launch_agent(pane, "boss")
    }

    fn send_instruction_to_pane(&mut self, pane: &str, instruction: &str) -> Result<()> {
        debug!(pane, "sending instruction");
        self.send_literal(pane, instruction)
    }

    fn interrupt_pane(&mut self, pane: &str) -> Result<()> {
        self.send_key(pane, "Escape")
    }

    #[instrument(skip_all, fields(workers = workers.len(), base = base_session_id))]
    fn fork_workers(
        &mut self,
        workers: &[String],
        base_session_id: &str,
    ) -> Result<BTreeMap<String, String>> {
        for pane in workers {
            self.send_key(pane, "Escape")?;
            let fork = format!("{} fork {base_session_id}", self.agent_command);
            self.send_literal(pane, &fork)?;
        }

        let fork_map = self.monitor.await_new_sessions(
            workers,
            base_session_id,
            self.fork_timeout,
            self.poll_interval,
        );
        if fork_map.len() < workers.len() {
            warn!(
                forked = fork_map.len(),
                expected = workers.len(),
                "some worker panes never rebound to a forked session"
            );
        }
        Ok(fork_map)
    }

    fn resume_workers(
        &mut self,
        fork_map: &BTreeMap<String, String>,
        pane_paths: &BTreeMap<String, PathBuf>,
    ) -> Result<()> {
        for (pane, session_id) in fork_map {
            self.send_key(pane, "Escape")?;
            if let Some(path) = pane_paths.get(pane) {
                self.send_literal(pane, &format!("cd {}", path.display()))?;
            } else {
                warn!(pane, "no workspace path for forked pane");
            }
            let resume = format!("{} resume {session_id}", self.agent_command);
            self.send_literal(pane, &resume)?;
        }
        Ok(())
    }

    fn send_instruction_to_workers(
        &mut self,
        fork_map: &BTreeMap<String, String>,
        instruction: &str,
    ) -> Result<()> {
        for pane in fork_map.keys() {
            self.send_key(pane, "Escape")?;
            self.send_literal(pane, instruction)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(session_id, pane))]
    fn promote_to_main(&mut self, session_id: &str, pane: &str) -> Result<()> {
        info!(session_id, pane, "promoting session to main");
        let resume = format!("{} resume {session_id}", self.agent_command);
        self.send_literal(pane, &resume)
    }
}

fn parse_pane_ids(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shape a raw pane list into the fixed topology. The pane count must be
/// exactly `worker_count + 2`; an oversized existing session is someone
/// else's layout and must not be silently adopted.
fn build_layout(panes: &[String], worker_count: usize) -> Result<PaneLayout> {
    let wanted = worker_count + 2;
    if panes.len() != wanted {
        return Err(anyhow!(
            "expected {wanted} panes for {worker_count} workers, found {}",
            panes.len()
        ));
    }
    Ok(PaneLayout {
        main: panes[0].clone(),
        boss: panes[1].clone(),
        workers: panes[2..].to_vec(),
    })
}
