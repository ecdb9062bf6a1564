//! Parallel agent cycle CLI.
//!
//! Races N isolated agent sessions against one instruction inside a tmux
//! topology, judges the outcomes, and merges exactly one winner back into
//! the main line.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use pardev::controller::{CycleController, CycleNotice, CycleRunner, SelectorRunner};
use pardev::io::cycle_log::CycleLog;
use pardev::io::git::Git;
use pardev::io::monitor::SessionMonitor;
use pardev::io::settings::SettingsStore;
use pardev::io::tmux::TmuxLayoutManager;
use pardev::io::worktree::WorktreeManager;
use pardev::logging;
use pardev::orchestrator::Orchestrator;
use pardev::selection::{AutoSelector, ScoreSelector};
use pardev::types::ScoreEntry;

#[derive(Parser)]
#[command(
    name = "pardev",
    version,
    about = "Race parallel agent sessions against one instruction and promote the winner"
)]
struct Cli {
    /// Repository root to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one instruction through a full worker race cycle.
    Run {
        /// Instruction to race the workers against.
        instruction: String,
        /// Worker count, overriding the persisted setting.
        #[arg(long)]
        workers: Option<usize>,
        /// Tmux session holding the pane topology.
        #[arg(long, default_value = "pardev")]
        session_name: String,
        /// Command that starts the interactive agent in a pane.
        #[arg(long, default_value = "codex")]
        agent: String,
    },
    /// Show or change persisted settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the effective settings as JSON.
    Show,
    /// Set one key (attach, selection, flow, session, workers, auto-commit).
    Set { key: String, value: String },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            instruction,
            workers,
            session_name,
            agent,
        } => cmd_run(&cli.repo, &instruction, workers, &session_name, &agent),
        Command::Settings { action } => cmd_settings(&cli.repo, action),
    }
}

fn settings_path(repo: &std::path::Path) -> PathBuf {
    repo.join(".parallel-dev/settings.json")
}

fn cmd_run(
    repo: &std::path::Path,
    instruction: &str,
    workers: Option<usize>,
    session_name: &str,
    agent: &str,
) -> Result<()> {
    let store = SettingsStore::load(settings_path(repo));
    let settings = store.settings().clone();
    let worker_count = workers.unwrap_or(settings.workers.count);

    let logs_dir = repo.join(".parallel-dev/logs");
    let monitor = SessionMonitor::new(&logs_dir)?;
    let workspace = WorktreeManager::new(repo, worker_count, session_name)?;
    let layout = TmuxLayoutManager::new(agent, monitor.clone());
    let orchestrator = Orchestrator::new(
        layout,
        workspace,
        monitor,
        CycleLog::new(&logs_dir),
        session_name,
        worker_count,
    )
    .with_auto_commit(settings.workers.auto_commit);

    match settings.modes.selection.as_str() {
        "auto" => {
            let main_ref = Git::new(repo)
                .current_branch()
                .context("resolve main branch for diff scoring")?;
            drive(
                SelectorRunner::new(orchestrator, AutoSelector::new(main_ref)),
                instruction,
            )
        }
        "score" => drive(
            SelectorRunner::new(orchestrator, ScoreSelector),
            instruction,
        ),
        other => bail!("unknown selection mode '{other}' (expected 'score' or 'auto')"),
    }
}

fn drive<R: CycleRunner>(runner: R, instruction: &str) -> Result<()> {
    let mut controller = CycleController::new(runner);
    controller.run_instruction(instruction, |notice| match notice {
        CycleNotice::Completed {
            cycle_id,
            selected_session,
        } => println!("cycle {cycle_id}: promoted {selected_session}"),
        CycleNotice::Cancelled { cycle_id } => println!("cycle {cycle_id}: cancelled"),
        CycleNotice::ContinueRequested {
            cycle_id,
            session_id,
        } => println!("cycle {cycle_id}: continuing in {session_id}"),
    })?;
    render_scoreboard(controller.last_scoreboard());
    Ok(())
}

fn render_scoreboard(scoreboard: &BTreeMap<String, ScoreEntry>) {
    if scoreboard.is_empty() {
        return;
    }
    println!("scoreboard:");
    for (key, entry) in scoreboard {
        let state = if entry.done { "done" } else { "pending" };
        match &entry.comment {
            Some(comment) => println!("  {key:>10}  {:>4}  {state}  {comment}", entry.score),
            None => println!("  {key:>10}  {:>4}  {state}", entry.score),
        }
    }
}

fn cmd_settings(repo: &std::path::Path, action: SettingsAction) -> Result<()> {
    let mut store = SettingsStore::load(settings_path(repo));
    match action {
        SettingsAction::Show => {
            let payload =
                serde_json::to_string_pretty(store.settings()).context("serialize settings")?;
            println!("{payload}");
        }
        SettingsAction::Set { key, value } => match key.as_str() {
            "attach" => store.set_attach_mode(value),
            "selection" => store.set_selection_mode(value),
            "flow" => store.set_flow_mode(value),
            "session" => store.set_session_mode(value),
            "workers" => {
                let count: usize = value
                    .parse()
                    .with_context(|| format!("invalid worker count '{value}'"))?;
                store.set_worker_count(count);
            }
            "auto-commit" => {
                let enabled: bool = value
                    .parse()
                    .with_context(|| format!("invalid auto-commit value '{value}'"))?;
                store.set_auto_commit(enabled);
            }
            other => bail!(
                "unknown settings key '{other}' (expected attach, selection, flow, session, workers, auto-commit)"
            ),
        },
    }
    Ok(())
}
