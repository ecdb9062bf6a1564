//! Git adapter for workspace provisioning and merging.
//!
//! The orchestrator provisions worktrees and integrates winners
//! deterministically, so we keep a small, explicit wrapper around `git`
//! subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::MergeConflict;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the repository has at least one commit reachable from HEAD.
    pub fn has_any_commit(&self) -> Result<bool> {
        let status = self
            .run(&["rev-parse", "--verify", "--quiet", "HEAD"])?
            .status;
        Ok(status.success())
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure no tracked file is modified or staged. Untracked files are
    /// allowed; the orchestrator's own scaffolding lives untracked inside
    /// the repository.
    #[instrument(skip_all)]
    pub fn ensure_clean_tracked(&self) -> Result<()> {
        let dirty: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.code != "??")
            .collect();
        if dirty.is_empty() {
            debug!("working tree is clean");
            return Ok(());
        }
        warn!(dirty_count = dirty.len(), "working tree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean after merge:\n");
        for entry in dirty {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create a branch pointing at current HEAD without checking it out.
    #[instrument(skip_all, fields(branch))]
    pub fn create_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating branch at HEAD");
        self.run_checked(&["branch", branch])?;
        Ok(())
    }

    /// Add a linked worktree at `path` checked out on `branch`.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, path: &Path, branch: &str) -> Result<()> {
        debug!(branch, path = %path.display(), "adding worktree");
        let path_arg = path
            .to_str()
            .ok_or_else(|| anyhow!("worktree path is not valid UTF-8: {}", path.display()))?;
        self.run_checked(&["worktree", "add", path_arg, branch])?;
        Ok(())
    }

    /// Merge `branch` into the current branch, fast-forwarding when
    /// possible. Conflicts are aborted and reported as [`MergeConflict`],
    /// never left half-applied.
    #[instrument(skip_all, fields(branch))]
    pub fn merge(&self, branch: &str) -> Result<()> {
        let output = self.run(&["merge", "--no-edit", branch])?;
        if output.status.success() {
            debug!(branch, "merge succeeded");
            return Ok(());
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stdout.contains("CONFLICT") || stdout.contains("Automatic merge failed") {
            warn!(branch, "merge conflict, aborting merge");
            if let Err(err) = self.run_checked(&["merge", "--abort"]) {
                warn!(err = %err, "merge --abort failed");
            }
            return Err(MergeConflict {
                branch: branch.to_string(),
                detail: first_conflict_line(&stdout),
            }
            .into());
        }
        Err(anyhow!("git merge {branch} failed: {}", stderr.trim()))
    }

    /// Total changed lines (insertions + deletions) between the merge base
    /// with `base_ref` and HEAD. Binary files count as one change each so
    /// an all-binary diff is still distinguishable from no change.
    pub fn diff_size(&self, base_ref: &str) -> Result<u64> {
        let range = format!("{base_ref}...HEAD");
        let out = self.run_capture(&["diff", "--numstat", &range])?;
        Ok(numstat_total(&out))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn numstat_total(out: &str) -> u64 {
    let mut total = 0u64;
    for line in out.lines() {
        let mut fields = line.split('\t');
        let (Some(added), Some(deleted)) = (fields.next(), fields.next()) else {
            continue;
        };
        if added == "-" || deleted == "-" {
            total += 1;
            continue;
        }
        total += added.parse::<u64>().unwrap_or(0);
        total += deleted.parse::<u64>().unwrap_or(0);
    }
    total
}

fn first_conflict_line(stdout: &str) -> String {
    stdout
        .lines()
        .find(|line| line.contains("CONFLICT"))
        .unwrap_or("automatic merge failed")
        .trim()
        .to_string()
}
