//! Test-only helpers for exercising git-backed components.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

/// A throwaway git repository with one initial commit.
///
/// Shells out to real `git` so worktree and merge behavior is exercised
/// against the actual tool, not a reimplementation.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    /// Initialize a repository with an identity configured and a single
    /// commit containing `README.md`.
    pub fn new() -> Result<Self> {
        let repo = Self::new_empty()?;
        repo.commit_file("README.md", "# demo\n", "Initial commit")?;
        Ok(repo)
    }

    /// Initialize a repository with no commits at all.
    pub fn new_empty() -> Result<Self> {
        let dir = tempfile::tempdir().context("create tempdir")?;
        let root = dir.path().to_path_buf();
        git(&root, &["init", "--initial-branch=main"])?;
        git(&root, &["config", "user.email", "test@example.com"])?;
        git(&root, &["config", "user.name", "Test"])?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `relpath` and commit it.
    pub fn commit_file(&self, relpath: &str, contents: &str, message: &str) -> Result<()> {
        let path = self.root().join(relpath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        git(self.root(), &["add", "-A"])?;
        git(self.root(), &["commit", "-m", message])?;
        Ok(())
    }

    /// Current HEAD commit sha.
    pub fn head_sha(&self) -> Result<String> {
        git(self.root(), &["rev-parse", "HEAD"])
    }
}

/// Run git in `root`, asserting success and returning trimmed stdout.
pub fn git(root: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !out.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
