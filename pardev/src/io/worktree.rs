//! Branch-scoped worktree provisioning for worker isolation.
//!
//! Every worker gets its own branch and its own linked worktree under
//! `.parallel-dev/sessions/<namespace>/worktrees/`, plus one "boss"
//! worktree for the evaluator's reference copy. Two managers differing
//! only in namespace never collide on branch names or paths, even against
//! the identical repository.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::error::ConfigurationError;
use crate::io::git::Git;

/// Key used for the evaluator's reference worktree.
pub const BOSS_KEY: &str = "boss";

/// Capability consumed by the orchestrator: provision isolated checkouts
/// and integrate a winning branch back into the main line.
pub trait WorkspaceProvider {
    /// Idempotently create or reuse one checkout per worker; returns
    /// worker-key -> path.
    fn prepare(&self) -> Result<BTreeMap<String, PathBuf>>;

    /// Deterministic branch name for a worker key. Pure.
    fn worker_branch(&self, key: &str) -> String;

    /// Merge `branch` into the main line at the repository root.
    fn merge_into_main(&self, branch: &str) -> Result<()>;
}

/// Provisions N+1 isolated, branch-scoped checkouts from one repository.
#[derive(Debug)]
pub struct WorktreeManager {
    root: PathBuf,
    worker_count: usize,
    namespace: String,
    git: Git,
}

impl WorktreeManager {
    /// Requires the repository to already contain at least one commit;
    /// branches cannot be scoped to a namespace without a base revision,
    /// so a zero-commit repository fails fast instead of being silently
    /// bootstrapped.
    pub fn new(
        root: impl Into<PathBuf>,
        worker_count: usize,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let root = root.into();
        let git = Git::new(&root);
        if !git.has_any_commit()? {
            return Err(ConfigurationError::new(format!(
                "repository {} has no commits; create an initial commit first",
                root.display()
            ))
            .into());
        }
        Ok(Self {
            root,
            worker_count,
            namespace: namespace.into(),
            git,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding this namespace's worktrees.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.root
            .join(".parallel-dev")
            .join("sessions")
            .join(&self.namespace)
            .join("worktrees")
    }

    /// The evaluator's reference checkout.
    pub fn boss_path(&self) -> PathBuf {
        self.worktrees_dir().join(BOSS_KEY)
    }

    /// Worker key for a 1-based index.
    pub fn worker_key(index: usize) -> String {
        format!("worker-{index}")
    }

    fn ensure_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        // A linked worktree carries a `.git` file pointing at the parent
        // repository; its presence marks the checkout as already provisioned.
        if path.join(".git").exists() {
            debug!(path = %path.display(), "reusing existing worktree");
            return Ok(());
        }
        if !self.git.branch_exists(branch)? {
            self.git.create_branch(branch)?;
        }
        self.git.worktree_add(path, branch)?;
        info!(branch, path = %path.display(), "provisioned worktree");
        Ok(())
    }

    fn ensure_scaffold_ignored(&self) -> Result<()> {
        let dir = self.root.join(".parallel-dev");
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let gitignore = dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")
                .with_context(|| format!("write {}", gitignore.display()))?;
        }
        Ok(())
    }
}

impl WorkspaceProvider for WorktreeManager {
    #[instrument(skip_all, fields(namespace = %self.namespace, worker_count = self.worker_count))]
    fn prepare(&self) -> Result<BTreeMap<String, PathBuf>> {
        self.ensure_scaffold_ignored()?;
        let base = self.worktrees_dir();
        fs::create_dir_all(&base).with_context(|| format!("create {}", base.display()))?;

        let mut mapping = BTreeMap::new();
        for index in 1..=self.worker_count {
            let key = Self::worker_key(index);
            let path = base.join(&key);
            self.ensure_worktree(&path, &self.worker_branch(&key))?;
            mapping.insert(key, path);
        }
        self.ensure_worktree(&self.boss_path(), &self.worker_branch(BOSS_KEY))?;
        Ok(mapping)
    }

    fn worker_branch(&self, key: &str) -> String {
        format!("pardev/{}/{}", self.namespace, key)
    }

    #[instrument(skip_all, fields(branch))]
    fn merge_into_main(&self, branch: &str) -> Result<()> {
        self.git.merge(branch)?;
        self.git.ensure_clean_tracked()?;
        info!(branch, "merged into main line");
        Ok(())
    }
}
