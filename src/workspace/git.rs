//! Git-backed workspace provider.
//!
//! Each run gets a staging branch (the baseline) forked from the configured
//! base branch, plus an integration worktree checked out on it where
//! validation runs. Tasks get their own worktree on `swarm/<run>/<task>`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::task::{Task, TouchSet};
use crate::error::Error;
use crate::git::{BranchMerge, GitOps};
use crate::util::{blocking, slug};
use crate::workspace::{Baseline, MergeOutcome, ValidationOutcome, WorkspaceHandle, WorkspaceProvider};
use crate::Result;

pub struct GitWorkspaceProvider {
    git: Arc<GitOps>,
    run: String,
    worktree_dir: PathBuf,
    validate_command: Option<Vec<String>>,
    validate_timeout: Duration,
}

impl GitWorkspaceProvider {
    pub fn new(
        git: GitOps,
        run: impl Into<String>,
        worktree_dir: PathBuf,
        validate_command: Option<Vec<String>>,
    ) -> Self {
        Self {
            git: Arc::new(git),
            run: run.into(),
            worktree_dir,
            validate_command,
            validate_timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_validate_timeout(mut self, timeout: Duration) -> Self {
        self.validate_timeout = timeout;
        self
    }

    fn integration_path(&self) -> PathBuf {
        self.worktree_dir.join(format!("{}-integration", self.run))
    }

    /// Create the run's staging branch from `base_branch` and check it out in
    /// the integration worktree.
    pub async fn prepare_baseline(&self, staging_branch: &str, base_branch: &str) -> Result<Baseline> {
        let git = self.git.clone();
        let staging = staging_branch.to_string();
        let base = base_branch.to_string();
        let path = self.integration_path();
        blocking(move || {
            if !git.branch_exists(&staging)? {
                git.create_branch(&staging, &base)?;
            }
            if !path.exists() {
                git.create_worktree_from_branch(&staging, &path)?;
            }
            Ok(())
        })
        .await?;
        info!(run = %self.run, staging = %staging_branch, base = %base_branch, "baseline prepared");
        Ok(Baseline::new(staging_branch))
    }

    /// Remove the integration worktree. The staging branch is kept as the
    /// run's result.
    pub async fn teardown(&self) -> Result<()> {
        let git = self.git.clone();
        let path = self.integration_path();
        blocking(move || git.remove_worktree(&path)).await
    }

    async fn sync_integration(&self) -> Result<()> {
        let git = self.git.clone();
        let path = self.integration_path();
        blocking(move || git.reset_hard(&path)).await
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaceProvider {
    async fn allocate(&self, task: &Task, baseline: &Baseline) -> Result<WorkspaceHandle> {
        let slug = slug(&task.name);
        let branch = format!("swarm/{}/{}", self.run, slug);
        let path = self.worktree_dir.join(format!("{}-{}", self.run, slug));
        let git = self.git.clone();
        let (b, p, base) = (branch.clone(), path.clone(), baseline.name.clone());
        let fork_point = blocking(move || {
            git.create_worktree(&b, &base, &p)?;
            git.branch_commit(&base)
        })
        .await?;
        debug!(task = %task.id, %branch, path = %path.display(), "worktree allocated");
        Ok(WorkspaceHandle {
            task_id: task.id,
            path,
            branch,
            fork_point,
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        let git = self.git.clone();
        let handle = handle.clone();
        blocking(move || {
            if handle.path.exists() {
                git.remove_worktree(&handle.path)?;
            }
            git.delete_branch(&handle.branch)
        })
        .await
    }

    async fn proposed_touch_set(&self, handle: &WorkspaceHandle) -> Result<TouchSet> {
        let git = self.git.clone();
        let handle = handle.clone();
        blocking(move || git.changed_paths(&handle.path, &handle.fork_point)).await
    }

    async fn merge(&self, handle: &WorkspaceHandle, baseline: &Baseline) -> Result<MergeOutcome> {
        let git = self.git.clone();
        let handle = handle.clone();
        let staging = baseline.name.clone();
        let merged = blocking(move || {
            git.commit_all(&handle.path, &format!("swarm: work for {}", handle.branch))?;
            git.merge_branch(&staging, &handle.branch, &format!("Merge {}", handle.branch))
        })
        .await?;

        match merged {
            BranchMerge::Merged { commit, previous } => {
                self.sync_integration().await?;
                Ok(MergeOutcome::Merged {
                    revision: commit,
                    previous,
                })
            }
            BranchMerge::Conflicts(resources) => Ok(MergeOutcome::Conflict { resources }),
        }
    }

    async fn validate(&self, _baseline: &Baseline) -> Result<ValidationOutcome> {
        let Some((program, args)) = self.validate_command.as_ref().and_then(|c| c.split_first()) else {
            return Ok(ValidationOutcome::Passed);
        };
        let output = tokio::time::timeout(
            self.validate_timeout,
            Command::new(program)
                .args(args)
                .current_dir(self.integration_path())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.validate_timeout))?
        .map_err(|e| Error::ProviderUnavailable(format!("failed to run {}: {}", program, e)))?;

        if output.status.success() {
            Ok(ValidationOutcome::Passed)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let detail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
            warn!(status = %output.status, "validation command failed");
            Ok(ValidationOutcome::Failed {
                detail: format!("{} exited with {}\n{}", program, output.status, detail),
            })
        }
    }

    async fn revert(&self, baseline: &Baseline, revision: &str) -> Result<()> {
        let git = self.git.clone();
        let staging = baseline.name.clone();
        let revision = revision.to_string();
        blocking(move || git.set_branch(&staging, &revision)).await?;
        self.sync_integration().await
    }
}
