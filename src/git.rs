use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{
    BranchType, DiffOptions, ErrorCode, IndexAddOption, Oid, Repository, ResetType, Signature,
    WorktreePruneOptions,
};
use tracing::{debug, warn};

use crate::Result;

/// Outcome of merging one branch into another without touching any
/// working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchMerge {
    /// `target` moved from `previous` to `commit`.
    Merged { commit: String, previous: String },
    /// Paths with conflicting changes; `target` is unchanged.
    Conflicts(Vec<String>),
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Swarm", "swarm@localhost"))?)
    }

    /// Name of the checked-out branch, or the short commit id when detached.
    pub fn current_head(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        if head.is_branch() {
            if let Some(name) = head.shorthand() {
                return Ok(name.to_string());
            }
        }
        let commit = head.peel_to_commit()?;
        Ok(format!("{:.7}", commit.id()))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    /// Commit id a branch points at.
    pub fn branch_commit(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Create `branch` at the tip of `from`.
    pub fn create_branch(&self, branch: &str, from: &str) -> Result<String> {
        debug!(branch, from, "GitOps::create_branch");
        let repo = self.repo()?;
        let commit = repo
            .find_branch(from, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        repo.branch(branch, &commit, false)?;
        Ok(commit.id().to_string())
    }

    /// Point `branch` at `commit`.
    pub fn set_branch(&self, branch: &str, commit: &str) -> Result<()> {
        debug!(branch, commit, "GitOps::set_branch");
        let repo = self.repo()?;
        let oid = Oid::from_str(commit)?;
        repo.reference(
            &format!("refs/heads/{}", branch),
            oid,
            true,
            &format!("swarm: reset {} to {}", branch, commit),
        )?;
        Ok(())
    }

    /// Create a worktree at `worktree_path` on a new `branch` forked from `from`.
    pub fn create_worktree(&self, branch: &str, from: &str, worktree_path: &Path) -> Result<()> {
        debug!(branch, from, path = %worktree_path.display(), "GitOps::create_worktree");
        let repo = self.repo()?;
        let commit = repo
            .find_branch(from, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        self.add_worktree(&repo, branch, &branch_ref, worktree_path)
    }

    /// Create a worktree checking out an existing branch.
    pub fn create_worktree_from_branch(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        let repo = self.repo()?;
        let reference = repo.find_branch(branch, BranchType::Local)?.into_reference();
        self.add_worktree(&repo, branch, &reference, worktree_path)
    }

    fn add_worktree(
        &self,
        repo: &Repository,
        branch: &str,
        reference: &git2::Reference<'_>,
        worktree_path: &Path,
    ) -> Result<()> {
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(reference));
        // Branch names contain slashes; the folder name is the worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree, its admin directory and any stale worktree entries.
    /// Keeps going when individual steps fail so the branch is always freed.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "GitOps::remove_worktree");
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);
        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(String::from);

        if let Some(name) = &worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover admin dir makes git think the branch is still checked out.
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Delete a local branch. Missing branches are fine.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "GitOps::delete_branch");
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    warn!(branch, error = %e, "failed to delete branch");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => warn!(branch, error = %e, "error looking up branch"),
        }
        Ok(())
    }

    /// Check if a worktree has uncommitted changes (staged or unstaged).
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage and commit everything in a worktree. Returns the new commit, or
    /// `None` when there was nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        if !self.is_dirty(worktree_path)? {
            return Ok(None);
        }
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["."].iter(), None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = Self::signature(&repo)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(path = %worktree_path.display(), commit = %commit_id, "committed worktree");
        Ok(Some(commit_id.to_string()))
    }

    /// Paths changed in a worktree relative to `fork_point`, covering
    /// commits, staged and unstaged edits and untracked files.
    pub fn changed_paths(&self, worktree_path: &Path, fork_point: &str) -> Result<BTreeSet<String>> {
        let repo = Repository::open(worktree_path)?;
        let base = repo.find_commit(Oid::from_str(fork_point)?)?.tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&base), Some(&mut opts))?;

        let mut paths = BTreeSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path().and_then(|p| p.to_str()) {
                    paths.insert(path.to_string());
                }
            }
        }
        Ok(paths)
    }

    /// Merge `source` into `target` in memory and advance `target` on
    /// success. Fast-forwards when possible.
    pub fn merge_branch(&self, target: &str, source: &str, message: &str) -> Result<BranchMerge> {
        let repo = self.repo()?;
        let ours = repo
            .find_branch(target, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let theirs = repo
            .find_branch(source, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        let previous = ours.id().to_string();
        let refname = format!("refs/heads/{}", target);

        let base = repo.merge_base(ours.id(), theirs.id())?;
        if base == theirs.id() {
            debug!(target, source, "already up to date");
            return Ok(BranchMerge::Merged {
                commit: previous.clone(),
                previous,
            });
        }
        if base == ours.id() {
            repo.reference(&refname, theirs.id(), true, message)?;
            debug!(target, source, commit = %theirs.id(), "fast-forward");
            return Ok(BranchMerge::Merged {
                commit: theirs.id().to_string(),
                previous,
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut paths = BTreeSet::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref());
                if let Some(entry) = entry {
                    paths.insert(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
            return Ok(BranchMerge::Conflicts(paths.into_iter().collect()));
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = Self::signature(&repo)?;
        let commit = repo.commit(Some(&refname), &sig, &sig, message, &tree, &[&ours, &theirs])?;
        debug!(target, source, %commit, "merge commit created");
        Ok(BranchMerge::Merged {
            commit: commit.to_string(),
            previous,
        })
    }

    /// Force the worktree's files to match its HEAD commit.
    pub fn reset_hard(&self, worktree_path: &Path) -> Result<()> {
        let repo = Repository::open(worktree_path)?;
        let head = repo.head()?.peel_to_commit()?;
        repo.reset(head.as_object(), ResetType::Hard, None)?;
        Ok(())
    }
}
