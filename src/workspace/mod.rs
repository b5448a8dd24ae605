//! Workspace providers: isolated per-task working copies of a shared
//! baseline, plus merge, validate and revert against that baseline.
//!
//! The engine only talks to [`WorkspaceProvider`]. [`git::GitWorkspaceProvider`]
//! backs it with git worktrees; [`memory::MemoryProvider`] is a deterministic
//! in-process implementation used for simulation and tests.

pub mod git;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::task::{Resource, Task, TaskId, TouchSet};
use crate::Result;

pub use git::GitWorkspaceProvider;
pub use memory::{MemoryProvider, MemoryScript};

/// The shared state tasks fork from and merge into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    /// Provider-specific name (a branch for git).
    pub name: String,
}

impl Baseline {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An allocated workspace, owned by exactly one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    /// Baseline revision the workspace was forked from.
    pub fork_point: String,
}

/// Result of merging a workspace into the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MergeOutcome {
    /// Baseline advanced from `previous` to `revision`.
    Merged { revision: String, previous: String },
    /// Nothing was changed; these resources conflict.
    Conflict { resources: Vec<Resource> },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ValidationOutcome {
    Passed,
    Failed { detail: String },
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ValidationOutcome::Passed)
    }
}

#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create an isolated copy of `baseline` for `task`.
    async fn allocate(&self, task: &Task, baseline: &Baseline) -> Result<WorkspaceHandle>;

    /// Dispose of a workspace. Releasing twice is not an error.
    async fn release(&self, handle: &WorkspaceHandle) -> Result<()>;

    /// Resources the workspace has changed relative to its fork point.
    async fn proposed_touch_set(&self, handle: &WorkspaceHandle) -> Result<TouchSet>;

    /// Merge the workspace into the baseline. A conflict leaves the
    /// baseline untouched.
    async fn merge(&self, handle: &WorkspaceHandle, baseline: &Baseline) -> Result<MergeOutcome>;

    /// Validate the current baseline.
    async fn validate(&self, baseline: &Baseline) -> Result<ValidationOutcome>;

    /// Move the baseline back to `revision`.
    async fn revert(&self, baseline: &Baseline, revision: &str) -> Result<()>;
}
