//! Merge sequencer: the only component that mutates the baseline.
//!
//! Walks a frozen merge plan strictly in order, one merge at a time. Each
//! merge is validated; a failed validation reverts the baseline to the
//! revision before the merge and halts that task's dependents.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::dag::MergePlan;
use crate::core::registry::Transition;
use crate::core::task::{IntegrationResult, Resource, Task, TaskError, TaskErrorKind, TaskId, TaskPhase};
use crate::error::{Error, Result};
use crate::orchestration::events::RunEvent;
use crate::orchestration::scheduler::PhaseScheduler;
use crate::workspace::{MergeOutcome, ValidationOutcome};

/// Per-task outcome of a sequencer pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MergeStatus {
    Merged { revision: String },
    /// Review never approved the task.
    AwaitingApproval,
    /// A prerequisite did not merge.
    BlockedByDependency { on: TaskId },
    MergeConflict { resources: Vec<Resource> },
    ValidationFailed { detail: String },
    /// The task failed before reaching the sequencer.
    TaskFailed,
    Aborted,
    /// The provider could not complete the merge.
    Error { reason: String },
}

impl MergeStatus {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeStatus::Merged { .. })
    }

    /// Skipped because of another task rather than its own failure.
    pub fn is_consequence(&self) -> bool {
        matches!(self, MergeStatus::BlockedByDependency { .. })
    }
}

impl std::fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeStatus::Merged { revision } => write!(f, "merged at {}", revision),
            MergeStatus::AwaitingApproval => write!(f, "awaiting approval"),
            MergeStatus::BlockedByDependency { on } => write!(f, "blocked by dependency {}", on.short()),
            MergeStatus::MergeConflict { resources } => write!(f, "merge conflict on {}", resources.join(", ")),
            MergeStatus::ValidationFailed { detail } => write!(f, "validation failed: {}", detail),
            MergeStatus::TaskFailed => write!(f, "task failed"),
            MergeStatus::Aborted => write!(f, "aborted"),
            MergeStatus::Error { reason } => write!(f, "error: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeEntry {
    pub task_id: TaskId,
    pub name: String,
    pub status: MergeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// One entry per plan position, in plan order.
    pub entries: Vec<MergeEntry>,
    /// Baseline revision after the last successful merge.
    pub baseline_revision: Option<String>,
}

impl MergeReport {
    pub fn status_of(&self, task_id: &TaskId) -> Option<&MergeStatus> {
        self.entries
            .iter()
            .find(|e| e.task_id == *task_id)
            .map(|e| &e.status)
    }

    pub fn merged(&self) -> Vec<TaskId> {
        self.entries
            .iter()
            .filter(|e| e.status.is_merged())
            .map(|e| e.task_id)
            .collect()
    }
}

pub struct MergeSequencer {
    scheduler: Arc<PhaseScheduler>,
    keep_failed_workspaces: bool,
    /// Held for the duration of every merge and its validation.
    merge_lock: Arc<Mutex<()>>,
}

impl MergeSequencer {
    pub fn new(scheduler: Arc<PhaseScheduler>, keep_failed_workspaces: bool) -> Self {
        Self {
            scheduler,
            keep_failed_workspaces,
            merge_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Share a baseline lock with other sequencers over the same baseline.
    pub fn with_merge_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.merge_lock = lock;
        self
    }

    /// Integrate every task of `plan` in order.
    ///
    /// Only a failed revert is returned as an error: the baseline state is
    /// unknown afterwards and nothing else may merge.
    pub async fn run(&self, plan: &MergePlan) -> Result<MergeReport> {
        let registry = self.scheduler.registry().clone();
        let mut report = MergeReport::default();
        info!(tasks = plan.len(), tie_break = %plan.tie_break, "merge sequence started");

        for task_id in &plan.order {
            let task = registry.get(task_id)?;
            if task.phase == TaskPhase::Merged {
                // Integrated by an earlier sequence; no entry of its own.
                debug!(task = %task_id, "already merged, skipping");
                continue;
            }
            let status = self.integrate(&task).await?;
            if let MergeStatus::Merged { revision } = &status {
                report.baseline_revision = Some(revision.clone());
            }
            info!(task = %task_id, name = %task.name, %status, "merge step finished");
            self.scheduler.emit(RunEvent::MergeFinished {
                task_id: *task_id,
                status: status.clone(),
            });
            report.entries.push(MergeEntry {
                task_id: *task_id,
                name: task.name.clone(),
                status,
            });
        }

        info!(merged = report.merged().len(), "merge sequence finished");
        Ok(report)
    }

    async fn integrate(&self, task: &Task) -> Result<MergeStatus> {
        let registry = self.scheduler.registry();
        match task.phase {
            TaskPhase::Aborted => return Ok(MergeStatus::Aborted),
            TaskPhase::Failed => return Ok(MergeStatus::TaskFailed),
            _ => {}
        }
        if self.scheduler.is_cancelled(&task.id) {
            self.scheduler.abort(&task.id).await?;
            return Ok(MergeStatus::Aborted);
        }
        if !task.is_approved() {
            return Ok(MergeStatus::AwaitingApproval);
        }
        // Registry edges, not plan edges: aborted prerequisites leave the plan.
        for &prerequisite in &task.depends_on {
            if registry.get(&prerequisite)?.phase != TaskPhase::Merged {
                warn!(task = %task.id, on = %prerequisite, "prerequisite not merged, skipping");
                return Ok(MergeStatus::BlockedByDependency { on: prerequisite });
            }
        }

        let _baseline = self.merge_lock.lock().await;
        let provider = self.scheduler.provider();
        let baseline = self.scheduler.baseline();
        let retry = self.scheduler.config().retry;
        let handle = match task.workspace.clone() {
            Some(handle) => handle,
            None => {
                let reason = "approved task holds no workspace".to_string();
                self.fail(task, TaskErrorKind::PhaseFailure, reason.clone(), Vec::new())
                    .await?;
                return Ok(MergeStatus::Error { reason });
            }
        };

        self.scheduler.emit(RunEvent::MergeStarted { task_id: task.id });
        info!(task = %task.id, baseline = %baseline.name, "merging");
        let merged = retry.run("merge", || provider.merge(&handle, baseline)).await;
        let (revision, previous) = match merged {
            Ok(MergeOutcome::Merged { revision, previous }) => (revision, previous),
            Ok(MergeOutcome::Conflict { resources }) => {
                warn!(task = %task.id, resources = ?resources, "merge conflict");
                self.fail(
                    task,
                    TaskErrorKind::MergeConflict,
                    Error::MergeConflict {
                        resources: resources.clone(),
                    }
                    .to_string(),
                    resources.clone(),
                )
                .await?;
                return Ok(MergeStatus::MergeConflict { resources });
            }
            Err(e) => {
                let kind = if e.is_transient() {
                    TaskErrorKind::ProviderUnavailable
                } else {
                    TaskErrorKind::PhaseFailure
                };
                let reason = e.to_string();
                error!(task = %task.id, error = %reason, "merge failed");
                self.fail(task, kind, reason.clone(), Vec::new()).await?;
                return Ok(MergeStatus::Error { reason });
            }
        };

        let validation = retry
            .run("validate", || provider.validate(baseline))
            .await
            .unwrap_or_else(|e| ValidationOutcome::Failed {
                detail: e.to_string(),
            });
        if let ValidationOutcome::Failed { detail } = validation {
            warn!(task = %task.id, %revision, %detail, "validation failed, reverting");
            retry
                .run("revert", || provider.revert(baseline, &previous))
                .await?;
            self.scheduler.emit(RunEvent::Reverted {
                task_id: task.id,
                revision: previous.clone(),
            });
            self.fail(
                task,
                TaskErrorKind::ValidationFailure,
                Error::ValidationFailure(detail.clone()).to_string(),
                Vec::new(),
            )
            .await?;
            return Ok(MergeStatus::ValidationFailed { detail });
        }

        registry.transition(&task.id, Transition::Integration(IntegrationResult::Merged))?;
        info!(task = %task.id, %revision, "merged");
        self.scheduler.release_workspace(&task.id).await?;
        Ok(MergeStatus::Merged { revision })
    }

    async fn fail(
        &self,
        task: &Task,
        kind: TaskErrorKind,
        message: String,
        resources: Vec<Resource>,
    ) -> Result<()> {
        let registry = self.scheduler.registry();
        registry.record_error(
            &task.id,
            TaskError::new(kind, TaskPhase::Approved, message).with_resources(resources),
        )?;
        registry.transition(&task.id, Transition::Integration(IntegrationResult::Failed))?;
        if !self.keep_failed_workspaces {
            self.scheduler.release_workspace(&task.id).await?;
        }
        Ok(())
    }
}
