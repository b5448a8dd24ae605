//! Authoritative, transition-validated store of every task in a run.
//!
//! Reads hand out cloned snapshots; every write touches exactly one record
//! under the write lock, so concurrent scheduler and sequencer updates never
//! observe a half-applied transition.

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::core::task::{
    IntegrationResult, PhaseHistoryEntry, ReviewVerdict, Task, TaskError, TaskId, TaskPhase,
    TaskSpec, TouchSet,
};
use crate::error::{Error, Result};
use crate::workspace::WorkspaceHandle;

/// A requested change to a task's position in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move along the pipeline, or fail/abort.
    Phase(TaskPhase),
    /// Record the review outcome; only valid while `Reviewing`.
    Verdict(ReviewVerdict),
    /// Record the integration outcome; `Merged` only from `Approved`.
    Integration(IntegrationResult),
}

impl Transition {
    fn target(self) -> Option<TaskPhase> {
        match self {
            Transition::Phase(p) => Some(p),
            Transition::Verdict(v) => v.phase(),
            Transition::Integration(r) => r.phase(),
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Phase(p) => write!(f, "{}", p),
            Transition::Verdict(v) => write!(f, "verdict {}", v),
            Transition::Integration(r) => write!(f, "integration {}", r),
        }
    }
}

/// Selects tasks for [`TaskRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub phases: Option<Vec<TaskPhase>>,
    pub terminal: Option<bool>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_phases(phases: &[TaskPhase]) -> Self {
        Self {
            phases: Some(phases.to_vec()),
            terminal: None,
        }
    }

    pub fn terminal() -> Self {
        Self {
            phases: None,
            terminal: Some(true),
        }
    }

    pub fn active() -> Self {
        Self {
            phases: None,
            terminal: Some(false),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(phases) = &self.phases {
            if !phases.contains(&task.phase) {
                return false;
            }
        }
        match self.terminal {
            Some(t) => task.is_terminal() == t,
            None => true,
        }
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task in `Pending`. Unnamed specs are named `task-<n>` by
    /// submission position.
    pub fn create(&self, spec: TaskSpec) -> TaskId {
        let mut tasks = self.tasks.write();
        let sequence = tasks.len();
        let mut spec = spec;
        if spec.name.trim().is_empty() {
            spec.name = format!("task-{}", sequence + 1);
        }
        let task = Task::new(&spec, sequence);
        let id = task.id;
        debug!(task = %id, name = %task.name, "task created");
        tasks.insert(id, task);
        id
    }

    pub fn get(&self, id: &TaskId) -> Result<Task> {
        self.tasks
            .read()
            .get(id)
            .cloned()
            .ok_or(Error::TaskNotFound(*id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<TaskId> {
        self.tasks
            .read()
            .values()
            .find(|t| t.name == name)
            .map(|t| t.id)
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Tasks matching `filter`, in submission order.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut out: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.sequence);
        out
    }

    /// Apply a validated transition and return the updated snapshot.
    pub fn transition(&self, id: &TaskId, transition: Transition) -> Result<Task> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        let from = task.phase;

        let invalid = || Error::InvalidTransition {
            task: *id,
            from,
            to: transition.to_string(),
        };

        let target = transition.target().ok_or_else(invalid)?;
        let allowed = match transition {
            Transition::Verdict(_) => from == TaskPhase::Reviewing,
            Transition::Phase(p) => {
                // Verdict phases out of review and Merged need their typed transition.
                let verdict_phase = matches!(
                    p,
                    TaskPhase::Approved | TaskPhase::ChangesRequested | TaskPhase::Blocked
                ) && from == TaskPhase::Reviewing;
                !verdict_phase && p != TaskPhase::Merged
            }
            Transition::Integration(_) => true,
        } && from.can_transition(target);

        if !allowed {
            warn!(task = %id, %from, to = %transition, "rejected transition");
            return Err(invalid());
        }

        match transition {
            Transition::Verdict(v) => task.review_verdict = v,
            Transition::Integration(r) => task.integration_result = r,
            Transition::Phase(_) => {}
        }
        if from == TaskPhase::ChangesRequested && target == TaskPhase::Implementing {
            task.review_verdict = ReviewVerdict::Unreviewed;
            task.rework_rounds += 1;
        }
        match target {
            TaskPhase::Merged => task.integration_result = IntegrationResult::Merged,
            TaskPhase::Failed => task.integration_result = IntegrationResult::Failed,
            TaskPhase::Aborted => task.integration_result = IntegrationResult::Aborted,
            _ => {}
        }

        let now = Utc::now();
        task.phase = target;
        task.updated_at = now;
        task.history.push(PhaseHistoryEntry {
            phase: target,
            entered_at: now,
        });
        debug!(task = %id, %from, to = %target, "transition");
        Ok(task.clone())
    }

    /// Replace the task's touch-set.
    pub fn set_touch_set(&self, id: &TaskId, touch_set: TouchSet) -> Result<Task> {
        self.update(id, |task| {
            if task.is_terminal() {
                return Err(Error::AlreadyTerminal(task.id));
            }
            task.touch_set = touch_set;
            Ok(())
        })
    }

    pub fn record_error(&self, id: &TaskId, error: TaskError) -> Result<Task> {
        self.update(id, |task| {
            task.error = Some(error);
            Ok(())
        })
    }

    pub fn set_workspace(&self, id: &TaskId, handle: WorkspaceHandle) -> Result<Task> {
        self.update(id, |task| {
            task.workspace = Some(handle);
            Ok(())
        })
    }

    /// Detach the workspace handle, returning it if one was held.
    pub fn take_workspace(&self, id: &TaskId) -> Result<Option<WorkspaceHandle>> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        task.updated_at = Utc::now();
        Ok(task.workspace.take())
    }

    /// Record that `dependent` must integrate after `prerequisite`.
    pub fn add_dependency(&self, dependent: &TaskId, prerequisite: &TaskId) -> Result<()> {
        let mut tasks = self.tasks.write();
        if !tasks.contains_key(prerequisite) {
            return Err(Error::TaskNotFound(*prerequisite));
        }
        tasks
            .get_mut(dependent)
            .ok_or(Error::TaskNotFound(*dependent))?
            .depends_on
            .insert(*prerequisite);
        if let Some(pre) = tasks.get_mut(prerequisite) {
            pre.blocks.insert(*dependent);
        }
        Ok(())
    }

    fn update<F>(&self, id: &TaskId, f: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(id).ok_or(Error::TaskNotFound(*id))?;
        f(task)?;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}
