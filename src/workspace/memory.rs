//! In-memory workspace provider.
//!
//! The baseline is a list of revisions, each recording which tasks have been
//! merged into it. Behavior per task (observed touch-set, merge conflict,
//! failing validation, transient unavailability) comes from a
//! [`MemoryScript`] keyed by task name.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::core::task::{Resource, Task, TaskId, TouchSet};
use crate::error::Error;
use crate::workspace::{Baseline, MergeOutcome, ValidationOutcome, WorkspaceHandle, WorkspaceProvider};
use crate::Result;

/// Scripted provider behavior for one task.
#[derive(Debug, Clone, Default)]
pub struct MemoryScript {
    /// What `proposed_touch_set` reports for the task's workspace.
    pub touch_set: TouchSet,
    /// Merging reports a conflict on these resources.
    pub merge_conflict: Vec<Resource>,
    /// Validation fails while this task is part of the baseline.
    pub fail_validation: bool,
    /// Number of `allocate` calls that fail with `ProviderUnavailable` first.
    pub unavailable: u32,
}

#[derive(Debug, Clone)]
struct Revision {
    id: String,
    merged: Vec<TaskId>,
}

#[derive(Debug)]
struct State {
    revisions: Vec<Revision>,
    head: usize,
    live: HashMap<TaskId, String>,
    names: HashMap<TaskId, String>,
    released: HashSet<TaskId>,
    merge_log: Vec<TaskId>,
    unavailable: HashMap<String, u32>,
}

pub struct MemoryProvider {
    scripts: HashMap<String, MemoryScript>,
    state: Mutex<State>,
    merge_delay: Duration,
    merging: AtomicBool,
    overlaps: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            state: Mutex::new(State {
                revisions: vec![Revision {
                    id: "rev-0".to_string(),
                    merged: Vec::new(),
                }],
                head: 0,
                live: HashMap::new(),
                names: HashMap::new(),
                released: HashSet::new(),
                merge_log: Vec::new(),
                unavailable: HashMap::new(),
            }),
            merge_delay: Duration::ZERO,
            merging: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, task_name: impl Into<String>, script: MemoryScript) -> Self {
        let name = task_name.into();
        if script.unavailable > 0 {
            self.state.get_mut().unavailable.insert(name.clone(), script.unavailable);
        }
        self.scripts.insert(name, script);
        self
    }

    /// Hold each merge open for `delay`, making overlapping merges observable.
    pub fn with_merge_delay(mut self, delay: Duration) -> Self {
        self.merge_delay = delay;
        self
    }

    /// Current baseline revision id.
    pub fn head(&self) -> String {
        let state = self.state.lock();
        state.revisions[state.head].id.clone()
    }

    /// Tasks whose work is in the current baseline, in merge order.
    pub fn merged_tasks(&self) -> Vec<TaskId> {
        let state = self.state.lock();
        state.revisions[state.head].merged.clone()
    }

    /// Every merge attempt that advanced the baseline, including reverted ones.
    pub fn merge_log(&self) -> Vec<TaskId> {
        self.state.lock().merge_log.clone()
    }

    pub fn is_allocated(&self, task: &TaskId) -> bool {
        self.state.lock().live.contains_key(task)
    }

    pub fn was_released(&self, task: &TaskId) -> bool {
        self.state.lock().released.contains(task)
    }

    /// Number of times a merge started while another was in progress.
    pub fn overlapping_merges(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn script_for(&self, name: &str) -> MemoryScript {
        self.scripts.get(name).cloned().unwrap_or_default()
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceProvider for MemoryProvider {
    async fn allocate(&self, task: &Task, baseline: &Baseline) -> Result<WorkspaceHandle> {
        let mut state = self.state.lock();
        if let Some(remaining) = state.unavailable.get_mut(&task.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::ProviderUnavailable(format!(
                    "no workspace available for {}",
                    task.name
                )));
            }
        }
        let fork_point = state.revisions[state.head].id.clone();
        state.live.insert(task.id, task.name.clone());
        state.names.insert(task.id, task.name.clone());
        debug!(task = %task.id, baseline = %baseline.name, %fork_point, "memory workspace allocated");
        Ok(WorkspaceHandle {
            task_id: task.id,
            path: PathBuf::from(format!("/memory/{}", task.name)),
            branch: format!("{}/{}", baseline.name, task.name),
            fork_point,
        })
    }

    async fn release(&self, handle: &WorkspaceHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.live.remove(&handle.task_id);
        state.released.insert(handle.task_id);
        Ok(())
    }

    async fn proposed_touch_set(&self, handle: &WorkspaceHandle) -> Result<TouchSet> {
        let name = self
            .state
            .lock()
            .live
            .get(&handle.task_id)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("workspace for {} not allocated", handle.task_id)))?;
        Ok(self.script_for(&name).touch_set)
    }

    async fn merge(&self, handle: &WorkspaceHandle, _baseline: &Baseline) -> Result<MergeOutcome> {
        if self.merging.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.merge_delay.is_zero() {
            tokio::time::sleep(self.merge_delay).await;
        }

        let outcome = {
            let mut state = self.state.lock();
            let name = state.names.get(&handle.task_id).cloned().unwrap_or_default();
            let script = self.script_for(&name);
            if !script.merge_conflict.is_empty() {
                MergeOutcome::Conflict {
                    resources: script.merge_conflict,
                }
            } else {
                let previous = state.revisions[state.head].id.clone();
                let mut merged = state.revisions[state.head].merged.clone();
                merged.push(handle.task_id);
                let id = format!("rev-{}", state.revisions.len());
                state.revisions.push(Revision { id: id.clone(), merged });
                state.head = state.revisions.len() - 1;
                state.merge_log.push(handle.task_id);
                MergeOutcome::Merged {
                    revision: id,
                    previous,
                }
            }
        };

        self.merging.store(false, Ordering::SeqCst);
        Ok(outcome)
    }

    async fn validate(&self, _baseline: &Baseline) -> Result<ValidationOutcome> {
        let state = self.state.lock();
        let failing: Vec<String> = state.revisions[state.head]
            .merged
            .iter()
            .filter_map(|id| state.names.get(id))
            .filter(|name| self.script_for(name).fail_validation)
            .cloned()
            .collect();
        if failing.is_empty() {
            Ok(ValidationOutcome::Passed)
        } else {
            Ok(ValidationOutcome::Failed {
                detail: format!("checks failed after merging {}", failing.join(", ")),
            })
        }
    }

    async fn revert(&self, _baseline: &Baseline, revision: &str) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .revisions
            .iter()
            .position(|r| r.id == revision)
            .ok_or_else(|| Error::Validation(format!("unknown revision {}", revision)))?;
        // Reverting appends a revision equal to the target so history stays linear.
        let merged = state.revisions[index].merged.clone();
        let id = format!("rev-{}", state.revisions.len());
        state.revisions.push(Revision { id, merged });
        state.head = state.revisions.len() - 1;
        Ok(())
    }
}
