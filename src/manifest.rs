//! Task manifests: the TOML input of `swarm plan`, `run` and `simulate`.
//!
//! ```toml
//! [[task]]
//! name = "api"
//! description = "Add the orders endpoint"
//! depends_on = ["models"]
//! touch_set = ["src/api.rs"]
//!
//! [task.simulate]
//! verdicts = ["changes_requested", "approved"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::dag::{DependencyAnalyzer, MergePlan, TieBreak};
use crate::core::registry::{TaskFilter, TaskRegistry};
use crate::core::task::{ReviewVerdict, Task, TaskPhase, TaskSpec, TouchSet};
use crate::error::{Error, Result};
use crate::orchestration::worker::{ScriptedWorker, WorkerScript};
use crate::workspace::{MemoryProvider, MemoryScript};

/// Scripted behavior of a task under `swarm simulate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Simulation {
    pub fail_phase: Option<TaskPhase>,
    pub verdicts: Vec<ReviewVerdict>,
    pub merge_conflict: Vec<String>,
    pub fail_validation: bool,
    pub unavailable: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declared resources; the plan preview and simulation use these.
    #[serde(default)]
    pub touch_set: Vec<String>,
    #[serde(default)]
    pub simulate: Option<Simulation>,
}

impl TaskEntry {
    fn declared_touch_set(&self) -> TouchSet {
        self.touch_set.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Manifest::load");
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Names must be present and unique; dependencies must name tasks.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::Validation("manifest declares no tasks".to_string()));
        }
        let mut names = HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(Error::Validation("every task needs a name".to_string()));
            }
            if !names.insert(task.name.as_str()) {
                return Err(Error::Validation(format!("duplicate task name '{}'", task.name)));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(Error::UnknownTask(missing.clone()));
            }
        }
        Ok(())
    }

    pub fn specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|t| TaskSpec::new(t.name.clone(), t.description.clone()).with_priority(t.priority))
            .collect()
    }

    /// `(dependent, prerequisite)` name pairs.
    pub fn dependencies(&self) -> Vec<(String, String)> {
        self.tasks
            .iter()
            .flat_map(|t| t.depends_on.iter().map(move |d| (t.name.clone(), d.clone())))
            .collect()
    }

    /// Merge plan from the declared touch-sets, before any work runs.
    pub fn preview(&self, tie_break: Arc<dyn TieBreak>) -> Result<(Vec<Task>, MergePlan)> {
        let registry = TaskRegistry::new();
        for entry in &self.tasks {
            let id = registry.create(
                TaskSpec::new(entry.name.clone(), entry.description.clone()).with_priority(entry.priority),
            );
            registry.set_touch_set(&id, entry.declared_touch_set())?;
        }
        for (dependent, prerequisite) in self.dependencies() {
            let dependent = registry
                .find_by_name(&dependent)
                .ok_or(Error::UnknownTask(dependent))?;
            let prerequisite = registry
                .find_by_name(&prerequisite)
                .ok_or(Error::UnknownTask(prerequisite))?;
            registry.add_dependency(&dependent, &prerequisite)?;
        }
        let tasks = registry.list(&TaskFilter::all());
        let plan = DependencyAnalyzer::from_tasks(tasks.iter(), tie_break).compute_order()?;
        Ok((tasks, plan))
    }

    /// Phase worker that replays each task's declared touch-set and
    /// simulated outcomes.
    pub fn simulated_worker(&self) -> ScriptedWorker {
        self.tasks.iter().fold(ScriptedWorker::new(), |worker, entry| {
            let sim = entry.simulate.clone().unwrap_or_default();
            worker.with_script(
                entry.name.clone(),
                WorkerScript {
                    planned_touch_set: entry.declared_touch_set(),
                    touch_set: None,
                    fail_phase: sim.fail_phase,
                    verdicts: sim.verdicts,
                    unavailable: sim.unavailable,
                    delay: Duration::from_millis(sim.delay_ms),
                },
            )
        })
    }

    pub fn simulated_provider(&self) -> MemoryProvider {
        self.tasks.iter().fold(MemoryProvider::new(), |provider, entry| {
            let sim = entry.simulate.clone().unwrap_or_default();
            provider.with_script(
                entry.name.clone(),
                MemoryScript {
                    touch_set: entry.declared_touch_set(),
                    merge_conflict: sim.merge_conflict,
                    fail_validation: sim.fail_validation,
                    unavailable: 0,
                },
            )
        })
    }
}
