//! Phase workers perform the actual work of each pipeline phase.
//!
//! [`CommandPhaseWorker`] runs an external program in the task's workspace
//! and parses a JSON outcome from its stdout. [`ScriptedWorker`] produces
//! outcomes from per-task scripts for simulation and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::task::{ReviewVerdict, Task, TaskPhase, TouchSet};
use crate::error::{Error, Result};
use crate::workspace::WorkspaceHandle;

/// Default timeout for a single phase invocation (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Success,
    Failure,
}

/// Structured result of one phase invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    #[serde(default)]
    pub status: PhaseStatus,
    /// Planning: estimate. Implementing: resources actually modified.
    #[serde(default)]
    pub touch_set: Option<TouchSet>,
    /// Reviewing only.
    #[serde(default)]
    pub verdict: Option<ReviewVerdict>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl PhaseOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            status: PhaseStatus::Failure,
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn with_touch_set(mut self, touch_set: TouchSet) -> Self {
        self.touch_set = Some(touch_set);
        self
    }

    pub fn with_verdict(mut self, verdict: ReviewVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == PhaseStatus::Success
    }
}

#[async_trait]
pub trait PhaseWorker: Send + Sync {
    /// Perform `phase` for `task` inside `workspace`.
    ///
    /// `Err` is reserved for the worker being unreachable; a phase that ran
    /// and failed is an `Ok` outcome with `PhaseStatus::Failure`.
    async fn run(&self, phase: TaskPhase, task: &Task, workspace: &WorkspaceHandle) -> Result<PhaseOutcome>;
}

/// Runs a configured program per phase.
///
/// The program receives `SWARM_PHASE`, `SWARM_TASK_ID`, `SWARM_TASK_NAME`
/// and `SWARM_TASK_DESCRIPTION` and runs with the workspace as its working
/// directory. Its stdout should contain a JSON [`PhaseOutcome`]; the last
/// line that parses as one wins.
#[derive(Debug, Clone)]
pub struct CommandPhaseWorker {
    binary: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPhaseWorker {
    /// Resolve `program` on `PATH`.
    pub fn new(program: &str, args: Vec<String>) -> Result<Self> {
        let binary = which::which(program).map_err(|_| Error::WorkerNotFound(program.to_string()))?;
        Ok(Self::with_binary(binary, args))
    }

    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self {
            binary,
            args,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extract the outcome from the worker's stdout.
    pub fn parse_outcome(stdout: &str) -> Result<PhaseOutcome> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(PhaseOutcome::success());
        }
        if let Ok(outcome) = serde_json::from_str::<PhaseOutcome>(trimmed) {
            return Ok(outcome);
        }
        for line in trimmed.lines().rev() {
            let line = line.trim();
            if line.starts_with('{') {
                if let Ok(outcome) = serde_json::from_str::<PhaseOutcome>(line) {
                    return Ok(outcome);
                }
            }
        }
        // Plain output with a zero exit is a success without structured data.
        Ok(PhaseOutcome {
            summary: trimmed.lines().last().map(String::from),
            ..PhaseOutcome::success()
        })
    }
}

#[async_trait]
impl PhaseWorker for CommandPhaseWorker {
    async fn run(&self, phase: TaskPhase, task: &Task, workspace: &WorkspaceHandle) -> Result<PhaseOutcome> {
        debug!(task = %task.id, %phase, binary = %self.binary.display(), "running phase worker");
        let result = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(&self.args)
                .env("SWARM_PHASE", phase.to_string())
                .env("SWARM_TASK_ID", task.id.to_string())
                .env("SWARM_TASK_NAME", &task.name)
                .env("SWARM_TASK_DESCRIPTION", &task.description)
                .current_dir(&workspace.path)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Err(_) => {
                warn!(task = %task.id, %phase, timeout = ?self.timeout, "phase worker timed out");
                return Ok(PhaseOutcome::failure(format!(
                    "timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                return Err(Error::ProviderUnavailable(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim().to_string();
            return Ok(PhaseOutcome::failure(format!("exited with {}: {}", output.status, reason)));
        }
        Self::parse_outcome(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Scripted behavior of one task for [`ScriptedWorker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerScript {
    /// Touch-set estimate reported by planning.
    pub planned_touch_set: TouchSet,
    /// Touch-set reported by implementation; defaults to the estimate.
    pub touch_set: Option<TouchSet>,
    /// Phase that reports failure.
    pub fail_phase: Option<TaskPhase>,
    /// Verdict per review round; the last one repeats. Empty means approve.
    pub verdicts: Vec<ReviewVerdict>,
    /// Calls that fail as unavailable before the worker responds.
    pub unavailable: u32,
    /// Simulated time spent in each phase.
    pub delay: Duration,
}

/// Pauses a task inside a phase until released.
#[derive(Debug, Clone, Default)]
pub struct PhaseGate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl PhaseGate {
    /// Wait until the task is inside the gated phase.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the gated phase call return.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Default)]
struct ScriptProgress {
    reviews: usize,
    unavailable_left: Option<u32>,
}

/// Deterministic in-process worker driven by [`WorkerScript`]s keyed by
/// task name. Unscripted tasks succeed with empty touch-sets and approval.
#[derive(Default)]
pub struct ScriptedWorker {
    scripts: HashMap<String, WorkerScript>,
    gates: HashMap<(String, TaskPhase), PhaseGate>,
    progress: Mutex<HashMap<String, ScriptProgress>>,
    calls: Mutex<Vec<(String, TaskPhase)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, task_name: impl Into<String>, script: WorkerScript) -> Self {
        self.scripts.insert(task_name.into(), script);
        self
    }

    /// Install a gate on `phase` of `task_name` and return a handle to it.
    pub fn gate(&mut self, task_name: impl Into<String>, phase: TaskPhase) -> PhaseGate {
        self.gates
            .entry((task_name.into(), phase))
            .or_default()
            .clone()
    }

    /// Every phase call made, in call order.
    pub fn calls(&self) -> Vec<(String, TaskPhase)> {
        self.calls.lock().clone()
    }

    /// Phases run for one task, in order.
    pub fn phases_for(&self, task_name: &str) -> Vec<TaskPhase> {
        self.calls
            .lock()
            .iter()
            .filter(|(name, _)| name == task_name)
            .map(|(_, phase)| *phase)
            .collect()
    }

    /// Highest number of phase calls in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn outcome(&self, phase: TaskPhase, task: &Task, script: &WorkerScript) -> PhaseOutcome {
        if script.fail_phase == Some(phase) {
            return PhaseOutcome::failure(format!("scripted failure in {}", phase));
        }
        match phase {
            TaskPhase::Planning => PhaseOutcome::success().with_touch_set(script.planned_touch_set.clone()),
            TaskPhase::Implementing => PhaseOutcome::success().with_touch_set(
                script
                    .touch_set
                    .clone()
                    .unwrap_or_else(|| script.planned_touch_set.clone()),
            ),
            TaskPhase::Reviewing => {
                let mut progress = self.progress.lock();
                let entry = progress.entry(task.name.clone()).or_default();
                let round = entry.reviews;
                entry.reviews += 1;
                let verdict = script
                    .verdicts
                    .get(round)
                    .or(script.verdicts.last())
                    .copied()
                    .unwrap_or(ReviewVerdict::Approved);
                PhaseOutcome::success().with_verdict(verdict)
            }
            _ => PhaseOutcome::success(),
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PhaseWorker for ScriptedWorker {
    async fn run(&self, phase: TaskPhase, task: &Task, _workspace: &WorkspaceHandle) -> Result<PhaseOutcome> {
        let script = self.scripts.get(&task.name).cloned().unwrap_or_default();
        {
            let mut progress = self.progress.lock();
            let entry = progress.entry(task.name.clone()).or_default();
            let left = entry.unavailable_left.get_or_insert(script.unavailable);
            if *left > 0 {
                *left -= 1;
                return Err(Error::ProviderUnavailable(format!("worker busy for {}", task.name)));
            }
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push((task.name.clone(), phase));

        if let Some(gate) = self.gates.get(&(task.name.clone(), phase)) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        Ok(self.outcome(phase, task, &script))
    }
}
