//! Orchestrator controller: the control surface of the engine.
//!
//! A run is submitted as a set of task specs plus explicit dependencies.
//! The controller validates the input, then drives the run in the
//! background: the phase scheduler advances every task while a listener
//! keeps the draft merge plan current; once every task has settled the plan
//! is frozen and handed to the merge sequencer.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::dag::{DependencyAnalyzer, MergePlan, TieBreak};
use crate::core::registry::{TaskFilter, TaskRegistry};
use crate::core::task::{IntegrationResult, ReviewVerdict, Task, TaskError, TaskId, TaskPhase, TaskSpec};
use crate::error::{Error, Result};
use crate::orchestration::events::RunEvent;
use crate::orchestration::scheduler::{PhaseScheduler, SchedulerConfig};
use crate::orchestration::sequencer::{MergeReport, MergeSequencer, MergeStatus};
use crate::orchestration::worker::PhaseWorker;
use crate::state::{RunSnapshot, RunStore};
use crate::workspace::{Baseline, WorkspaceProvider};

const EVENT_CAPACITY: usize = 1024;
const CANCEL_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Phase work in progress.
    Running,
    /// Plan frozen, sequencer integrating.
    Merging,
    Completed,
    Failed { reason: String },
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed { .. })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Merging => write!(f, "merging"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Why a task ended where it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "cause")]
pub enum OutcomeCause {
    /// The task's own result, successful or not.
    Independent,
    /// Skipped because `of` did not merge.
    Consequence { of: TaskId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub name: String,
    pub phase: TaskPhase,
    pub review_verdict: ReviewVerdict,
    pub integration_result: IntegrationResult,
    pub merge_status: Option<MergeStatus>,
    pub error: Option<TaskError>,
    pub cause: OutcomeCause,
}

/// Final, per-task account of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub plan: MergePlan,
    pub merge: MergeReport,
    pub tasks: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn build(run_id: RunId, status: RunStatus, plan: MergePlan, merge: MergeReport, tasks: &[Task]) -> Self {
        let tasks = tasks
            .iter()
            .map(|task| {
                let merge_status = merge.status_of(&task.id).cloned();
                let cause = match &merge_status {
                    Some(MergeStatus::BlockedByDependency { on }) => OutcomeCause::Consequence {
                        of: root_cause(&merge, *on),
                    },
                    _ => OutcomeCause::Independent,
                };
                TaskOutcome {
                    task_id: task.id,
                    name: task.name.clone(),
                    phase: task.phase,
                    review_verdict: task.review_verdict,
                    integration_result: task.integration_result,
                    merge_status,
                    error: task.error.clone(),
                    cause,
                }
            })
            .collect();
        Self {
            run_id,
            status,
            plan,
            merge,
            tasks,
        }
    }

    pub fn outcome(&self, task_id: &TaskId) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.task_id == *task_id)
    }

    pub fn outcome_by_name(&self, name: &str) -> Option<&TaskOutcome> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Every task merged.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed && self.tasks.iter().all(|t| t.phase == TaskPhase::Merged)
    }
}

/// Follow a chain of dependency skips back to the task that actually failed.
fn root_cause(merge: &MergeReport, mut current: TaskId) -> TaskId {
    let mut seen = HashSet::new();
    while let Some(MergeStatus::BlockedByDependency { on }) = merge.status_of(&current) {
        if !seen.insert(*on) {
            break;
        }
        current = *on;
    }
    current
}

struct Stage {
    status: RunStatus,
    plan: MergePlan,
    frozen: bool,
    report: Option<RunReport>,
}

struct Run {
    id: RunId,
    registry: Arc<TaskRegistry>,
    scheduler: Arc<PhaseScheduler>,
    tie_break: Arc<dyn TieBreak>,
    keep_failed_workspaces: bool,
    merge_lock: Arc<Mutex<()>>,
    store: Option<RunStore>,
    token: CancellationToken,
    events: broadcast::Sender<RunEvent>,
    /// Plan and status. Held while freezing so cancellation cannot race it.
    stage: Mutex<Stage>,
    done: CancellationToken,
}

impl Run {
    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    /// Plan over every task that has not been aborted.
    fn compute_plan(&self) -> std::result::Result<MergePlan, crate::error::CycleError> {
        let tasks: Vec<Task> = self
            .registry
            .list(&TaskFilter::all())
            .into_iter()
            .filter(|t| t.phase != TaskPhase::Aborted)
            .collect();
        DependencyAnalyzer::from_tasks(tasks.iter(), self.tie_break.clone()).compute_order()
    }

    async fn recompute_plan(&self) {
        let mut stage = self.stage.lock().await;
        if stage.frozen {
            return;
        }
        match self.compute_plan() {
            Ok(plan) if plan != stage.plan => {
                debug!(run = %self.id, tasks = plan.len(), edges = plan.edges.len(), "plan recomputed");
                let order = plan.order.clone();
                stage.plan = plan;
                self.emit(RunEvent::PlanRecomputed { order });
            }
            Ok(_) => {}
            Err(e) => warn!(run = %self.id, error = %e, "draft plan unavailable"),
        }
    }

    async fn cancel_task(&self, task_id: &TaskId) -> Result<()> {
        let task = self.registry.get(task_id)?;
        if task.is_terminal() {
            return Err(Error::AlreadyTerminal(*task_id));
        }
        info!(run = %self.id, task = %task_id, name = %task.name, phase = %task.phase, "cancelling task");
        self.scheduler.cancel(task_id);
        {
            let stage = self.stage.lock().await;
            match self.registry.get(task_id)?.phase {
                TaskPhase::Pending => {
                    self.scheduler.abort_idle(task_id).await?;
                }
                TaskPhase::Blocked => {
                    self.scheduler.abort(task_id).await?;
                }
                TaskPhase::Approved if !stage.frozen => {
                    self.scheduler.abort(task_id).await?;
                }
                // In-flight phases abort at their next boundary; frozen
                // approved tasks abort when the sequencer reaches them.
                _ => {}
            }
        }
        self.recompute_plan().await;
        Ok(())
    }

    fn resolve_task(&self, reference: &str) -> Option<TaskId> {
        self.registry.find_by_name(reference).or_else(|| {
            let id = reference.parse::<TaskId>().ok()?;
            self.registry.get(&id).ok().map(|t| t.id)
        })
    }

    async fn snapshot(&self) -> RunSnapshot {
        let stage = self.stage.lock().await;
        RunSnapshot {
            run_id: self.id,
            status: stage.status.clone(),
            tasks: self.registry.list(&TaskFilter::all()),
            plan: stage.plan.clone(),
            plan_frozen: stage.frozen,
            report: stage.report.clone(),
            updated_at: Utc::now(),
        }
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            let snapshot = self.snapshot().await;
            if let Err(e) = store.save(&snapshot).await {
                warn!(run = %self.id, error = %e, "failed to persist run snapshot");
            }
        }
    }

    async fn poll_cancel_requests(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let requests = match store.take_cancel_requests(&self.id) {
            Ok(requests) => requests,
            Err(e) => {
                warn!(run = %self.id, error = %e, "failed to read cancellation requests");
                return;
            }
        };
        for reference in requests {
            match self.resolve_task(&reference) {
                Some(task_id) => {
                    if let Err(e) = self.cancel_task(&task_id).await {
                        warn!(run = %self.id, task = %reference, error = %e, "cancellation request rejected");
                    }
                }
                None => warn!(run = %self.id, task = %reference, "cancellation request for unknown task"),
            }
        }
    }
}

/// Keeps the draft plan and the persisted snapshot current until `stop`.
async fn listen(run: Arc<Run>, mut events: broadcast::Receiver<RunEvent>, stop: CancellationToken) {
    let mut poll = tokio::time::interval(CANCEL_POLL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = events.recv() => match received {
                Ok(event) => {
                    if event.affects_plan() {
                        run.recompute_plan().await;
                    }
                    run.persist().await;
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(run = %run.id, missed, "event listener lagged");
                    run.recompute_plan().await;
                }
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => run.poll_cancel_requests().await,
        }
    }
}

async fn drive(run: Arc<Run>) {
    let stop = CancellationToken::new();
    let listener = tokio::spawn(listen(run.clone(), run.events.subscribe(), stop.clone()));
    let ids: Vec<TaskId> = run.registry.list(&TaskFilter::all()).iter().map(|t| t.id).collect();
    info!(run = %run.id, tasks = ids.len(), "run started");

    let (status, merge) = match run.scheduler.run_all(ids).await {
        Ok(_) => integrate(&run).await,
        Err(e) => {
            error!(run = %run.id, error = %e, "run aborted by fatal error");
            run.token.cancel();
            (
                RunStatus::Failed { reason: e.to_string() },
                MergeReport::default(),
            )
        }
    };

    {
        let mut stage = run.stage.lock().await;
        let tasks = run.registry.list(&TaskFilter::all());
        stage.report = Some(RunReport::build(run.id, status.clone(), stage.plan.clone(), merge, &tasks));
        stage.status = status.clone();
    }
    info!(run = %run.id, %status, "run finished");
    run.emit(RunEvent::RunFinished { status });
    stop.cancel();
    if let Err(e) = listener.await {
        warn!(run = %run.id, error = %e, "event listener ended abnormally");
    }
    run.persist().await;
    run.done.cancel();
}

/// Freeze the plan and run the sequencer over it.
async fn integrate(run: &Arc<Run>) -> (RunStatus, MergeReport) {
    let plan = {
        let mut stage = run.stage.lock().await;
        match run.compute_plan() {
            Ok(plan) => {
                stage.plan = plan;
                stage.frozen = true;
                stage.status = RunStatus::Merging;
                stage.plan.clone()
            }
            Err(e) => {
                return (
                    RunStatus::Failed { reason: e.to_string() },
                    MergeReport::default(),
                )
            }
        }
    };
    info!(run = %run.id, order = ?plan.order, "plan frozen");
    run.emit(RunEvent::PlanFrozen {
        order: plan.order.clone(),
    });

    let sequencer = MergeSequencer::new(run.scheduler.clone(), run.keep_failed_workspaces)
        .with_merge_lock(run.merge_lock.clone());
    match sequencer.run(&plan).await {
        Ok(report) => (RunStatus::Completed, report),
        Err(e) => {
            error!(run = %run.id, error = %e, "merge sequence aborted");
            (
                RunStatus::Failed { reason: e.to_string() },
                MergeReport::default(),
            )
        }
    }
}

pub struct Controller {
    config: Config,
    provider: Arc<dyn WorkspaceProvider>,
    worker: Arc<dyn PhaseWorker>,
    baseline: Baseline,
    /// One baseline, one merge at a time, across every run.
    merge_lock: Arc<Mutex<()>>,
    store: Option<RunStore>,
    runs: RwLock<HashMap<RunId, Arc<Run>>>,
}

impl Controller {
    pub fn new(
        config: Config,
        provider: Arc<dyn WorkspaceProvider>,
        worker: Arc<dyn PhaseWorker>,
        baseline: Baseline,
    ) -> Self {
        Self {
            config,
            provider,
            worker,
            baseline,
            merge_lock: Arc::new(Mutex::new(())),
            store: None,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Persist run snapshots to `store`.
    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.read().keys().copied().collect()
    }

    fn run(&self, run_id: &RunId) -> Result<Arc<Run>> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or(Error::RunNotFound(*run_id))
    }

    /// Register the tasks and start driving them.
    ///
    /// `dependencies` are `(dependent, prerequisite)` task-name pairs.
    /// Duplicate or unknown names and dependency cycles are rejected before
    /// any work starts.
    pub async fn submit(&self, specs: Vec<TaskSpec>, dependencies: Vec<(String, String)>) -> Result<RunId> {
        self.submit_with_id(RunId::new(), specs, dependencies).await
    }

    /// [`submit`](Self::submit) under a caller-chosen id, for providers that
    /// name their branches after the run.
    pub async fn submit_with_id(
        &self,
        run_id: RunId,
        specs: Vec<TaskSpec>,
        dependencies: Vec<(String, String)>,
    ) -> Result<RunId> {
        if self.runs.read().contains_key(&run_id) {
            return Err(Error::Validation(format!("run {} already exists", run_id)));
        }
        if specs.is_empty() {
            return Err(Error::Validation("no tasks submitted".to_string()));
        }
        let registry = Arc::new(TaskRegistry::new());
        let mut names = HashSet::new();
        for (i, mut spec) in specs.into_iter().enumerate() {
            if spec.name.is_empty() {
                spec.name = format!("task-{}", i + 1);
            }
            if !names.insert(spec.name.clone()) {
                return Err(Error::Validation(format!("duplicate task name '{}'", spec.name)));
            }
            registry.create(spec);
        }
        for (dependent, prerequisite) in &dependencies {
            let dependent_id = registry
                .find_by_name(dependent)
                .ok_or_else(|| Error::UnknownTask(dependent.clone()))?;
            let prerequisite_id = registry
                .find_by_name(prerequisite)
                .ok_or_else(|| Error::UnknownTask(prerequisite.clone()))?;
            registry.add_dependency(&dependent_id, &prerequisite_id)?;
        }

        let tie_break = self.config.tie_break.build();
        let tasks = registry.list(&TaskFilter::all());
        let plan = DependencyAnalyzer::from_tasks(tasks.iter(), tie_break.clone()).compute_order()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let token = CancellationToken::new();
        let scheduler = Arc::new(PhaseScheduler::new(
            registry.clone(),
            self.provider.clone(),
            self.worker.clone(),
            self.baseline.clone(),
            SchedulerConfig::from(&self.config),
            events.clone(),
            token.clone(),
        ));
        let run = Arc::new(Run {
            id: run_id,
            registry,
            scheduler,
            tie_break,
            keep_failed_workspaces: self.config.keep_failed_workspaces,
            merge_lock: self.merge_lock.clone(),
            store: self.store.clone(),
            token,
            events,
            stage: Mutex::new(Stage {
                status: RunStatus::Running,
                plan,
                frozen: false,
                report: None,
            }),
            done: CancellationToken::new(),
        });
        self.runs.write().insert(run_id, run.clone());
        info!(run = %run_id, tasks = tasks.len(), dependencies = dependencies.len(), "run submitted");

        run.persist().await;
        tokio::spawn(drive(run));
        Ok(run_id)
    }

    /// Snapshot of every task in submission order.
    pub fn status(&self, run_id: &RunId) -> Result<Vec<Task>> {
        Ok(self.run(run_id)?.registry.list(&TaskFilter::all()))
    }

    pub fn task(&self, run_id: &RunId, task_id: &TaskId) -> Result<Task> {
        self.run(run_id)?.registry.get(task_id)
    }

    pub fn find_task(&self, run_id: &RunId, name: &str) -> Result<TaskId> {
        self.run(run_id)?
            .registry
            .find_by_name(name)
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// The current draft plan, or the frozen one once merging started.
    pub async fn plan(&self, run_id: &RunId) -> Result<MergePlan> {
        Ok(self.run(run_id)?.stage.lock().await.plan.clone())
    }

    pub async fn run_status(&self, run_id: &RunId) -> Result<RunStatus> {
        Ok(self.run(run_id)?.stage.lock().await.status.clone())
    }

    /// Cancel a task. Takes effect at the task's next phase boundary; an
    /// in-flight phase call always completes first.
    pub async fn cancel(&self, run_id: &RunId, task_id: &TaskId) -> Result<()> {
        self.run(run_id)?.cancel_task(task_id).await
    }

    pub fn subscribe(&self, run_id: &RunId) -> Result<broadcast::Receiver<RunEvent>> {
        Ok(self.run(run_id)?.events.subscribe())
    }

    pub fn is_quiescent(&self, run_id: &RunId) -> Result<bool> {
        Ok(self.run(run_id)?.done.is_cancelled())
    }

    /// The final report; fails with `RunNotQuiescent` while the run is active.
    pub async fn result(&self, run_id: &RunId) -> Result<RunReport> {
        let run = self.run(run_id)?;
        if !run.done.is_cancelled() {
            return Err(Error::RunNotQuiescent(*run_id));
        }
        let report = run.stage.lock().await.report.clone();
        report.ok_or(Error::RunNotQuiescent(*run_id))
    }

    /// Wait until the run is quiescent and return its report.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunReport> {
        self.run(run_id)?.done.cancelled().await;
        self.result(run_id).await
    }

    /// Release every workspace still held after the run. Returns how many
    /// were released.
    pub async fn cleanup(&self, run_id: &RunId) -> Result<usize> {
        let run = self.run(run_id)?;
        if !run.done.is_cancelled() {
            return Err(Error::RunNotQuiescent(*run_id));
        }
        let mut released = 0;
        for task in run.registry.list(&TaskFilter::all()) {
            if task.workspace.is_some() {
                run.scheduler.release_workspace(&task.id).await?;
                released += 1;
            }
        }
        info!(run = %run_id, released, "workspaces cleaned up");
        run.persist().await;
        Ok(released)
    }
}
