//! Phase scheduler.
//!
//! Drives each task through Exploring -> Planning -> Implementing ->
//! Reviewing via the phase worker. Phases of one task run strictly in
//! order; tasks run concurrently up to `max_concurrent`. Cancellation is
//! observed only between phases: an in-flight phase call always completes
//! before the task is aborted.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::registry::{TaskRegistry, Transition};
use crate::core::task::{ReviewVerdict, Task, TaskError, TaskErrorKind, TaskId, TaskPhase, TouchSet};
use crate::error::{Error, Result};
use crate::orchestration::events::RunEvent;
use crate::orchestration::retry::RetryPolicy;
use crate::orchestration::worker::{PhaseOutcome, PhaseWorker};
use crate::workspace::{Baseline, WorkspaceHandle, WorkspaceProvider};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_review_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_review_retries: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            max_review_retries: config.max_review_retries,
            retry: config.retry_policy(),
        }
    }
}

/// Where `advance` left a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Approved,
    Blocked { reason: String },
    Failed { phase: TaskPhase, reason: String },
    Aborted { phase: TaskPhase },
}

impl PhaseResult {
    /// Result for a task that has already left the pipeline.
    pub fn of(task: &Task) -> Option<Self> {
        let reason = || {
            task.error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default()
        };
        match task.phase {
            TaskPhase::Approved | TaskPhase::Merged => Some(PhaseResult::Approved),
            TaskPhase::Blocked => Some(PhaseResult::Blocked { reason: reason() }),
            TaskPhase::Failed => Some(PhaseResult::Failed {
                phase: task.error.as_ref().map(|e| e.phase).unwrap_or(TaskPhase::Failed),
                reason: reason(),
            }),
            TaskPhase::Aborted => Some(PhaseResult::Aborted {
                phase: task.error.as_ref().map(|e| e.phase).unwrap_or(TaskPhase::Aborted),
            }),
            _ => None,
        }
    }
}

pub struct PhaseScheduler {
    registry: Arc<TaskRegistry>,
    provider: Arc<dyn WorkspaceProvider>,
    worker: Arc<dyn PhaseWorker>,
    baseline: Baseline,
    config: SchedulerConfig,
    events: broadcast::Sender<RunEvent>,
    run_token: CancellationToken,
    tokens: Mutex<HashMap<TaskId, CancellationToken>>,
    /// Tasks already taken by `advance` or an idle abort.
    claimed: Mutex<HashSet<TaskId>>,
}

impl PhaseScheduler {
    pub fn new(
        registry: Arc<TaskRegistry>,
        provider: Arc<dyn WorkspaceProvider>,
        worker: Arc<dyn PhaseWorker>,
        baseline: Baseline,
        config: SchedulerConfig,
        events: broadcast::Sender<RunEvent>,
        run_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            provider,
            worker,
            baseline,
            config,
            events,
            run_token,
            tokens: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn WorkspaceProvider> {
        &self.provider
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// The task's cancellation token, a child of the run token.
    pub fn token_for(&self, task_id: &TaskId) -> CancellationToken {
        self.tokens
            .lock()
            .entry(*task_id)
            .or_insert_with(|| self.run_token.child_token())
            .clone()
    }

    /// Request cancellation; honored at the next phase boundary.
    pub fn cancel(&self, task_id: &TaskId) {
        debug!(task = %task_id, "cancellation requested");
        self.token_for(task_id).cancel();
    }

    pub fn is_cancelled(&self, task_id: &TaskId) -> bool {
        self.token_for(task_id).is_cancelled()
    }

    fn claim(&self, task_id: &TaskId) -> bool {
        self.claimed.lock().insert(*task_id)
    }

    pub(crate) fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    /// Abort a task that has not started yet. Returns `false` when the task
    /// is already being advanced.
    pub async fn abort_idle(&self, task_id: &TaskId) -> Result<bool> {
        if self.registry.get(task_id)?.phase != TaskPhase::Pending || !self.claim(task_id) {
            return Ok(false);
        }
        self.abort(task_id).await?;
        Ok(true)
    }

    /// Drive one task from `Pending` until it is approved, blocked, failed
    /// or aborted.
    pub async fn advance(&self, task_id: &TaskId) -> Result<PhaseResult> {
        if !self.claim(task_id) {
            let task = self.registry.get(task_id)?;
            return PhaseResult::of(&task)
                .ok_or_else(|| Error::Validation(format!("task {} is already being advanced", task.name)));
        }
        let task = self.registry.get(task_id)?;
        if task.phase != TaskPhase::Pending {
            return PhaseResult::of(&task).ok_or(Error::InvalidTransition {
                task: *task_id,
                from: task.phase,
                to: TaskPhase::Exploring.to_string(),
            });
        }

        let token = self.token_for(task_id);
        if token.is_cancelled() {
            return self.abort(task_id).await;
        }

        let handle = match self
            .config
            .retry
            .run("allocate", || self.provider.allocate(&task, &self.baseline))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let error = Self::collaborator_error(TaskPhase::Pending, &e);
                return self.fail(task_id, error, false).await;
            }
        };
        self.registry.set_workspace(task_id, handle.clone())?;
        debug!(task = %task_id, path = %handle.path.display(), "workspace allocated");

        for phase in [TaskPhase::Exploring, TaskPhase::Planning] {
            if token.is_cancelled() {
                return self.abort(task_id).await;
            }
            match self.run_phase(task_id, phase, &handle).await? {
                Ok(outcome) => {
                    if let (TaskPhase::Planning, Some(estimate)) = (phase, outcome.touch_set) {
                        self.update_touch_set(task_id, estimate)?;
                    }
                }
                Err(error) => return self.fail(task_id, error, true).await,
            }
        }

        loop {
            if token.is_cancelled() {
                return self.abort(task_id).await;
            }
            let outcome = match self.run_phase(task_id, TaskPhase::Implementing, &handle).await? {
                Ok(outcome) => outcome,
                // Implementation failures keep the workspace for inspection.
                Err(error) => return self.fail(task_id, error, false).await,
            };
            let mut touch_set = outcome.touch_set.unwrap_or_default();
            match self
                .config
                .retry
                .run("proposed_touch_set", || self.provider.proposed_touch_set(&handle))
                .await
            {
                Ok(observed) => touch_set.extend(observed),
                Err(e) => warn!(task = %task_id, error = %e, "could not read observed touch-set"),
            }
            self.update_touch_set(task_id, touch_set)?;

            if token.is_cancelled() {
                return self.abort(task_id).await;
            }
            let verdict = match self.run_phase(task_id, TaskPhase::Reviewing, &handle).await? {
                Ok(PhaseOutcome {
                    verdict: Some(verdict),
                    ..
                }) if verdict != ReviewVerdict::Unreviewed => verdict,
                Ok(_) => {
                    let error = TaskError::new(
                        TaskErrorKind::PhaseFailure,
                        TaskPhase::Reviewing,
                        "review produced no verdict",
                    );
                    self.registry.record_error(task_id, error)?;
                    ReviewVerdict::Blocked
                }
                Err(error) => {
                    self.registry.record_error(task_id, error)?;
                    ReviewVerdict::Blocked
                }
            };
            self.registry.transition(task_id, Transition::Verdict(verdict))?;
            info!(task = %task_id, %verdict, "review verdict");
            self.emit(RunEvent::Verdict {
                task_id: *task_id,
                verdict,
            });
            if token.is_cancelled() {
                return self.abort(task_id).await;
            }

            match verdict {
                ReviewVerdict::Approved => return Ok(PhaseResult::Approved),
                ReviewVerdict::ChangesRequested => {
                    let task = self.registry.get(task_id)?;
                    if task.rework_rounds >= self.config.max_review_retries {
                        let reason = format!(
                            "changes still requested after {} rework round(s)",
                            task.rework_rounds
                        );
                        let error = TaskError::new(
                            TaskErrorKind::ReviewEscalated,
                            TaskPhase::ChangesRequested,
                            reason.clone(),
                        );
                        self.registry.record_error(task_id, error)?;
                        self.registry
                            .transition(task_id, Transition::Phase(TaskPhase::Blocked))?;
                        warn!(task = %task_id, "review escalated to blocked");
                        if token.is_cancelled() {
                            return self.abort(task_id).await;
                        }
                        return Ok(PhaseResult::Blocked { reason });
                    }
                    info!(task = %task_id, round = task.rework_rounds + 1, "changes requested, reworking");
                }
                _ => {
                    let task = self.registry.get(task_id)?;
                    return Ok(PhaseResult::of(&task).unwrap_or(PhaseResult::Blocked {
                        reason: "blocked by review".to_string(),
                    }));
                }
            }
        }
    }

    /// Advance every task, at most `max_concurrent` at once.
    ///
    /// A fatal error (such as an invalid transition) cancels the run token so
    /// the remaining tasks abort at their next phase boundary, and is
    /// returned once every task has stopped.
    pub async fn run_all(self: &Arc<Self>, task_ids: Vec<TaskId>) -> Result<Vec<(TaskId, PhaseResult)>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut set = JoinSet::new();
        for task_id in task_ids {
            let scheduler = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::TaskJoin(e.to_string()))?;
                scheduler.advance(&task_id).await.map(|r| (task_id, r))
            });
        }

        let mut results = Vec::new();
        let mut fatal: Option<Error> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined.map_err(|e| Error::TaskJoin(e.to_string())).and_then(|r| r);
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(error = %e, "fatal scheduler error, cancelling run");
                    self.run_token.cancel();
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        results.sort_by_key(|(id, _)| self.registry.get(id).map(|t| t.sequence).unwrap_or(usize::MAX));
        Ok(results)
    }

    /// Enter `phase` and run the worker. The outer error is fatal; the inner
    /// one is the task's phase failure.
    async fn run_phase(
        &self,
        task_id: &TaskId,
        phase: TaskPhase,
        handle: &WorkspaceHandle,
    ) -> Result<std::result::Result<PhaseOutcome, TaskError>> {
        let task = self.registry.transition(task_id, Transition::Phase(phase))?;
        info!(task = %task_id, name = %task.name, %phase, "phase started");
        self.emit(RunEvent::PhaseStarted {
            task_id: *task_id,
            phase,
        });

        let result = self
            .config
            .retry
            .run(&phase.to_string(), || self.worker.run(phase, &task, handle))
            .await;
        Ok(match result {
            Ok(outcome) if outcome.is_success() => {
                info!(task = %task_id, %phase, "phase completed");
                self.emit(RunEvent::PhaseCompleted {
                    task_id: *task_id,
                    phase,
                });
                Ok(outcome)
            }
            Ok(outcome) => Err(TaskError::new(
                TaskErrorKind::PhaseFailure,
                phase,
                outcome
                    .summary
                    .unwrap_or_else(|| format!("{} failed", phase)),
            )),
            Err(e) => Err(Self::collaborator_error(phase, &e)),
        })
    }

    fn collaborator_error(phase: TaskPhase, e: &Error) -> TaskError {
        let kind = if e.is_transient() {
            TaskErrorKind::ProviderUnavailable
        } else {
            TaskErrorKind::PhaseFailure
        };
        TaskError::new(kind, phase, e.to_string())
    }

    fn update_touch_set(&self, task_id: &TaskId, touch_set: TouchSet) -> Result<()> {
        debug!(task = %task_id, resources = touch_set.len(), "touch-set updated");
        let resources: Vec<String> = touch_set.iter().cloned().collect();
        self.registry.set_touch_set(task_id, touch_set)?;
        self.emit(RunEvent::TouchSetUpdated {
            task_id: *task_id,
            touch_set: resources,
        });
        Ok(())
    }

    async fn fail(&self, task_id: &TaskId, error: TaskError, release: bool) -> Result<PhaseResult> {
        let phase = error.phase;
        let reason = error.message.clone();
        warn!(task = %task_id, %phase, %reason, "phase failed");
        self.registry.record_error(task_id, error)?;
        self.registry
            .transition(task_id, Transition::Phase(TaskPhase::Failed))?;
        self.emit(RunEvent::TaskFailed {
            task_id: *task_id,
            phase,
            error: reason.clone(),
        });
        if release {
            self.release_workspace(task_id).await?;
        }
        Ok(PhaseResult::Failed { phase, reason })
    }

    /// Move a task to `Aborted` and release its workspace.
    pub(crate) async fn abort(&self, task_id: &TaskId) -> Result<PhaseResult> {
        let task = self.registry.get(task_id)?;
        if task.is_terminal() {
            // Already settled by a concurrent cancel.
            if let Some(result) = PhaseResult::of(&task) {
                return Ok(result);
            }
        }
        let phase = task.phase;
        self.registry.record_error(
            task_id,
            TaskError::new(TaskErrorKind::Cancelled, phase, "cancelled"),
        )?;
        self.registry
            .transition(task_id, Transition::Phase(TaskPhase::Aborted))?;
        info!(task = %task_id, %phase, "task aborted");
        self.release_workspace(task_id).await?;
        self.emit(RunEvent::TaskAborted {
            task_id: *task_id,
            phase,
        });
        Ok(PhaseResult::Aborted { phase })
    }

    /// Release the task's workspace if it still holds one. Provider errors
    /// are logged, not propagated.
    pub(crate) async fn release_workspace(&self, task_id: &TaskId) -> Result<()> {
        if let Some(handle) = self.registry.take_workspace(task_id)? {
            if let Err(e) = self
                .config
                .retry
                .run("release", || self.provider.release(&handle))
                .await
            {
                warn!(task = %task_id, error = %e, "failed to release workspace");
            }
        }
        Ok(())
    }
}
