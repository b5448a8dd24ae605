use thiserror::Error;

use crate::core::task::{TaskId, TaskPhase};
use crate::orchestration::RunId;

/// A dependency cycle found while computing a merge order.
///
/// Cycles are design-time input errors: they are reported with every
/// member named and are never broken automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dependency cycle between tasks: {}", .members.join(", "))]
pub struct CycleError {
    /// Display names of every task that participates in a cycle, sorted.
    pub members: Vec<String>,
    /// Ids of the same tasks, in the same order as `members`.
    pub task_ids: Vec<TaskId>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid transition for task {task} from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskPhase,
        to: String,
    },

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Phase {phase} failed: {reason}")]
    PhaseFailure { phase: TaskPhase, reason: String },

    #[error("Merge conflict on: {}", .resources.join(", "))]
    MergeConflict { resources: Vec<String> },

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Unknown task name: {0}")]
    UnknownTask(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} has not reached a quiescent state")]
    RunNotQuiescent(RunId),

    #[error("Task {0} is already in a terminal state")]
    AlreadyTerminal(TaskId),

    #[error("Phase worker binary not found: {0}")]
    WorkerNotFound(String),
}

impl Error {
    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ProviderUnavailable(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
