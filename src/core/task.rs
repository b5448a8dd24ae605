//! Task data model for the orchestration engine.
//!
//! Tasks are the units of independent work driven through the phase
//! pipeline. Each task tracks its phase, declared touch-set, explicit
//! dependencies, review verdict, integration result and last error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::workspace::WorkspaceHandle;

/// A resource identifier a task may modify (usually a repo-relative path).
pub type Resource = String;

/// The set of resources a task declares or is observed to modify.
pub type TouchSet = BTreeSet<Resource>;

/// Unique identifier for a task within a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Position of a task in the pipeline.
///
/// ```text
/// Pending -> Exploring -> Planning -> Implementing -> Reviewing
///     -> {Approved, ChangesRequested, Blocked} -> {Merged, Failed, Aborted}
/// ```
///
/// `ChangesRequested` loops back to `Implementing`. `Merged`, `Failed`
/// and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    Pending,
    Exploring,
    Planning,
    Implementing,
    Reviewing,
    Approved,
    ChangesRequested,
    Blocked,
    Merged,
    Failed,
    Aborted,
}

impl TaskPhase {
    /// No transition leaves a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Merged | TaskPhase::Failed | TaskPhase::Aborted)
    }

    /// Terminal, or parked waiting for an operator (`Blocked`).
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == TaskPhase::Blocked
    }

    /// Phases that delegate to the phase worker.
    pub fn is_work_phase(self) -> bool {
        matches!(
            self,
            TaskPhase::Exploring | TaskPhase::Planning | TaskPhase::Implementing | TaskPhase::Reviewing
        )
    }

    /// Check whether moving from `self` to `target` is allowed.
    pub fn can_transition(self, target: TaskPhase) -> bool {
        use TaskPhase::*;
        matches!(
            (self, target),
            (Pending, Exploring)
                | (Pending, Failed)
                | (Pending, Aborted)
                | (Exploring, Planning)
                | (Exploring, Failed)
                | (Exploring, Aborted)
                | (Planning, Implementing)
                | (Planning, Failed)
                | (Planning, Aborted)
                | (Implementing, Reviewing)
                | (Implementing, Failed)
                | (Implementing, Aborted)
                | (Reviewing, Approved)
                | (Reviewing, ChangesRequested)
                | (Reviewing, Blocked)
                | (Reviewing, Aborted)
                | (ChangesRequested, Implementing)
                | (ChangesRequested, Blocked)
                | (ChangesRequested, Aborted)
                | (Approved, Merged)
                | (Approved, Failed)
                | (Approved, Aborted)
                | (Blocked, Aborted)
        )
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Pending => "pending",
            TaskPhase::Exploring => "exploring",
            TaskPhase::Planning => "planning",
            TaskPhase::Implementing => "implementing",
            TaskPhase::Reviewing => "reviewing",
            TaskPhase::Approved => "approved",
            TaskPhase::ChangesRequested => "changes_requested",
            TaskPhase::Blocked => "blocked",
            TaskPhase::Merged => "merged",
            TaskPhase::Failed => "failed",
            TaskPhase::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Structured verdict produced by the review phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    #[default]
    Unreviewed,
    Approved,
    ChangesRequested,
    Blocked,
}

impl ReviewVerdict {
    /// The phase a task enters when this verdict is recorded.
    pub fn phase(self) -> Option<TaskPhase> {
        match self {
            ReviewVerdict::Unreviewed => None,
            ReviewVerdict::Approved => Some(TaskPhase::Approved),
            ReviewVerdict::ChangesRequested => Some(TaskPhase::ChangesRequested),
            ReviewVerdict::Blocked => Some(TaskPhase::Blocked),
        }
    }
}

impl std::fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewVerdict::Unreviewed => write!(f, "unreviewed"),
            ReviewVerdict::Approved => write!(f, "approved"),
            ReviewVerdict::ChangesRequested => write!(f, "changes_requested"),
            ReviewVerdict::Blocked => write!(f, "blocked"),
        }
    }
}

impl std::str::FromStr for ReviewVerdict {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "approved" | "approve" => Ok(ReviewVerdict::Approved),
            "changes_requested" | "request_changes" => Ok(ReviewVerdict::ChangesRequested),
            "blocked" => Ok(ReviewVerdict::Blocked),
            "unreviewed" => Ok(ReviewVerdict::Unreviewed),
            other => Err(format!("unknown review verdict: {}", other)),
        }
    }
}

/// Outcome of integrating a task into the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationResult {
    #[default]
    Pending,
    Merged,
    Failed,
    Aborted,
}

impl IntegrationResult {
    /// The terminal phase matching this result.
    pub fn phase(self) -> Option<TaskPhase> {
        match self {
            IntegrationResult::Pending => None,
            IntegrationResult::Merged => Some(TaskPhase::Merged),
            IntegrationResult::Failed => Some(TaskPhase::Failed),
            IntegrationResult::Aborted => Some(TaskPhase::Aborted),
        }
    }
}

impl std::fmt::Display for IntegrationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationResult::Pending => write!(f, "pending"),
            IntegrationResult::Merged => write!(f, "merged"),
            IntegrationResult::Failed => write!(f, "failed"),
            IntegrationResult::Aborted => write!(f, "aborted"),
        }
    }
}

/// Category of a recorded task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    PhaseFailure,
    ProviderUnavailable,
    MergeConflict,
    ValidationFailure,
    ReviewEscalated,
    Cancelled,
}

/// Last failure detail recorded against a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    /// Phase the task was in when the error was recorded.
    pub phase: TaskPhase,
    pub message: String,
    /// Resources involved (conflicting paths for merge conflicts).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    pub at: DateTime<Utc>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, phase: TaskPhase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
            resources: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn with_resources(mut self, resources: Vec<Resource>) -> Self {
        self.resources = resources;
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} during {}: {}", serde_kind(self.kind), self.phase, self.message)
    }
}

fn serde_kind(kind: TaskErrorKind) -> &'static str {
    match kind {
        TaskErrorKind::PhaseFailure => "phase failure",
        TaskErrorKind::ProviderUnavailable => "provider unavailable",
        TaskErrorKind::MergeConflict => "merge conflict",
        TaskErrorKind::ValidationFailure => "validation failure",
        TaskErrorKind::ReviewEscalated => "review escalated",
        TaskErrorKind::Cancelled => "cancelled",
    }
}

/// A record of a phase the task entered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub phase: TaskPhase,
    pub entered_at: DateTime<Utc>,
}

/// What the caller submits for each task of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Short unique name, used to reference the task in dependency pairs.
    pub name: String,
    /// Opaque description of intent handed to the phase worker.
    pub description: String,
    /// Higher priority wins conflict tie-breaks.
    #[serde(default)]
    pub priority: i32,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl From<&str> for TaskSpec {
    /// A bare description; the name is assigned at submission.
    fn from(description: &str) -> Self {
        Self::new("", description)
    }
}

/// A single task tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub priority: i32,
    /// Position in the submission, used by the default tie-break.
    pub sequence: usize,
    pub phase: TaskPhase,
    pub touch_set: TouchSet,
    pub depends_on: BTreeSet<TaskId>,
    /// Derived inverse of `depends_on`.
    pub blocks: BTreeSet<TaskId>,
    pub review_verdict: ReviewVerdict,
    pub integration_result: IntegrationResult,
    pub error: Option<TaskError>,
    pub workspace: Option<WorkspaceHandle>,
    /// Number of implementation rounds triggered by `ChangesRequested`.
    pub rework_rounds: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<PhaseHistoryEntry>,
}

impl Task {
    /// Create a task in the `Pending` phase.
    pub fn new(spec: &TaskSpec, sequence: usize) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            priority: spec.priority,
            sequence,
            phase: TaskPhase::Pending,
            touch_set: TouchSet::new(),
            depends_on: BTreeSet::new(),
            blocks: BTreeSet::new(),
            review_verdict: ReviewVerdict::Unreviewed,
            integration_result: IntegrationResult::Pending,
            error: None,
            workspace: None,
            rework_rounds: 0,
            created_at: now,
            updated_at: now,
            history: vec![PhaseHistoryEntry {
                phase: TaskPhase::Pending,
                entered_at: now,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_approved(&self) -> bool {
        self.review_verdict == ReviewVerdict::Approved && self.phase == TaskPhase::Approved
    }

    /// Whether the task ever passed through `phase`.
    pub fn visited(&self, phase: TaskPhase) -> bool {
        self.history.iter().any(|h| h.phase == phase)
    }

    /// Display label: the name, or the short id when unnamed.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.short()
        } else {
            self.name.clone()
        }
    }
}
