//! Events broadcast while a run progresses.

use serde::{Deserialize, Serialize};

use crate::core::task::{ReviewVerdict, TaskId, TaskPhase};
use crate::orchestration::controller::RunStatus;
use crate::orchestration::sequencer::MergeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    PhaseStarted {
        task_id: TaskId,
        phase: TaskPhase,
    },
    PhaseCompleted {
        task_id: TaskId,
        phase: TaskPhase,
    },
    TouchSetUpdated {
        task_id: TaskId,
        touch_set: Vec<String>,
    },
    Verdict {
        task_id: TaskId,
        verdict: ReviewVerdict,
    },
    TaskFailed {
        task_id: TaskId,
        phase: TaskPhase,
        error: String,
    },
    TaskAborted {
        task_id: TaskId,
        phase: TaskPhase,
    },
    PlanRecomputed {
        order: Vec<TaskId>,
    },
    PlanFrozen {
        order: Vec<TaskId>,
    },
    MergeStarted {
        task_id: TaskId,
    },
    MergeFinished {
        task_id: TaskId,
        status: MergeStatus,
    },
    Reverted {
        task_id: TaskId,
        revision: String,
    },
    RunFinished {
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            RunEvent::PhaseStarted { task_id, .. }
            | RunEvent::PhaseCompleted { task_id, .. }
            | RunEvent::TouchSetUpdated { task_id, .. }
            | RunEvent::Verdict { task_id, .. }
            | RunEvent::TaskFailed { task_id, .. }
            | RunEvent::TaskAborted { task_id, .. }
            | RunEvent::MergeStarted { task_id }
            | RunEvent::MergeFinished { task_id, .. }
            | RunEvent::Reverted { task_id, .. } => Some(*task_id),
            RunEvent::PlanRecomputed { .. } | RunEvent::PlanFrozen { .. } | RunEvent::RunFinished { .. } => None,
        }
    }

    /// Whether the draft merge plan may be stale after this event.
    pub fn affects_plan(&self) -> bool {
        matches!(
            self,
            RunEvent::TouchSetUpdated { .. } | RunEvent::TaskAborted { .. }
        )
    }
}
