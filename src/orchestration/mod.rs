//! Orchestration layer.
//!
//! The controller wires a phase scheduler (bounded concurrent phase work
//! per task) to a merge sequencer (strictly sequential integration in plan
//! order), both driven through the [`PhaseWorker`] and
//! [`WorkspaceProvider`](crate::workspace::WorkspaceProvider) collaborators.

pub mod controller;
pub mod events;
pub mod retry;
pub mod scheduler;
pub mod sequencer;
pub mod worker;

pub use controller::{Controller, OutcomeCause, RunId, RunReport, RunStatus, TaskOutcome};
pub use events::RunEvent;
pub use retry::RetryPolicy;
pub use scheduler::{PhaseResult, PhaseScheduler, SchedulerConfig};
pub use sequencer::{MergeEntry, MergeReport, MergeSequencer, MergeStatus};
pub use worker::{
    CommandPhaseWorker, PhaseGate, PhaseOutcome, PhaseStatus, PhaseWorker, ScriptedWorker,
    WorkerScript, DEFAULT_TIMEOUT_SECS,
};
