//! Core domain models for the orchestration engine.
//!
//! Tasks and their state machine, the task registry, and the dependency
//! analyzer that turns touch-sets and explicit dependencies into a merge plan.

pub mod dag;
pub mod registry;
pub mod task;

pub use dag::{
    DeclarationOrder, DependencyAnalyzer, EdgeKind, MergePlan, PlanEdge, PlanNode, TieBreak,
    TieBreakKind, TouchSetSize,
};
pub use registry::{TaskFilter, TaskRegistry, Transition};
pub use task::{
    IntegrationResult, ReviewVerdict, Task, TaskError, TaskErrorKind, TaskId, TaskPhase, TaskSpec,
    TouchSet,
};
