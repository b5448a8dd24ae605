//! Integration test suite for swarm.
//!
//! These tests drive whole runs through the controller, from submission to
//! the final report, and check that scheduling, planning and merging work
//! together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full pipeline runs and merge-plan ordering
//! - `parallel_tasks`: Bounded concurrency and serial merges
//! - `conflict_resolution`: Merge conflicts, validation reverts, blocked dependents
//! - `cancellation`: Cancelling tasks at each stage of a run
//! - `git_provider`: Runs against real git worktrees
//!
//! # CI Compatibility
//!
//! Phase work is scripted in-process; the git tests only need a `git`
//! binary and `sh`.

mod fixtures;

mod workflow_e2e;
mod parallel_tasks;
mod conflict_resolution;
mod git_provider;
